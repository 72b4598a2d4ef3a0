//! ServiceAccount controller
//!
//! Watches every ServiceAccount and registers the ones annotated with the
//! managed flag in the SPIRE registration API.
//!
//! ## Lifecycle
//!
//! - Managed, no entry id: write the registration-pending annotation and the
//!   finalizer, create an entry, then record its id and drop the pending
//!   annotation in a second update. If the pending annotation is already
//!   there, an earlier create may have succeeded unrecorded, so the identity
//!   is revoked before creating again. At most one unrecorded entry exists at
//!   any time, and the finalizer guarantees it is revoked on deletion.
//! - Managed, entry id present: nothing to do beyond making sure the
//!   finalizer is there.
//! - Managed and being deleted: revoke the entry, then drop the finalizer so
//!   the API server can remove the object. Revocation runs whatever the
//!   entry-id annotation says.
//!
//! Objects without the managed flag are never written to.
//!
//! Every reconcile is bounded by the configured deadline and aborts when the
//! shutdown token fires. Failures are not retried here; the controller
//! requeues them after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::Client as KubeClient;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{RegistryError, RegistryFailure};
use crate::metadata::MetadataError;
use crate::registration::{EntryId, ObjectKey, RegistrationRequest};
use crate::state::{self, IdentityState};
use crate::store::StoreError;

use super::retry::{requeue_action, ErrorKind};
use super::ControllerContext;

/// `error_kind` logged when registration goes ahead without the admin
/// credential. It never fails a reconcile, so it is not an [`ErrorKind`].
const CREDENTIAL_LOOKUP: &str = "credential_lookup";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Cluster metadata unavailable: {0}")]
    Configuration(#[from] MetadataError),
    #[error("SPIRE registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Failed to update ServiceAccount: {0}")]
    Persistence(#[source] StoreError),
    #[error("Failed to read ServiceAccount: {0}")]
    Lookup(#[source] StoreError),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Reconcile did not finish within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("Reconcile cancelled by shutdown")]
    Cancelled,
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Failing to read the ConfigMap is an API problem, not bad config
            ReconcileError::Configuration(MetadataError::Store(_)) => ErrorKind::Transport,
            ReconcileError::Configuration(_) => ErrorKind::Configuration,
            ReconcileError::Registry(e) => match e.kind() {
                RegistryFailure::Transport => ErrorKind::Transport,
                RegistryFailure::Protocol => ErrorKind::Protocol,
            },
            ReconcileError::Persistence(_) => ErrorKind::Persistence,
            ReconcileError::Lookup(_) => ErrorKind::Transport,
            ReconcileError::MissingField(_) => ErrorKind::Protocol,
            ReconcileError::DeadlineExceeded(_) => ErrorKind::Transport,
            ReconcileError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// What a successful reconcile did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The ServiceAccount no longer exists
    NotFound,
    /// Not opted in
    Unmanaged,
    /// Entry id and finalizer already present
    AlreadyRegistered,
    /// Entry id present, finalizer was missing and has been added
    FinalizerRepaired,
    /// A new entry was created and recorded
    Registered(EntryId),
    /// The entry was revoked
    Revoked { finalizer_removed: bool },
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::Unmanaged => "unmanaged",
            ReconcileOutcome::AlreadyRegistered => "already_registered",
            ReconcileOutcome::FinalizerRepaired => "finalizer_repaired",
            ReconcileOutcome::Registered(_) => "registered",
            ReconcileOutcome::Revoked { .. } => "revoked",
        }
    }
}

/// Bring one ServiceAccount in line with the registry.
///
/// Reads the live object, so the decision and any update are based on the
/// current `resourceVersion` rather than the watch cache.
#[instrument(skip(key, ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_identity(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let Some(service_account) = ctx
        .store
        .get_service_account(&key.namespace, &key.name)
        .await
        .map_err(ReconcileError::Lookup)?
    else {
        debug!("ServiceAccount no longer exists");
        return Ok(ReconcileOutcome::NotFound);
    };

    let state = IdentityState::observe(&service_account, &ctx.config.keys);
    debug!(state = state.as_str(), "Observed ServiceAccount");

    match state {
        IdentityState::Unmanaged => {
            debug!("ServiceAccount not managed, skipping");
            Ok(ReconcileOutcome::Unmanaged)
        }
        IdentityState::PendingRevocation {
            entry_id,
            has_finalizer,
        } => revoke(key, service_account, entry_id, has_finalizer, ctx).await,
        IdentityState::Registered {
            entry_id,
            has_finalizer: true,
        } => {
            debug!(entry_id = %entry_id, "ServiceAccount already registered");
            Ok(ReconcileOutcome::AlreadyRegistered)
        }
        IdentityState::Registered {
            entry_id,
            has_finalizer: false,
        } => repair_finalizer(service_account, &entry_id, ctx).await,
        IdentityState::PendingRegistration {
            intent_recorded, ..
        } => register(key, service_account, intent_recorded, ctx).await,
    }
}

async fn revoke(
    key: &ObjectKey,
    mut service_account: ServiceAccount,
    entry_id: Option<EntryId>,
    has_finalizer: bool,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let entry_id = entry_id.as_ref().map(EntryId::as_str).unwrap_or_default();
    // An unrecorded entry may exist; revocation by identity covers it too
    let registration_pending =
        state::has_registration_intent(&service_account.metadata, &ctx.config.keys);
    info!(
        entry_id,
        registration_pending, "ServiceAccount is being deleted, revoking SPIRE entry"
    );

    let cluster = ctx.metadata.resolve().await?;
    let request = RegistrationRequest::revocation(&cluster, key);
    ctx.registry.revoke_entry(&request).await?;
    info!(entry_id, "Revoked SPIRE entry");

    if !has_finalizer {
        return Ok(ReconcileOutcome::Revoked {
            finalizer_removed: false,
        });
    }

    state::remove_finalizer(&mut service_account.metadata, &ctx.config.keys.finalizer);
    ctx.store
        .replace_service_account(&service_account)
        .await
        .map_err(ReconcileError::Persistence)?;
    info!("Removed finalizer");

    Ok(ReconcileOutcome::Revoked {
        finalizer_removed: true,
    })
}

async fn repair_finalizer(
    mut service_account: ServiceAccount,
    entry_id: &EntryId,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    state::add_finalizer(&mut service_account.metadata, &ctx.config.keys.finalizer);
    ctx.store
        .replace_service_account(&service_account)
        .await
        .map_err(ReconcileError::Persistence)?;
    info!(entry_id = %entry_id, "Added missing finalizer to registered ServiceAccount");
    Ok(ReconcileOutcome::FinalizerRepaired)
}

async fn register(
    key: &ObjectKey,
    mut service_account: ServiceAccount,
    intent_recorded: bool,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    info!(intent_recorded, "ServiceAccount has no SPIRE entry, registering");

    let cluster = ctx.metadata.resolve().await?;

    let kube_config = match ctx.credentials.encoded().await {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!(
                error = %e,
                error_kind = CREDENTIAL_LOOKUP,
                "Admin credential unavailable, registering without it"
            );
            String::new()
        }
    };

    let keys = &ctx.config.keys;
    let mut service_account = if intent_recorded {
        warn!("Earlier registration attempt was not recorded, revoking before creating again");
        let revocation = RegistrationRequest::revocation(&cluster, key);
        ctx.registry.revoke_entry(&revocation).await?;
        service_account
    } else {
        // Deletion must revoke whatever the create call below leaves behind
        state::record_registration_intent(&mut service_account.metadata, keys);
        state::add_finalizer(&mut service_account.metadata, &keys.finalizer);
        let service_account = ctx
            .store
            .replace_service_account(&service_account)
            .await
            .map_err(ReconcileError::Persistence)?;
        debug!("Recorded registration intent");
        service_account
    };

    let request = RegistrationRequest::new(&cluster, key, kube_config);
    let entry_id = ctx.registry.create_entry(&request).await?;
    info!(entry_id = %entry_id, "Created SPIRE entry");

    state::set_entry_id(&mut service_account.metadata, keys, &entry_id);
    state::clear_registration_intent(&mut service_account.metadata, keys);
    state::add_finalizer(&mut service_account.metadata, &keys.finalizer);
    ctx.store
        .replace_service_account(&service_account)
        .await
        .map_err(|e| {
            error!(
                entry_id = %entry_id,
                error = %e,
                "Failed to record SPIRE entry id on ServiceAccount, it will be revoked before the next attempt"
            );
            ReconcileError::Persistence(e)
        })?;

    Ok(ReconcileOutcome::Registered(entry_id))
}

/// Run [`reconcile_identity`] under the configured deadline and the shutdown
/// token. Dropping the inner future aborts any request still in flight.
pub async fn reconcile_bounded(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let deadline = ctx.config.reconcile_timeout;

    tokio::select! {
        biased;
        _ = ctx.shutdown.cancelled() => Err(ReconcileError::Cancelled),
        result = tokio::time::timeout(deadline, reconcile_identity(key, ctx)) => match result {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::DeadlineExceeded(deadline)),
        },
    }
}

/// Controller entry point
pub async fn reconcile(
    service_account: Arc<ServiceAccount>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let name = service_account
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| ReconcileError::MissingField("metadata.name".to_string()))?;
    let namespace = service_account
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| ReconcileError::MissingField("metadata.namespace".to_string()))?;

    let key = ObjectKey::new(namespace, name);
    let outcome = reconcile_bounded(&key, &ctx).await?;
    debug!(
        namespace = %key.namespace,
        name = %key.name,
        outcome = outcome.as_str(),
        "ServiceAccount reconciled"
    );

    // Level-triggered: wait for the next change to the object
    Ok(Action::await_change())
}

/// Log the failure and requeue after the delay for its kind
fn error_policy(
    service_account: Arc<ServiceAccount>,
    error: &ReconcileError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let kind = error.kind();

    warn!(
        namespace = %service_account.metadata.namespace.as_deref().unwrap_or("unknown"),
        name = %service_account.metadata.name.as_deref().unwrap_or("unknown"),
        error = %error,
        error_kind = kind.as_str(),
        "ServiceAccount reconciliation failed"
    );

    requeue_action(kind, &ctx.config.retry)
}

/// Start the ServiceAccount controller
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let service_accounts: Api<ServiceAccount> = Api::all(client);

    info!("Starting ServiceAccount controller");

    Controller::new(service_accounts, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        namespace = obj.namespace.as_deref().unwrap_or(""),
                        name = %obj.name,
                        "ServiceAccount reconcile finished"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "ServiceAccount controller error");
                }
            }
        })
        .await;

    info!("ServiceAccount controller stopped");
}
