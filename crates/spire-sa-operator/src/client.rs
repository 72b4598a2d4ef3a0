//! SPIRE registration API client
//!
//! The registration API is a small HTTP+JSON service in front of the SPIRE
//! server:
//!
//! ```text
//! POST /v1/entries/add     {trustDomain, serviceAccount, namespace, cluster, kubeConfig}
//!                          -> 200 {"entryID": "...", "message": "..."}
//! POST /v1/entries/delete  same body, kubeConfig ignored
//!                          -> 200 on success
//! ```
//!
//! A 404 from the delete endpoint means the entry is already gone and is
//! treated as a successful revocation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::RegistryConfig;
use crate::registration::{EntryId, EntryResponse, RegistrationRequest};

const CREATE_PATH: &str = "/v1/entries/add";
const DELETE_PATH: &str = "/v1/entries/delete";

/// Trait for registry operations
///
/// Allows the reconciler to be tested against a mock registry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register an entry and return the id the registry assigned
    async fn create_entry(&self, request: &RegistrationRequest) -> Result<EntryId, RegistryError>;

    /// Revoke the entry matching the request
    async fn revoke_entry(&self, request: &RegistrationRequest) -> Result<(), RegistryError>;
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to reach SPIRE registration API: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("SPIRE registration API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to decode SPIRE registration API response: {0}")]
    Decode(String),
    #[error("SPIRE registration API response has an empty entryID")]
    EmptyEntryId,
    #[error("Invalid SPIRE registration API URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Coarse failure class, used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFailure {
    /// The registry could not be reached
    Transport,
    /// The registry answered with something other than success
    Protocol,
}

impl RegistryError {
    pub fn kind(&self) -> RegistryFailure {
        match self {
            RegistryError::Transport(_) => RegistryFailure::Transport,
            RegistryError::Status { .. }
            | RegistryError::Decode(_)
            | RegistryError::EmptyEntryId
            | RegistryError::InvalidBaseUrl { .. } => RegistryFailure::Protocol,
        }
    }
}

/// reqwest-backed [`RegistryClient`]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    create_url: Url,
    delete_url: Url,
}

impl HttpRegistryClient {
    /// Build a client from the registry configuration
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        Self::new_with_base_url(&config.base_url(), config.request_timeout)
    }

    /// Build a client for an explicit base URL such as `http://spire-api:8080`
    pub fn new_with_base_url(base_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason,
        };
        let base = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("not a base URL".to_string()));
        }
        let create_url = base.join(CREATE_PATH).map_err(|e| invalid(e.to_string()))?;
        let delete_url = base.join(DELETE_PATH).map_err(|e| invalid(e.to_string()))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            create_url,
            delete_url,
        })
    }

    /// Read the body of a failed response for diagnostics
    async fn error_body(response: reqwest::Response) -> String {
        response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    #[instrument(
        skip(self, request),
        fields(
            namespace = %request.namespace,
            service_account = %request.service_account,
            cluster = %request.cluster
        )
    )]
    async fn create_entry(&self, request: &RegistrationRequest) -> Result<EntryId, RegistryError> {
        debug!(
            url = %self.create_url,
            trust_domain = %request.trust_domain,
            has_kubeconfig = !request.kube_config.is_empty(),
            "Creating SPIRE entry"
        );

        let response = self
            .client
            .post(self.create_url.clone())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = Self::error_body(response).await;
            warn!(status = %status, body = %body, "Entry creation rejected");
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let entry: EntryResponse = serde_json::from_str(&body)
            .map_err(|e| RegistryError::Decode(format!("{e}: {body}")))?;

        if entry.entry_id.is_empty() {
            return Err(RegistryError::EmptyEntryId);
        }

        debug!(entry_id = %entry.entry_id, message = %entry.message, "Created SPIRE entry");
        Ok(EntryId::new(entry.entry_id))
    }

    #[instrument(
        skip(self, request),
        fields(
            namespace = %request.namespace,
            service_account = %request.service_account,
            cluster = %request.cluster
        )
    )]
    async fn revoke_entry(&self, request: &RegistrationRequest) -> Result<(), RegistryError> {
        debug!(url = %self.delete_url, "Revoking SPIRE entry");

        // The registry ignores the credential on delete; never send one.
        let body = RegistrationRequest {
            kube_config: String::new(),
            ..request.clone()
        };

        let response = self
            .client
            .post(self.delete_url.clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!("SPIRE entry already absent");
            return Ok(());
        }

        if status != StatusCode::OK {
            let body = Self::error_body(response).await;
            warn!(status = %status, body = %body, "Entry revocation rejected");
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Revoked SPIRE entry");
        Ok(())
    }
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: RegistryClient + ?Sized> RegistryClient for Arc<T> {
    async fn create_entry(&self, request: &RegistrationRequest) -> Result<EntryId, RegistryError> {
        (**self).create_entry(request).await
    }

    async fn revoke_entry(&self, request: &RegistrationRequest) -> Result<(), RegistryError> {
        (**self).revoke_entry(request).await
    }
}
