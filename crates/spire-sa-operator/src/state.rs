//! Registration state of a ServiceAccount
//!
//! The state is never stored. It is derived on every reconcile from the
//! annotations, the finalizer and the deletion timestamp:
//!
//! | deletion marker | managed | entry-id | state                 |
//! |-----------------|---------|----------|-----------------------|
//! | any             | no      | any      | `Unmanaged`           |
//! | set             | yes     | any      | `PendingRevocation`   |
//! | unset           | yes     | set      | `Registered`          |
//! | unset           | yes     | unset    | `PendingRegistration` |
//!
//! The registration-pending annotation is written before the registry is asked
//! to create an entry and removed in the same update that records the entry
//! id. Seeing it without an entry id means an earlier create may have
//! succeeded without being recorded.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::IdentityKeys;
use crate::registration::EntryId;

/// Value the managed annotation must carry to opt in
const MANAGED_VALUE: &str = "true";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityState {
    /// Not opted in; the operator must not touch it
    Unmanaged,
    /// Managed but no entry recorded yet. `intent_recorded` is set when an
    /// earlier attempt got as far as the registry create call.
    PendingRegistration {
        has_finalizer: bool,
        intent_recorded: bool,
    },
    /// Entry recorded on the object
    Registered {
        entry_id: EntryId,
        has_finalizer: bool,
    },
    /// Deletion requested; the entry must be revoked before the finalizer goes
    PendingRevocation {
        entry_id: Option<EntryId>,
        has_finalizer: bool,
    },
}

impl IdentityState {
    /// Derive the state from the object as it currently is
    pub fn observe(service_account: &ServiceAccount, keys: &IdentityKeys) -> Self {
        let meta = &service_account.metadata;

        if !is_managed(meta, keys) {
            return IdentityState::Unmanaged;
        }

        let has_finalizer = has_finalizer(meta, &keys.finalizer);
        let entry_id = entry_id(meta, keys);

        if meta.deletion_timestamp.is_some() {
            return IdentityState::PendingRevocation {
                entry_id,
                has_finalizer,
            };
        }

        match entry_id {
            Some(entry_id) => IdentityState::Registered {
                entry_id,
                has_finalizer,
            },
            None => IdentityState::PendingRegistration {
                has_finalizer,
                intent_recorded: has_registration_intent(meta, keys),
            },
        }
    }

    /// Short name for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityState::Unmanaged => "unmanaged",
            IdentityState::PendingRegistration { .. } => "pending_registration",
            IdentityState::Registered { .. } => "registered",
            IdentityState::PendingRevocation { .. } => "pending_revocation",
        }
    }
}

/// True when the managed annotation is exactly `"true"`
pub fn is_managed(meta: &ObjectMeta, keys: &IdentityKeys) -> bool {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(&keys.managed))
        .is_some_and(|v| v == MANAGED_VALUE)
}

/// The recorded entry id, ignoring an empty annotation
pub fn entry_id(meta: &ObjectMeta, keys: &IdentityKeys) -> Option<EntryId> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(&keys.entry_id))
        .filter(|v| !v.is_empty())
        .map(|v| EntryId::new(v.clone()))
}

/// True when the registration-pending annotation is present, whatever its value
pub fn has_registration_intent(meta: &ObjectMeta, keys: &IdentityKeys) -> bool {
    meta.annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(&keys.registration_pending))
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

pub fn set_entry_id(meta: &mut ObjectMeta, keys: &IdentityKeys, entry_id: &EntryId) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(keys.entry_id.clone(), entry_id.as_str().to_string());
}

/// Record that a create call is about to be made
pub fn record_registration_intent(meta: &mut ObjectMeta, keys: &IdentityKeys) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(keys.registration_pending.clone(), "true".to_string());
}

pub fn clear_registration_intent(meta: &mut ObjectMeta, keys: &IdentityKeys) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(&keys.registration_pending);
    }
}

/// Add the finalizer; returns false if it was already present
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove every occurrence of the finalizer; returns false if it was absent
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    finalizers.len() != before
}
