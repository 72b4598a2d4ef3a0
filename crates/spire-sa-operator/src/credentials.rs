//! Admin kubeconfig lookup
//!
//! The registry receives the admin kubeconfig base64-encoded so it can reach the
//! cluster when issuing SVIDs for it.

use std::sync::Arc;

use base64::Engine;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::SecretRef;
use crate::store::{ObjectStore, StoreError};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Admin credential Secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("Admin credential Secret {namespace}/{name} has no data")]
    Empty { namespace: String, name: String },
    #[error("Admin credential Secret has no {key} entry")]
    MissingKey { key: String },
    #[error("Failed to read admin credential Secret: {0}")]
    Store(#[from] StoreError),
}

pub struct AdminCredentialProvider {
    store: Arc<dyn ObjectStore>,
    location: SecretRef,
}

impl AdminCredentialProvider {
    pub fn new(store: Arc<dyn ObjectStore>, location: SecretRef) -> Self {
        Self { store, location }
    }

    /// Read the credential bundle and return it base64-encoded
    #[instrument(skip(self), fields(namespace = %self.location.namespace, name = %self.location.name))]
    pub async fn encoded(&self) -> Result<String, CredentialError> {
        let secret = self
            .store
            .get_secret(&self.location.namespace, &self.location.name)
            .await?
            .ok_or_else(|| CredentialError::NotFound {
                namespace: self.location.namespace.clone(),
                name: self.location.name.clone(),
            })?;

        let data = secret
            .data
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CredentialError::Empty {
                namespace: self.location.namespace.clone(),
                name: self.location.name.clone(),
            })?;

        let raw = data
            .get(&self.location.data_key)
            .filter(|v| !v.0.is_empty())
            .ok_or_else(|| CredentialError::MissingKey {
                key: self.location.data_key.clone(),
            })?;

        debug!(bytes = raw.0.len(), "Loaded admin credential");
        Ok(base64::engine::general_purpose::STANDARD.encode(&raw.0))
    }
}
