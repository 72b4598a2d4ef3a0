//! Kubernetes object access used by the reconciler
//!
//! The reconciler reads and writes cluster objects only through [`ObjectStore`],
//! which lets tests drive it with an in-memory store.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use kube::api::{Api, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conflicting update to {namespace}/{name}, object changed since it was read")]
    Conflict { namespace: String, name: String },
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Object missing required field: {0}")]
    MissingField(String),
}

/// Get/update access to the objects the operator touches
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a ServiceAccount, `None` if it does not exist
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StoreError>;

    /// Write back a ServiceAccount previously read from the store.
    ///
    /// The write is conditional on the object's `resourceVersion`; a concurrent
    /// modification fails with [`StoreError::Conflict`].
    async fn replace_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount, StoreError>;

    /// Fetch a ConfigMap, `None` if it does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError>;

    /// Fetch a Secret, `None` if it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;
}

/// [`ObjectStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>, StoreError>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    #[instrument(skip(self))]
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StoreError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    #[instrument(
        skip(self, service_account),
        fields(
            namespace = service_account.metadata.namespace.as_deref().unwrap_or(""),
            name = service_account.metadata.name.as_deref().unwrap_or("")
        )
    )]
    async fn replace_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount, StoreError> {
        let name = service_account
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| StoreError::MissingField("metadata.name".to_string()))?;
        let namespace = service_account
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| StoreError::MissingField("metadata.namespace".to_string()))?;

        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        match api
            .replace(name, &PostParams::default(), service_account)
            .await
        {
            Ok(updated) => {
                debug!(
                    resource_version = updated.metadata.resource_version.as_deref().unwrap_or(""),
                    "Replaced ServiceAccount"
                );
                Ok(updated)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(StoreError::Conflict {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }

    #[instrument(skip(self))]
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_optional(&api, name).await
    }
}
