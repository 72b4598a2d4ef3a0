//! Test fixtures shared by the unit tests

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;

use crate::config::{annotations, defaults, IdentityKeys};
use crate::store::{ObjectStore, StoreError};

type Key = (String, String);

fn key_of(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn api_error(code: u16, reason: &str) -> StoreError {
    StoreError::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {reason}"),
        reason: reason.to_string(),
        code,
    }))
}

#[derive(Default)]
struct Objects {
    service_accounts: HashMap<Key, ServiceAccount>,
    config_maps: HashMap<Key, ConfigMap>,
    secrets: HashMap<Key, Secret>,
    replace_calls: usize,
    /// Replaces allowed to succeed before every further one fails
    replace_budget: Option<usize>,
}

/// In-memory [`ObjectStore`] behaving like the API server for the calls the
/// reconciler makes.
///
/// Replaces are checked against the stored `resourceVersion` and bump it. An
/// object that is being deleted disappears once its last finalizer is removed.
#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<Objects>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_service_account(&self, mut sa: ServiceAccount) {
        if sa.metadata.resource_version.is_none() {
            sa.metadata.resource_version = Some("1".to_string());
        }
        let mut objects = self.objects.lock().unwrap();
        objects.service_accounts.insert(key_of(&sa.metadata), sa);
    }

    pub fn insert_config_map(&self, cm: ConfigMap) {
        let mut objects = self.objects.lock().unwrap();
        objects.config_maps.insert(key_of(&cm.metadata), cm);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let mut objects = self.objects.lock().unwrap();
        objects.secrets.insert(key_of(&secret.metadata), secret);
    }

    pub fn stored_service_account(&self, namespace: &str, name: &str) -> Option<ServiceAccount> {
        let objects = self.objects.lock().unwrap();
        objects
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Number of replace calls made, successful or not
    pub fn replace_count(&self) -> usize {
        self.objects.lock().unwrap().replace_calls
    }

    /// Let `n` more replaces succeed, then fail every later one
    pub fn fail_replaces_after(&self, n: usize) {
        self.objects.lock().unwrap().replace_budget = Some(n);
    }

    /// Let every later replace through again
    pub fn allow_replaces(&self) {
        self.objects.lock().unwrap().replace_budget = None;
    }

    /// Simulate a delete request against an object holding finalizers
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(sa) = objects
            .service_accounts
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            sa.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
            sa.metadata.resource_version = Some(next_version(&sa.metadata));
        }
    }

    /// Simulate a write by another client
    pub fn touch_service_account(&self, namespace: &str, name: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(sa) = objects
            .service_accounts
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            sa.metadata.resource_version = Some(next_version(&sa.metadata));
        }
    }
}

fn next_version(meta: &ObjectMeta) -> String {
    let current: u64 = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    (current + 1).to_string()
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StoreError> {
        Ok(self.stored_service_account(namespace, name))
    }

    async fn replace_service_account(
        &self,
        service_account: &ServiceAccount,
    ) -> Result<ServiceAccount, StoreError> {
        let mut objects = self.objects.lock().unwrap();
        objects.replace_calls += 1;

        if let Some(budget) = objects.replace_budget.as_mut() {
            if *budget == 0 {
                return Err(api_error(500, "InternalError"));
            }
            *budget -= 1;
        }

        let key = key_of(&service_account.metadata);
        let stored = objects
            .service_accounts
            .get(&key)
            .ok_or_else(|| api_error(404, "NotFound"))?;

        if stored.metadata.resource_version != service_account.metadata.resource_version {
            return Err(StoreError::Conflict {
                namespace: key.0,
                name: key.1,
            });
        }

        let mut updated = service_account.clone();
        updated.metadata.resource_version = Some(next_version(&stored.metadata));
        // Deletion marker is owned by the server
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());
        if released {
            objects.service_accounts.remove(&key);
        } else {
            objects.service_accounts.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Builder for ServiceAccount fixtures
pub struct ServiceAccountBuilder {
    sa: ServiceAccount,
}

pub fn service_account(namespace: &str, name: &str) -> ServiceAccountBuilder {
    ServiceAccountBuilder {
        sa: ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    }
}

impl ServiceAccountBuilder {
    pub fn annotation(mut self, key: &str, value: &str) -> Self {
        self.sa
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn managed(self) -> Self {
        self.annotation(&IdentityKeys::default().managed, "true")
    }

    pub fn registered(self, entry_id: &str) -> Self {
        let keys = IdentityKeys::default();
        self.annotation(&keys.entry_id, entry_id)
            .finalizer(&keys.finalizer)
    }

    pub fn finalizer(mut self, finalizer: &str) -> Self {
        self.sa
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_string());
        self
    }

    pub fn deleting(mut self) -> Self {
        self.sa.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        self
    }

    pub fn build(self) -> ServiceAccount {
        self.sa
    }
}

/// Cluster metadata ConfigMap at the default location
pub fn cluster_config_map(trust_domain: Option<&str>, document: Option<&str>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(defaults::CLUSTER_METADATA_NAME.to_string()),
            namespace: Some(defaults::CLUSTER_METADATA_NAMESPACE.to_string()),
            annotations: trust_domain.map(|td| {
                BTreeMap::from([(annotations::TRUST_DOMAIN.to_string(), td.to_string())])
            }),
            ..Default::default()
        },
        data: document.map(|doc| {
            BTreeMap::from([(defaults::CLUSTER_METADATA_KEY.to_string(), doc.to_string())])
        }),
        ..Default::default()
    }
}

/// Admin credential Secret at the default location
pub fn credential_secret(contents: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(defaults::ADMIN_CREDENTIAL_NAME.to_string()),
            namespace: Some(defaults::ADMIN_CREDENTIAL_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            defaults::ADMIN_CREDENTIAL_KEY.to_string(),
            ByteString(contents.to_vec()),
        )])),
        ..Default::default()
    }
}
