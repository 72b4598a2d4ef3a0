//! Shared data model for SPIRE registration

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace/name pair identifying a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Cluster identity embedded in every registry entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterContext {
    pub cluster_name: String,
    pub trust_domain: String,
}

/// Body of both `/v1/entries/add` and `/v1/entries/delete`.
///
/// `kube_config` is always serialized; an empty string means no credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub trust_domain: String,
    pub service_account: String,
    pub namespace: String,
    pub cluster: String,
    #[serde(default)]
    pub kube_config: String,
}

impl RegistrationRequest {
    /// Build a request for the ServiceAccount identified by `key`
    pub fn new(cluster: &ClusterContext, key: &ObjectKey, kube_config: String) -> Self {
        Self {
            trust_domain: cluster.trust_domain.clone(),
            service_account: key.name.clone(),
            namespace: key.namespace.clone(),
            cluster: cluster.cluster_name.clone(),
            kube_config,
        }
    }

    /// Build a revocation request; the registry ignores the credential there
    pub fn revocation(cluster: &ClusterContext, key: &ObjectKey) -> Self {
        Self::new(cluster, key, String::new())
    }
}

/// Response body of `/v1/entries/add`
#[derive(Clone, Debug, Default, Deserialize)]
pub struct EntryResponse {
    #[serde(rename = "entryID", default)]
    pub entry_id: String,
    #[serde(default)]
    pub message: String,
}

/// Registry-assigned entry identifier, never parsed
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
