//! Cluster metadata lookup
//!
//! Resolves the cluster name and trust domain from the kubeadm-style
//! ConfigMap: the trust domain comes from an annotation, the cluster name from
//! the YAML `ClusterConfiguration` document in its data.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::ClusterMetadataRef;
use crate::registration::ClusterContext;
use crate::store::{ObjectStore, StoreError};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Cluster metadata ConfigMap {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("Cluster metadata ConfigMap is missing the {annotation} annotation")]
    MissingTrustDomain { annotation: String },
    #[error("Cluster metadata ConfigMap has no {key} data")]
    MissingClusterConfiguration { key: String },
    #[error("Cluster configuration is not a valid YAML mapping: {0}")]
    InvalidClusterConfiguration(#[from] serde_yaml::Error),
    #[error("Cluster configuration has no clusterName")]
    MissingClusterName,
    #[error("Failed to read cluster metadata: {0}")]
    Store(#[from] StoreError),
}

/// The part of the cluster configuration document the operator needs.
///
/// Every other key in the document is ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterConfiguration {
    #[serde(default)]
    cluster_name: Option<String>,
}

/// Extract the [`ClusterContext`] from an already fetched ConfigMap
pub fn cluster_context_from(
    config_map: &ConfigMap,
    location: &ClusterMetadataRef,
) -> Result<ClusterContext, MetadataError> {
    let trust_domain = config_map
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&location.trust_domain_annotation))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MetadataError::MissingTrustDomain {
            annotation: location.trust_domain_annotation.clone(),
        })?;

    let document = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(&location.data_key))
        .ok_or_else(|| MetadataError::MissingClusterConfiguration {
            key: location.data_key.clone(),
        })?;

    let parsed: ClusterConfiguration = serde_yaml::from_str(document)?;

    let cluster_name = parsed
        .cluster_name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(MetadataError::MissingClusterName)?;

    Ok(ClusterContext {
        cluster_name,
        trust_domain: trust_domain.to_string(),
    })
}

/// Reads the cluster metadata ConfigMap on every call; nothing is cached
pub struct ClusterMetadataProvider {
    store: Arc<dyn ObjectStore>,
    location: ClusterMetadataRef,
}

impl ClusterMetadataProvider {
    pub fn new(store: Arc<dyn ObjectStore>, location: ClusterMetadataRef) -> Self {
        Self { store, location }
    }

    #[instrument(skip(self), fields(namespace = %self.location.namespace, name = %self.location.name))]
    pub async fn resolve(&self) -> Result<ClusterContext, MetadataError> {
        let config_map = self
            .store
            .get_config_map(&self.location.namespace, &self.location.name)
            .await?
            .ok_or_else(|| MetadataError::NotFound {
                namespace: self.location.namespace.clone(),
                name: self.location.name.clone(),
            })?;

        let context = cluster_context_from(&config_map, &self.location)?;
        debug!(
            cluster = %context.cluster_name,
            trust_domain = %context.trust_domain,
            "Resolved cluster metadata"
        );
        Ok(context)
    }
}
