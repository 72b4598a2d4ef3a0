//! Kubernetes controllers for watched resources

pub mod retry;
pub mod serviceaccount;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::RegistryClient;
use crate::config::OperatorConfig;
use crate::credentials::AdminCredentialProvider;
use crate::metadata::ClusterMetadataProvider;
use crate::store::ObjectStore;

/// Shared state for the controllers
pub struct ControllerContext {
    /// Cluster object access
    pub store: Arc<dyn ObjectStore>,
    /// SPIRE registration API
    pub registry: Arc<dyn RegistryClient>,
    /// Cluster name and trust domain lookup, shared with the readiness probe
    pub metadata: Arc<ClusterMetadataProvider>,
    /// Admin credential lookup
    pub credentials: AdminCredentialProvider,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Cancelled on shutdown; in-flight reconciles abort when it fires
    pub shutdown: CancellationToken,
}

impl ControllerContext {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        registry: Arc<dyn RegistryClient>,
        config: Arc<OperatorConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let metadata = Arc::new(ClusterMetadataProvider::new(
            store.clone(),
            config.cluster_metadata.clone(),
        ));
        let credentials =
            AdminCredentialProvider::new(store.clone(), config.admin_credential.clone());

        Self {
            store,
            registry,
            metadata,
            credentials,
            config,
            shutdown,
        }
    }
}
