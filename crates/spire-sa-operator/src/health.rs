//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metadata::ClusterMetadataProvider;

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
    /// Readiness requires the cluster metadata to resolve.
    metadata: Arc<ClusterMetadataProvider>,
}

impl HealthState {
    pub fn new(metadata: Arc<ClusterMetadataProvider>) -> Self {
        Self {
            started: AtomicBool::new(false),
            metadata,
        }
    }

    /// Mark the operator as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Run the health check HTTP server until `shutdown` fires.
///
/// The operator is marked as started only after the server successfully binds,
/// so readiness can't succeed before the probes are reachable.
pub async fn run_health_server(
    state: Arc<HealthState>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state.clone());

    // Probes come from the kubelet inside the pod network namespace
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = port, "Health check server listening");

    state.mark_started();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Liveness probe endpoint.
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable if:
/// - Startup has not completed
/// - The cluster metadata ConfigMap is missing or unusable, in which case no
///   ServiceAccount could be registered or revoked
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    match state.metadata.resolve().await {
        Ok(_) => {
            debug!("Readiness probe: OK");
            StatusCode::OK
        }
        Err(e) => {
            warn!(error = %e, "Readiness probe: NOT READY (cluster metadata unavailable)");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
