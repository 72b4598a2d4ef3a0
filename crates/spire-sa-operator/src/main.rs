use std::sync::Arc;

use anyhow::{Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use spire_sa_operator::client::HttpRegistryClient;
use spire_sa_operator::config::OperatorConfig;
use spire_sa_operator::controllers::{serviceaccount, ControllerContext};
use spire_sa_operator::health::{run_health_server, HealthState};
use spire_sa_operator::store::KubeStore;

/// Used when RUST_LOG is unset
const DEFAULT_LOG_FILTER: &str = "info,spire_sa_operator=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("spire-sa-operator starting");

    let config = OperatorConfig::load().context("Failed to load operator configuration")?;

    info!(
        registry = %config.registry.base_url(),
        cluster_metadata = %format!(
            "{}/{}",
            config.cluster_metadata.namespace, config.cluster_metadata.name
        ),
        admin_credential = %format!(
            "{}/{}",
            config.admin_credential.namespace, config.admin_credential.name
        ),
        retry_delay_secs = config.retry.retry_delay.as_secs(),
        reconcile_timeout_secs = config.reconcile_timeout.as_secs(),
        "Loaded configuration"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let registry =
        HttpRegistryClient::new(&config.registry).context("Failed to create SPIRE registry client")?;

    let shutdown = CancellationToken::new();
    let ctx = Arc::new(ControllerContext::new(
        Arc::new(KubeStore::new(kube_client.clone())),
        Arc::new(registry),
        Arc::new(config),
        shutdown.clone(),
    ));

    // Setup signal handlers before anything long-running starts
    let sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;
    tokio::spawn(cancel_on_signal(sigterm, sigint, shutdown.clone()));

    let health_state = Arc::new(HealthState::new(ctx.metadata.clone()));
    let health = tokio::spawn(run_health_server(
        health_state,
        ctx.config.health_port,
        shutdown.clone(),
    ));

    // Returns once the controller has drained after SIGTERM/SIGINT
    serviceaccount::run(kube_client, ctx.clone()).await;
    shutdown.cancel();

    match health.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health check server failed"),
        Err(e) => error!(error = %e, "Health check server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on the first SIGTERM or SIGINT
async fn cancel_on_signal(mut sigterm: Signal, mut sigint: Signal, shutdown: CancellationToken) {
    select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }
    shutdown.cancel();
}
