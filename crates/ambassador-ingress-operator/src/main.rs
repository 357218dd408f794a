use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::sleep;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ambassador_ingress_operator::config::OperatorConfig;
use ambassador_ingress_operator::controllers::retry::RetryTracker;
use ambassador_ingress_operator::controllers::{clusteringress, sweep, ControllerContext};
use ambassador_ingress_operator::health::{run_health_server, HealthState};
use ambassador_ingress_operator::leader::{LeaderElection, LeaderElectionConfig};
use ambassador_ingress_operator::store::{KubeStore, ObjectStore};

const SHUTDOWN_GRACE_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("ambassador-ingress-operator starting");

    // Missing gateway namespace is fatal before anything else happens
    let config = OperatorConfig::from_env().context("Invalid operator configuration")?;
    let leader_config =
        LeaderElectionConfig::from_env().context("Invalid leader election configuration")?;

    info!(
        ambassador_namespace = %config.ambassador_namespace,
        route_mirroring = config.route_mirroring,
        resync_secs = config.resync_interval.as_secs(),
        sweep_secs = config.sweep_interval.as_secs(),
        "Loaded configuration"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(kube_client.clone()));

    // Probes come up before leader election so standbys report live
    let health = Arc::new(HealthState::new(store.clone()));
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health, health_port).await {
            error!(error = %e, "Health check server failed");
        }
    });

    let leadership = match &leader_config {
        Some(lease) => {
            info!(
                lease = %lease.lease_name(),
                namespace = %lease.namespace(),
                holder = %lease.holder_id(),
                "Leader election enabled"
            );
            let election = LeaderElection::new(kube_client.clone(), lease);
            election.acquire().await;
            Some(tokio::spawn(election.hold()))
        }
        None => {
            info!("Leader election disabled");
            None
        }
    };

    let ctx = Arc::new(ControllerContext {
        store,
        config: Arc::new(config),
        retry_tracker: Arc::new(RetryTracker::new()),
    });

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let lost_leadership = async move {
        match leadership {
            Some(handle) => match handle.await {
                Ok(reason) => reason,
                Err(e) => anyhow::anyhow!("lease renewal task failed: {e}"),
            },
            None => std::future::pending().await,
        }
    };

    select! {
        _ = clusteringress::run(kube_client, ctx.clone()) => {
            bail!("ClusterIngress controller exited unexpectedly");
        }
        _ = sweep::run(ctx.clone()) => {
            bail!("Orphan sweep loop exited unexpectedly");
        }
        reason = lost_leadership => {
            error!(error = %reason, "Leadership lost, exiting");
            return Err(reason);
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    info!(
        grace_seconds = SHUTDOWN_GRACE_SECS,
        "Starting graceful shutdown"
    );
    sleep(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
    info!("Shutdown complete");

    Ok(())
}
