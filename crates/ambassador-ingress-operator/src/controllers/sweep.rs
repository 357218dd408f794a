//! Orphan sweep
//!
//! Gateway Services and mirrored Routes cannot carry owner references to the
//! cluster-scoped ClusterIngress, so the garbage collector never removes
//! them. This loop deletes managed objects whose ClusterIngress is gone or
//! no longer of the Ambassador class.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use kube::ResourceExt;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{annotations, labels};
use crate::store::StoreError;

use super::ControllerContext;

/// Counts from one sweep cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted_services: usize,
    pub deleted_routes: usize,
    pub kept: usize,
}

/// Run the sweep on the configured interval. Never returns.
pub async fn run(ctx: Arc<ControllerContext>) {
    let mut sweep_interval = interval(ctx.config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        interval_secs = ctx.config.sweep_interval.as_secs(),
        "Starting orphan sweep loop"
    );

    loop {
        sweep_interval.tick().await;

        match sweep_once(&ctx).await {
            Ok(report) if report.deleted_services > 0 || report.deleted_routes > 0 => {
                info!(
                    deleted_services = report.deleted_services,
                    deleted_routes = report.deleted_routes,
                    kept = report.kept,
                    "Orphan sweep cycle complete"
                );
            }
            Ok(report) => debug!(kept = report.kept, "Orphan sweep found nothing to delete"),
            Err(e) => error!(error = %e, "Orphan sweep cycle failed"),
        }
    }
}

/// Owner name from the ownership label, if any
fn owner_of<K: ResourceExt>(obj: &K) -> Option<&String> {
    obj.labels().get(labels::CLUSTER_INGRESS)
}

/// Treat an already-deleted object as success
fn ignore_not_found(result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Run a single sweep cycle.
///
/// Managed objects are listed before ClusterIngresses, so an object created
/// for an ingress during the cycle always finds that ingress in the list.
pub async fn sweep_once(ctx: &ControllerContext) -> Result<SweepReport> {
    let selector = labels::managed_selector();

    let services = ctx
        .store
        .list_services(&ctx.config.ambassador_namespace, &selector)
        .await
        .context("Failed to list managed Services")?;

    let routes = if ctx.config.route_mirroring {
        ctx.store
            .list_routes(&selector)
            .await
            .context("Failed to list managed Routes")?
    } else {
        Vec::new()
    };

    let live: HashSet<String> = ctx
        .store
        .list_cluster_ingresses()
        .await
        .context("Failed to list ClusterIngresses")?
        .into_iter()
        .filter(|ci| {
            ci.annotations().get(annotations::INGRESS_CLASS).map(String::as_str)
                == Some(annotations::AMBASSADOR_INGRESS_CLASS)
        })
        .map(|ci| ci.name_any())
        .collect();

    let active: Vec<String> = live.iter().cloned().collect();
    ctx.retry_tracker.cleanup(&active);

    let mut report = SweepReport::default();

    for service in &services {
        let Some(owner) = owner_of(service) else {
            warn!(name = %service.name_any(), "Managed Service has no ClusterIngress label, skipping");
            continue;
        };
        if live.contains(owner) {
            report.kept += 1;
            continue;
        }

        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        info!(namespace = %namespace, name = %name, ingress = %owner, "Deleting orphaned Service");
        ignore_not_found(ctx.store.delete_service(&namespace, &name).await)
            .with_context(|| format!("Failed to delete Service {namespace}/{name}"))?;
        report.deleted_services += 1;
    }

    for route in &routes {
        let Some(owner) = owner_of(route) else {
            warn!(name = %route.name_any(), "Managed Route has no ClusterIngress label, skipping");
            continue;
        };
        if live.contains(owner) {
            report.kept += 1;
            continue;
        }

        let namespace = route.namespace().unwrap_or_default();
        let name = route.name_any();
        info!(namespace = %namespace, name = %name, ingress = %owner, "Deleting orphaned Route");
        ignore_not_found(ctx.store.delete_route(&namespace, &name).await)
            .with_context(|| format!("Failed to delete Route {namespace}/{name}"))?;
        report.deleted_routes += 1;
    }

    Ok(report)
}
