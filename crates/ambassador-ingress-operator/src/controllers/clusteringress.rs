//! ClusterIngress controller
//!
//! Converges the gateway Service (and, when enabled, OpenShift Routes) for
//! every ClusterIngress of the Ambassador class, then reports readiness in
//! the ClusterIngress status.
//!
//! ## Deletion Behavior
//!
//! The gateway namespace holds namespaced Services while ClusterIngress is
//! cluster-scoped, so owner references cannot link them. No finalizer is
//! added either: a ClusterIngress being deleted is left alone and the
//! periodic sweep in [`super::sweep`] removes whatever it leaves behind.
//!
//! ## Status Writes
//!
//! The object handed to reconcile may come from a stale cache. Status is only
//! written when it changed, and then only after re-reading the object and
//! comparing against that fresh copy.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::clusteringress::{
    now_rfc3339, ClusterIngress, ClusterIngressStatus, LoadBalancerIngressStatus,
};
use crate::config::{annotations, labels};
use crate::drift::{apply_route, apply_service, prune_routes, ApplyOutcome};
use crate::error::ReconcileError;
use crate::resources;
use crate::route::Route;

use super::retry::{classify_error, compute_backoff};
use super::ControllerContext;

/// How a single reconcile invocation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The object no longer exists
    Vanished,
    /// Not an Ambassador ClusterIngress
    Skipped,
    /// Deletion in progress; nothing to do
    Finalizing,
    Done {
        service: ApplyOutcome,
        routes: Vec<ApplyOutcome>,
        /// Mirrored Routes deleted because the rules no longer produce them
        pruned_routes: usize,
        status_written: bool,
    },
}

/// Check the ingress class annotation
fn is_ambassador_class(ingress: &ClusterIngress) -> bool {
    ingress
        .annotations()
        .get(annotations::INGRESS_CLASS)
        .map(|class| class == annotations::AMBASSADOR_INGRESS_CLASS)
        .unwrap_or(false)
}

/// Whether `desired` should overwrite the freshly read status.
///
/// A fresh status that already matches needs no write, and one observed at a
/// newer generation must not be rolled back.
fn status_needs_write(
    fresh: Option<&ClusterIngressStatus>,
    desired: &ClusterIngressStatus,
) -> bool {
    let Some(fresh) = fresh else {
        return true;
    };
    if fresh == desired {
        return false;
    }
    match (fresh.observed_generation, desired.observed_generation) {
        (Some(seen), Some(ours)) => seen <= ours,
        _ => true,
    }
}

/// Re-read the ClusterIngress and write `desired` status onto the fresh copy.
///
/// Returns whether a write was issued.
async fn update_status(
    ctx: &ControllerContext,
    name: &str,
    desired: ClusterIngressStatus,
) -> Result<bool, ReconcileError> {
    let mut fresh = match ctx.store.get_cluster_ingress(name).await {
        Ok(fresh) => fresh,
        Err(e) if e.is_not_found() => {
            debug!("ClusterIngress vanished before status update");
            return Ok(false);
        }
        Err(e) => return Err(ReconcileError::from_read(e)),
    };

    if !status_needs_write(fresh.status.as_ref(), &desired) {
        debug!("Fresh status already current, skipping write");
        return Ok(false);
    }

    fresh.status = Some(desired);
    ctx.store
        .update_cluster_ingress_status(&fresh)
        .await
        .map_err(ReconcileError::from_write)?;
    Ok(true)
}

/// Reconcile one ClusterIngress by name
#[instrument(skip(ctx))]
pub async fn reconcile_key(
    name: &str,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let original = match ctx.store.get_cluster_ingress(name).await {
        Ok(ingress) => ingress,
        Err(e) if e.is_not_found() => {
            debug!("ClusterIngress not found, nothing to do");
            return Ok(ReconcileOutcome::Vanished);
        }
        Err(e) => return Err(ReconcileError::from_read(e)),
    };

    if !is_ambassador_class(&original) {
        debug!("ClusterIngress belongs to another ingress class, skipping");
        return Ok(ReconcileOutcome::Skipped);
    }

    if original.metadata.deletion_timestamp.is_some() {
        info!("ClusterIngress is being deleted, leaving cleanup to the sweep");
        return Ok(ReconcileOutcome::Finalizing);
    }

    // Work on a copy; defaults are never written back
    let mut ingress = original.clone();
    ingress.spec.set_defaults();

    let now = now_rfc3339();
    let mut status = ingress.status.clone().unwrap_or_default();
    status.initialize_conditions(&now);

    let desired = resources::build(&ingress, &ctx.config)?;

    let service = apply_service(ctx.store.as_ref(), &desired.service).await?;
    let mut routes = Vec::with_capacity(desired.routes.len());
    for route in &desired.routes {
        routes.push(apply_route(ctx.store.as_ref(), route).await?);
    }
    let pruned_routes = if ctx.config.route_mirroring {
        prune_routes(ctx.store.as_ref(), name, &desired.routes).await?
    } else {
        0
    };

    status.mark_network_configured(&now);
    status.mark_load_balancer_ready(
        vec![LoadBalancerIngressStatus {
            domain_internal: Some(ctx.config.load_balancer_domain()),
            ..Default::default()
        }],
        &now,
    );
    status.observed_generation = ingress.metadata.generation;

    let status_written = if original.status.as_ref() == Some(&status) {
        false
    } else {
        update_status(ctx, name, status).await?
    };

    info!(
        service = ?service,
        routes = routes.len(),
        pruned_routes,
        status_written,
        "ClusterIngress reconciled"
    );

    Ok(ReconcileOutcome::Done {
        service,
        routes,
        pruned_routes,
        status_written,
    })
}

/// Controller entry point
#[instrument(skip(ingress, ctx), fields(name = %ingress.name_any()))]
pub(crate) async fn reconcile(
    ingress: Arc<ClusterIngress>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let name = ingress.name_any();

    match reconcile_key(&name, &ctx).await? {
        ReconcileOutcome::Done { .. } => {
            ctx.retry_tracker.reset(&name);
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        ReconcileOutcome::Vanished => {
            ctx.retry_tracker.reset(&name);
            Ok(Action::await_change())
        }
        ReconcileOutcome::Skipped | ReconcileOutcome::Finalizing => Ok(Action::await_change()),
    }
}

/// Error policy with exponential backoff
pub(crate) fn error_policy(
    ingress: Arc<ClusterIngress>,
    error: &ReconcileError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let name = ingress.name_any();
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&name);

    warn!(
        name = %name,
        error = %error,
        attempt,
        error_kind = ?kind,
        "ClusterIngress reconciliation failed"
    );

    compute_backoff(attempt, kind)
}

/// Map a managed object back to its ClusterIngress via the ownership label
fn owning_ingress<K: ResourceExt>(obj: K) -> Option<ObjectRef<ClusterIngress>> {
    obj.labels()
        .get(labels::CLUSTER_INGRESS)
        .map(|name| ObjectRef::new(name))
}

/// Start the ClusterIngress controller
pub async fn run(client: Client, ctx: Arc<ControllerContext>) {
    let ingresses: Api<ClusterIngress> = Api::all(client.clone());
    let services: Api<Service> = Api::namespaced(client.clone(), &ctx.config.ambassador_namespace);
    let managed = WatcherConfig::default().labels(&labels::managed_selector());

    info!(
        namespace = %ctx.config.ambassador_namespace,
        route_mirroring = ctx.config.route_mirroring,
        "Starting ClusterIngress controller"
    );

    let mut controller = Controller::new(ingresses, WatcherConfig::default()).watches(
        services,
        managed.clone(),
        owning_ingress,
    );
    if ctx.config.route_mirroring {
        let routes: Api<Route> = Api::all(client);
        controller = controller.watches(routes, managed, owning_ingress);
    }

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "ClusterIngress reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "ClusterIngress controller error");
                }
            }
        })
        .await;
}
