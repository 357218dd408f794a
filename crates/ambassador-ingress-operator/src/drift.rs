//! Drift detection and correction for side-effect objects
//!
//! Only fields the operator owns are compared and written. Everything else on
//! the live object, including its resourceVersion, is carried over so the
//! store can reject stale updates.

use std::collections::BTreeMap;

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::config::{annotations, labels};
use crate::error::ReconcileError;
use crate::route::Route;
use crate::store::{ObjectStore, StoreError};

/// Result of converging one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// What to do with a live object given the desired one
#[derive(Clone, Debug, PartialEq)]
pub enum Decision<K> {
    Create,
    /// Live object with desired managed fields overlaid
    Update(K),
    Unchanged,
    /// A live object of the same name belongs to someone else
    Foreign,
}

/// Objects with a subset of fields owned by the operator
pub trait Managed: Clone + Resource {
    /// Whether any owned field of `live` differs from `self`
    fn differs(&self, live: &Self) -> bool;

    /// `live` with owned fields replaced by those of `self`
    fn merged_onto(&self, live: &Self) -> Self;
}

/// Whether `live` was created by this operator for the same ClusterIngress
/// as `desired`
fn same_owner<K: Resource>(desired: &K, live: &K) -> bool {
    live.labels().get(labels::MANAGED_BY).map(String::as_str) == Some(labels::MANAGED_BY_VALUE)
        && live.labels().get(labels::CLUSTER_INGRESS) == desired.labels().get(labels::CLUSTER_INGRESS)
}

pub fn decide<K: Managed>(desired: &K, live: Option<&K>) -> Decision<K> {
    match live {
        None => Decision::Create,
        Some(live) if !same_owner(desired, live) => Decision::Foreign,
        Some(live) if desired.differs(live) => Decision::Update(desired.merged_onto(live)),
        Some(_) => Decision::Unchanged,
    }
}

fn managed_entries<'a>(
    map: &'a BTreeMap<String, String>,
    keys: &'a [&'static str],
) -> impl Iterator<Item = (&'static str, Option<&'a String>)> + 'a {
    keys.iter().map(move |k| (*k, map.get(*k)))
}

fn managed_keys_differ(
    desired: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
    keys: &[&'static str],
) -> bool {
    managed_entries(desired, keys).any(|(k, v)| live.get(k) != v)
}

/// Overlay managed keys onto a fresh copy of `live`; managed keys missing
/// from `desired` are removed.
fn overlay_managed_keys(
    desired: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
    keys: &[&'static str],
) -> BTreeMap<String, String> {
    let mut merged = live.clone();
    for (key, value) in managed_entries(desired, keys) {
        match value {
            Some(v) => {
                merged.insert(key.to_string(), v.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged
}

/// Treat an absent collection and an empty one alike
fn non_empty<T>(v: &Option<Vec<T>>) -> Option<&Vec<T>> {
    v.as_ref().filter(|v| !v.is_empty())
}

fn non_empty_map(v: &Option<BTreeMap<String, String>>) -> Option<&BTreeMap<String, String>> {
    v.as_ref().filter(|v| !v.is_empty())
}

impl Managed for Service {
    fn differs(&self, live: &Self) -> bool {
        let desired_spec = self.spec.clone().unwrap_or_default();
        let live_spec = live.spec.clone().unwrap_or_default();

        desired_spec.type_ != live_spec.type_
            || desired_spec.cluster_ip != live_spec.cluster_ip
            || non_empty_map(&desired_spec.selector) != non_empty_map(&live_spec.selector)
            || non_empty(&desired_spec.ports) != non_empty(&live_spec.ports)
            || managed_keys_differ(self.annotations(), live.annotations(), &annotations::MANAGED)
            || managed_keys_differ(self.labels(), live.labels(), &labels::MANAGED)
    }

    fn merged_onto(&self, live: &Self) -> Self {
        let mut merged = live.clone();
        let desired_spec = self.spec.clone().unwrap_or_default();
        let spec = merged.spec.get_or_insert_with(ServiceSpec::default);
        spec.type_ = desired_spec.type_;
        spec.cluster_ip = desired_spec.cluster_ip;
        spec.selector = desired_spec.selector;
        spec.ports = desired_spec.ports;

        merged.metadata.annotations = Some(overlay_managed_keys(
            self.annotations(),
            live.annotations(),
            &annotations::MANAGED,
        ));
        merged.metadata.labels = Some(overlay_managed_keys(
            self.labels(),
            live.labels(),
            &labels::MANAGED,
        ));
        merged
    }
}

impl Managed for Route {
    fn differs(&self, live: &Self) -> bool {
        let (d, l) = (&self.spec, &live.spec);

        d.host != l.host
            || d.path != l.path
            || d.to != l.to
            || d.alternate_backends != l.alternate_backends
            || d.port != l.port
            || managed_keys_differ(self.labels(), live.labels(), &labels::MANAGED)
    }

    fn merged_onto(&self, live: &Self) -> Self {
        let mut merged = live.clone();
        merged.spec.host = self.spec.host.clone();
        merged.spec.path = self.spec.path.clone();
        merged.spec.to = self.spec.to.clone();
        merged.spec.alternate_backends = self.spec.alternate_backends.clone();
        merged.spec.port = self.spec.port.clone();
        merged.metadata.labels = Some(overlay_managed_keys(
            self.labels(),
            live.labels(),
            &labels::MANAGED,
        ));
        merged
    }
}

/// Turn a fetch result into an optional live object. Only NotFound means
/// absent; any other failure must not lead to a create.
fn live_or_absent<K>(result: Result<K, StoreError>) -> Result<Option<K>, ReconcileError> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(ReconcileError::from_read(e)),
    }
}

/// Converge the gateway Service towards `desired`
#[instrument(skip(store, desired), fields(
    namespace = %desired.namespace().unwrap_or_default(),
    name = %desired.name_any(),
))]
pub async fn apply_service(
    store: &dyn ObjectStore,
    desired: &Service,
) -> Result<ApplyOutcome, ReconcileError> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let live = live_or_absent(store.get_service(&namespace, &name).await)?;

    match decide(desired, live.as_ref()) {
        Decision::Create => {
            store
                .create_service(desired)
                .await
                .map_err(ReconcileError::from_write)?;
            info!("Created gateway Service");
            Ok(ApplyOutcome::Created)
        }
        Decision::Update(merged) => {
            store
                .update_service(&merged)
                .await
                .map_err(ReconcileError::from_write)?;
            info!("Updated gateway Service");
            Ok(ApplyOutcome::Updated)
        }
        Decision::Unchanged => {
            debug!("Gateway Service up to date");
            Ok(ApplyOutcome::Unchanged)
        }
        Decision::Foreign => Err(foreign("Service", &namespace, &name)),
    }
}

/// Converge one mirrored Route towards `desired`
#[instrument(skip(store, desired), fields(
    namespace = %desired.namespace().unwrap_or_default(),
    name = %desired.name_any(),
))]
pub async fn apply_route(
    store: &dyn ObjectStore,
    desired: &Route,
) -> Result<ApplyOutcome, ReconcileError> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let live = live_or_absent(store.get_route(&namespace, &name).await)?;

    match decide(desired, live.as_ref()) {
        Decision::Create => {
            store
                .create_route(desired)
                .await
                .map_err(ReconcileError::from_write)?;
            info!("Created Route");
            Ok(ApplyOutcome::Created)
        }
        Decision::Update(merged) => {
            store
                .update_route(&merged)
                .await
                .map_err(ReconcileError::from_write)?;
            info!("Updated Route");
            Ok(ApplyOutcome::Updated)
        }
        Decision::Unchanged => {
            debug!("Route up to date");
            Ok(ApplyOutcome::Unchanged)
        }
        Decision::Foreign => Err(foreign("Route", &namespace, &name)),
    }
}

/// Delete mirrored Routes of `ingress_name` that are no longer desired.
///
/// Returns the number of Routes deleted. Routes already gone count as deleted
/// by someone else and are skipped.
#[instrument(skip(store, desired))]
pub async fn prune_routes(
    store: &dyn ObjectStore,
    ingress_name: &str,
    desired: &[Route],
) -> Result<usize, ReconcileError> {
    let keep: HashSet<(String, String)> = desired
        .iter()
        .map(|r| (r.namespace().unwrap_or_default(), r.name_any()))
        .collect();

    let live = store
        .list_routes(&labels::ingress_selector(ingress_name))
        .await
        .map_err(ReconcileError::from_read)?;

    let mut pruned = 0;
    for route in live {
        let key = (route.namespace().unwrap_or_default(), route.name_any());
        if keep.contains(&key) {
            continue;
        }
        let (namespace, name) = key;
        match store.delete_route(&namespace, &name).await {
            Ok(()) => {
                info!(namespace = %namespace, name = %name, "Deleted stale Route");
                pruned += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(ReconcileError::from_write(e)),
        }
    }
    Ok(pruned)
}

fn foreign(kind: &str, namespace: &str, name: &str) -> ReconcileError {
    warn!(kind, namespace, name, "Refusing to overwrite object not managed for this ClusterIngress");
    ReconcileError::Conflict(format!(
        "{kind} {namespace}/{name} exists and is not managed for this ClusterIngress"
    ))
}
