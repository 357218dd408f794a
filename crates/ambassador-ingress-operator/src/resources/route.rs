//! OpenShift Routes mirroring the ingress rules

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::clusteringress::{ClusterIngress, ClusterIngressBackendSplit};
use crate::error::ReconcileError;
use crate::route::{Route, RoutePort, RouteSpec, RouteTargetReference, MAX_ALTERNATE_BACKENDS};

use super::{owner_references, ownership_labels, Scope};

/// One Route per (rule, host, path), in input order.
///
/// A Route lives next to its backends, so every split of a path must share
/// one namespace.
pub fn make_routes(ingress: &ClusterIngress) -> Result<Vec<Route>, ReconcileError> {
    let ingress_name = ingress.name_any();
    let route_labels = ownership_labels(ingress);
    let mut routes = Vec::new();

    for (r, rule) in ingress.spec.rules.iter().enumerate() {
        let Some(http) = rule.http.as_ref() else {
            return Err(ReconcileError::InvalidSpec(format!(
                "rule {r} has no http section"
            )));
        };

        for (p, path) in http.paths.iter().enumerate() {
            let (first, rest) = path.splits.split_first().ok_or_else(|| {
                ReconcileError::InvalidSpec(format!("rule {r} path {p} has no splits"))
            })?;
            if rest.len() > MAX_ALTERNATE_BACKENDS {
                return Err(ReconcileError::InvalidSpec(format!(
                    "rule {r} path {p} has {} splits, routes support at most {}",
                    path.splits.len(),
                    MAX_ALTERNATE_BACKENDS + 1
                )));
            }
            if let Some(other) = rest
                .iter()
                .find(|s| s.service_namespace != first.service_namespace)
            {
                return Err(ReconcileError::InvalidSpec(format!(
                    "rule {r} path {p} mixes namespaces {} and {}",
                    first.service_namespace, other.service_namespace
                )));
            }

            let namespace = first.service_namespace.clone();
            let scope = Scope::Namespaced(namespace.clone());

            for (h, host) in rule.hosts.iter().enumerate() {
                routes.push(Route {
                    metadata: ObjectMeta {
                        name: Some(format!("{ingress_name}-{r}-{h}-{p}")),
                        namespace: Some(namespace.clone()),
                        owner_references: owner_references(ingress, &scope),
                        labels: Some(route_labels.clone()),
                        ..Default::default()
                    },
                    spec: RouteSpec {
                        host: Some(host.clone()),
                        path: (!path.path.is_empty()).then(|| path.path.clone()),
                        to: target(first),
                        alternate_backends: rest.iter().map(target).collect(),
                        port: Some(RoutePort {
                            target_port: first.service_port.clone(),
                        }),
                        extra: BTreeMap::new(),
                    },
                });
            }
        }
    }

    Ok(routes)
}

fn target(split: &ClusterIngressBackendSplit) -> RouteTargetReference {
    RouteTargetReference {
        kind: "Service".to_string(),
        name: split.service_name.clone(),
        weight: Some(split.percent),
    }
}
