//! Desired state for a ClusterIngress
//!
//! Everything here is pure: the same defaulted ClusterIngress and config
//! always produce the same objects.

pub mod mapping;
pub mod route;
pub mod service;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

use crate::clusteringress::ClusterIngress;
use crate::config::{labels, OperatorConfig};
use crate::error::ReconcileError;
use crate::route::Route;

/// Objects the operator maintains for one ClusterIngress
#[derive(Clone, Debug)]
pub struct DesiredState {
    pub service: Service,
    /// Empty unless route mirroring is enabled
    pub routes: Vec<Route>,
}

/// Build the desired Service (and Routes when mirroring) for a defaulted
/// ClusterIngress.
pub fn build(
    ingress: &ClusterIngress,
    config: &OperatorConfig,
) -> Result<DesiredState, ReconcileError> {
    let mappings = mapping::translate(&ingress.name_any(), &ingress.spec.rules)?;
    let blob = mapping::serialize(&mappings)?;
    let service = service::make_service(ingress, &config.ambassador_namespace, blob);

    let routes = if config.route_mirroring {
        route::make_routes(ingress)?
    } else {
        Vec::new()
    };

    Ok(DesiredState { service, routes })
}

/// Labels tying a side-effect object back to its ClusterIngress.
///
/// Propagated keys absent on the ingress stay absent.
pub fn ownership_labels(ingress: &ClusterIngress) -> BTreeMap<String, String> {
    let mut result = BTreeMap::from([
        (
            labels::MANAGED_BY.to_string(),
            labels::MANAGED_BY_VALUE.to_string(),
        ),
        (labels::CLUSTER_INGRESS.to_string(), ingress.name_any()),
    ]);

    let source = ingress.labels();
    for key in labels::PROPAGATED {
        if let Some(value) = source.get(key) {
            result.insert(key.to_string(), value.clone());
        }
    }

    result
}

/// Where an object lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespaced(String),
}

impl Scope {
    pub fn of<K: Resource>(obj: &K) -> Self {
        match obj.meta().namespace.as_deref() {
            Some(ns) => Self::Namespaced(ns.to_string()),
            None => Self::Cluster,
        }
    }
}

/// Whether an owner reference from `child` to `owner` would be honoured by
/// the garbage collector.
///
/// Owner references only resolve within the child's scope: a namespaced
/// child may not point at a cluster-scoped owner, nor across namespaces.
pub fn can_express_ownership(owner: &Scope, child: &Scope) -> bool {
    match (owner, child) {
        (Scope::Cluster, Scope::Cluster) => true,
        (Scope::Namespaced(o), Scope::Namespaced(c)) => o == c,
        _ => false,
    }
}

/// Owner references for a child in `child_scope`, or `None` when ownership
/// cannot be expressed and the orphan sweep has to clean up instead.
pub fn owner_references(ingress: &ClusterIngress, child_scope: &Scope) -> Option<Vec<OwnerReference>> {
    if !can_express_ownership(&Scope::of(ingress), child_scope) {
        return None;
    }
    ingress.controller_owner_ref(&()).map(|r| vec![r])
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clusteringress::{
        ClusterIngressBackendSplit, ClusterIngressRule, ClusterIngressSpec,
        HttpClusterIngressPath, HttpClusterIngressRuleValue,
    };
    use crate::config::annotations;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use std::time::Duration;

    pub fn test_config() -> OperatorConfig {
        OperatorConfig {
            ambassador_namespace: "ambassador".to_string(),
            ambassador_service_name: "ambassador".to_string(),
            cluster_domain: "cluster.local".to_string(),
            route_mirroring: false,
            resync_interval: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            health_port: 8081,
        }
    }

    pub fn split(name: &str, namespace: &str, percent: i32) -> ClusterIngressBackendSplit {
        ClusterIngressBackendSplit {
            service_name: name.to_string(),
            service_namespace: namespace.to_string(),
            service_port: IntOrString::Int(80),
            percent,
        }
    }

    /// A ClusterIngress of the ambassador class with one rule
    pub fn test_ingress(
        name: &str,
        hosts: &[&str],
        paths: Vec<(&str, Vec<ClusterIngressBackendSplit>)>,
    ) -> ClusterIngress {
        let mut ingress = ClusterIngress::new(
            name,
            ClusterIngressSpec {
                rules: vec![ClusterIngressRule {
                    hosts: hosts.iter().map(|h| h.to_string()).collect(),
                    http: Some(HttpClusterIngressRuleValue {
                        paths: paths
                            .into_iter()
                            .map(|(path, splits)| HttpClusterIngressPath {
                                path: path.to_string(),
                                splits,
                                ..Default::default()
                            })
                            .collect(),
                    }),
                }],
                ..Default::default()
            },
        );
        ingress.metadata = ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("{name}-uid")),
            generation: Some(1),
            resource_version: Some("1".to_string()),
            annotations: Some(BTreeMap::from([(
                annotations::INGRESS_CLASS.to_string(),
                annotations::AMBASSADOR_INGRESS_CLASS.to_string(),
            )])),
            ..Default::default()
        };
        ingress
    }
}
