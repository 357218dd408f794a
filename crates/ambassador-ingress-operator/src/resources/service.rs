//! Headless configuration-carrier Service
//!
//! Ambassador watches Services for `getambassador.io/config` and loads the
//! Mappings found there. The Service itself routes nothing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::clusteringress::ClusterIngress;
use crate::config::annotations;

use super::{owner_references, ownership_labels, Scope};

/// Desired Service for `ingress`, named after it and placed in the gateway
/// namespace.
pub fn make_service(ingress: &ClusterIngress, namespace: &str, config_blob: String) -> Service {
    let mut service_annotations = BTreeMap::from([(
        annotations::AMBASSADOR_CONFIG.to_string(),
        config_blob,
    )]);
    if let Some(class) = ingress.annotations().get(annotations::INGRESS_CLASS) {
        service_annotations.insert(annotations::INGRESS_CLASS.to_string(), class.clone());
    }

    Service {
        metadata: ObjectMeta {
            name: Some(ingress.name_any()),
            namespace: Some(namespace.to_string()),
            owner_references: owner_references(ingress, &Scope::Namespaced(namespace.to_string())),
            labels: Some(ownership_labels(ingress)),
            annotations: Some(service_annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}
