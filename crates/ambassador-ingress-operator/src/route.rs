//! OpenShift Route (route.openshift.io/v1)
//!
//! Only the fields the operator writes are modelled. Everything else on a
//! live Route is carried through `extra` so updates never drop it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    plural = "routes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Primary backend
    pub to: RouteTargetReference,
    /// Additional weighted backends (OpenShift allows up to 3)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_backends: Vec<RouteTargetReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
    /// Unmodelled fields (tls, wildcardPolicy, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: IntOrString,
}

/// Maximum number of `alternateBackends` OpenShift accepts
pub const MAX_ALTERNATE_BACKENDS: usize = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmodelled_fields_survive() {
        let yaml = r#"
host: hello.example.com
to:
  kind: Service
  name: hello
  weight: 100
wildcardPolicy: None
tls:
  termination: edge
"#;
        let spec: RouteSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.host.as_deref(), Some("hello.example.com"));
        assert_eq!(spec.to.weight, Some(100));
        assert_eq!(spec.extra["wildcardPolicy"], "None");

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["tls"]["termination"], "edge");
        assert!(json.get("alternateBackends").is_none());
    }
}
