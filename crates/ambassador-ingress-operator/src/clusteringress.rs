//! ClusterIngress CRD (networking.internal.knative.dev/v1alpha1)
//!
//! The operator does not own this resource; it reads the spec and writes
//! status only. Defaulting fills fields that older stored versions may lack,
//! in memory only.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default per-path request timeout (Go duration syntax)
pub const DEFAULT_TIMEOUT: &str = "10m0s";
/// Default number of retry attempts per path
pub const DEFAULT_RETRY_ATTEMPTS: i32 = 3;

/// ClusterIngress spec - virtual host rules routed to weighted backends
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.internal.knative.dev",
    version = "v1alpha1",
    kind = "ClusterIngress",
    plural = "clusteringresses",
    status = "ClusterIngressStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngressSpec {
    /// TLS termination settings (carried, not acted on)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<ClusterIngressTls>,
    /// Ordered routing rules; order matters for first-match routing
    #[serde(default)]
    pub rules: Vec<ClusterIngressRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<IngressVisibility>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum IngressVisibility {
    ExternalIP,
    ClusterLocal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub secret_name: String,
    #[serde(default)]
    pub secret_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Hosts plus the HTTP paths served for them
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngressRule {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpClusterIngressRuleValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpClusterIngressRuleValue {
    #[serde(default)]
    pub paths: Vec<HttpClusterIngressPath>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpClusterIngressPath {
    /// Path regex; empty matches everything
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default)]
    pub splits: Vec<ClusterIngressBackendSplit>,
    /// Headers added to requests before forwarding
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
    /// Go duration string, e.g. `10m0s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<HttpRetry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetry {
    #[serde(default)]
    pub attempts: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<String>,
}

/// One weighted backend of a path
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngressBackendSplit {
    #[serde(default)]
    pub service_namespace: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_port: IntOrString,
    /// Share of traffic, 0-100
    #[serde(default)]
    pub percent: i32,
}

impl ClusterIngressBackendSplit {
    /// Port rendered the way Ambassador expects it (number or named port)
    pub fn port_string(&self) -> String {
        match &self.service_port {
            IntOrString::Int(port) => port.to_string(),
            IntOrString::String(name) => name.clone(),
        }
    }
}

impl ClusterIngressSpec {
    /// Fill fields an older stored version may be missing.
    pub fn set_defaults(&mut self) {
        if self.visibility.is_none() {
            self.visibility = Some(IngressVisibility::ExternalIP);
        }

        for rule in &mut self.rules {
            let Some(http) = rule.http.as_mut() else {
                continue;
            };
            for path in &mut http.paths {
                path.set_defaults();
            }
        }
    }
}

impl HttpClusterIngressPath {
    fn set_defaults(&mut self) {
        if self.timeout.is_none() {
            self.timeout = Some(DEFAULT_TIMEOUT.to_string());
        }

        let retries = self.retries.get_or_insert_with(|| HttpRetry {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            per_try_timeout: None,
        });
        if retries.per_try_timeout.is_none() {
            retries.per_try_timeout = Some(DEFAULT_TIMEOUT.to_string());
        }

        // A lone split with no explicit weight takes all traffic
        if let [split] = self.splits.as_mut_slice() {
            if split.percent == 0 {
                split.percent = 100;
            }
        }
    }
}

/// Condition types reported on the ClusterIngress
pub mod conditions {
    pub const READY: &str = "Ready";
    pub const NETWORK_CONFIGURED: &str = "NetworkConfigured";
    pub const LOAD_BALANCER_READY: &str = "LoadBalancerReady";

    /// Conditions that together make up `Ready`
    pub const DEPENDENTS: [&str; 2] = [NETWORK_CONFIGURED, LOAD_BALANCER_READY];
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Knative-style condition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub ingress: Vec<LoadBalancerIngressStatus>,
}

/// One entry point of the load balancer fronting this ingress
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_internal: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mesh_only: bool,
}

/// ClusterIngress status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIngressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerStatus>,
}

impl ClusterIngressStatus {
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_ready(&self) -> bool {
        self.get_condition(conditions::READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Add every missing condition as `Unknown`. Existing ones are untouched.
    pub fn initialize_conditions(&mut self, now: &str) {
        for type_ in [
            conditions::READY,
            conditions::NETWORK_CONFIGURED,
            conditions::LOAD_BALANCER_READY,
        ] {
            if self.get_condition(type_).is_none() {
                self.conditions.push(Condition {
                    type_: type_.to_string(),
                    status: ConditionStatus::Unknown,
                    last_transition_time: Some(now.to_string()),
                    ..Default::default()
                });
            }
        }
    }

    pub fn mark_network_configured(&mut self, now: &str) {
        self.set_condition(conditions::NETWORK_CONFIGURED, ConditionStatus::True, None, None, now);
        self.recompute_ready(now);
    }

    pub fn mark_load_balancer_ready(&mut self, ingress: Vec<LoadBalancerIngressStatus>, now: &str) {
        self.load_balancer = Some(LoadBalancerStatus { ingress });
        self.set_condition(conditions::LOAD_BALANCER_READY, ConditionStatus::True, None, None, now);
        self.recompute_ready(now);
    }

    /// Set a condition, keeping the stored entry (and its transition time)
    /// when nothing observable changes.
    fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
        now: &str,
    ) {
        let reason = reason.map(str::to_string);
        let message = message.map(str::to_string);

        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status == status && existing.reason == reason && existing.message == message {
                return;
            }
            existing.status = status;
            existing.reason = reason;
            existing.message = message;
            existing.last_transition_time = Some(now.to_string());
            return;
        }

        self.conditions.push(Condition {
            type_: type_.to_string(),
            status,
            severity: None,
            last_transition_time: Some(now.to_string()),
            reason,
            message,
        });
    }

    fn recompute_ready(&mut self, now: &str) {
        let dependents: Vec<Option<Condition>> = conditions::DEPENDENTS
            .iter()
            .map(|t| self.get_condition(t).cloned())
            .collect();

        if let Some(failed) = dependents
            .iter()
            .flatten()
            .find(|c| c.status == ConditionStatus::False)
        {
            let (reason, message) = (failed.reason.clone(), failed.message.clone());
            self.set_condition(
                conditions::READY,
                ConditionStatus::False,
                reason.as_deref(),
                message.as_deref(),
                now,
            );
        } else if dependents
            .iter()
            .all(|c| matches!(c, Some(c) if c.status == ConditionStatus::True))
        {
            self.set_condition(conditions::READY, ConditionStatus::True, None, None, now);
        } else {
            self.set_condition(conditions::READY, ConditionStatus::Unknown, None, None, now);
        }
    }
}

/// Current time in the format Kubernetes uses for condition timestamps
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
