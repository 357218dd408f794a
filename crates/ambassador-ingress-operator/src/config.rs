//! Operator configuration and well-known keys
//!
//! Configuration is read once from the environment at startup and passed
//! around as an immutable value. Reconciliation never looks at the
//! environment again.

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::warn;

use crate::health::DEFAULT_HEALTH_PORT;

/// Required: namespace holding the gateway-facing Services
pub const AMBASSADOR_NAMESPACE_ENV: &str = "AMBASSADOR_NAMESPACE";
pub const AMBASSADOR_SERVICE_NAME_ENV: &str = "AMBASSADOR_SERVICE_NAME";
pub const CLUSTER_DOMAIN_ENV: &str = "CLUSTER_DOMAIN";
pub const ROUTE_MIRRORING_ENABLED_ENV: &str = "ROUTE_MIRRORING_ENABLED";
pub const RESYNC_INTERVAL_ENV: &str = "RESYNC_INTERVAL_SECS";
pub const SWEEP_INTERVAL_ENV: &str = "SWEEP_INTERVAL_SECS";
pub const HEALTH_PORT_ENV: &str = "HEALTH_PORT";

const DEFAULT_AMBASSADOR_SERVICE_NAME: &str = "ambassador";
const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Annotations read from ClusterIngress and written to Services
pub mod annotations {
    /// Ingress class marker on the ClusterIngress
    pub const INGRESS_CLASS: &str = "networking.knative.dev/ingress.class";
    /// The class this operator is responsible for
    pub const AMBASSADOR_INGRESS_CLASS: &str = "ambassador.ingress.networking.knative.dev";
    /// Ambassador reads its Mapping configuration from this Service annotation
    pub const AMBASSADOR_CONFIG: &str = "getambassador.io/config";

    /// Annotation keys owned by the operator on the side-effect Service
    pub const MANAGED: [&str; 2] = [INGRESS_CLASS, AMBASSADOR_CONFIG];
}

/// Labels used for ownership tracking
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "ambassador-ingress-operator";
    /// Name of the owning ClusterIngress
    pub const CLUSTER_INGRESS: &str = "networking.internal.knative.dev/clusteringress";
    pub const ROUTE: &str = "serving.knative.dev/route";
    pub const ROUTE_NAMESPACE: &str = "serving.knative.dev/routeNamespace";

    /// Copied from the ClusterIngress when present
    pub const PROPAGATED: [&str; 2] = [ROUTE, ROUTE_NAMESPACE];

    /// Label keys owned by the operator on side-effect objects
    pub const MANAGED: [&str; 4] = [MANAGED_BY, CLUSTER_INGRESS, ROUTE, ROUTE_NAMESPACE];

    /// Selector matching every object this operator created
    pub fn managed_selector() -> String {
        format!("{MANAGED_BY}={MANAGED_BY_VALUE}")
    }

    /// Selector matching the objects created for one ClusterIngress
    pub fn ingress_selector(ingress_name: &str) -> String {
        format!("{},{CLUSTER_INGRESS}={ingress_name}", managed_selector())
    }
}

/// Immutable operator configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace where gateway-facing Services are written
    pub ambassador_namespace: String,
    /// Gateway Service name, reported in the load balancer status
    pub ambassador_service_name: String,
    pub cluster_domain: String,
    /// Also mirror intent into OpenShift Routes
    pub route_mirroring: bool,
    /// Requeue interval after a successful reconcile
    pub resync_interval: Duration,
    pub sweep_interval: Duration,
    pub health_port: u16,
}

impl OperatorConfig {
    /// Load configuration from process environment.
    ///
    /// Fails when `AMBASSADOR_NAMESPACE` is unset or empty; the caller is
    /// expected to abort startup.
    pub fn from_env() -> Result<Self> {
        // Pod DNS config knows the real cluster domain when the env does not
        let resolved_domain = std::fs::read_to_string(RESOLV_CONF_PATH)
            .ok()
            .and_then(|contents| cluster_domain_from_resolv_conf(&contents));

        Self::from_lookup(|key| {
            let value = std::env::var(key).ok();
            if key == CLUSTER_DOMAIN_ENV {
                value
                    .filter(|v| !v.trim().is_empty())
                    .or_else(|| resolved_domain.clone())
            } else {
                value
            }
        })
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ambassador_namespace = match lookup(AMBASSADOR_NAMESPACE_ENV) {
            None => bail!("{AMBASSADOR_NAMESPACE_ENV} must be set"),
            Some(v) if v.trim().is_empty() => bail!("{AMBASSADOR_NAMESPACE_ENV} must not be empty"),
            Some(v) => v.trim().to_string(),
        };

        let ambassador_service_name = lookup(AMBASSADOR_SERVICE_NAME_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AMBASSADOR_SERVICE_NAME.to_string());

        let cluster_domain = lookup(CLUSTER_DOMAIN_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLUSTER_DOMAIN.to_string());

        let route_mirroring = lookup(ROUTE_MIRRORING_ENABLED_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let resync_interval = parse_secs(&lookup, RESYNC_INTERVAL_ENV, DEFAULT_RESYNC_INTERVAL);
        let sweep_interval = parse_secs(&lookup, SWEEP_INTERVAL_ENV, DEFAULT_SWEEP_INTERVAL);

        let health_port = match lookup(HEALTH_PORT_ENV) {
            Some(v) => v.parse::<u16>().unwrap_or_else(|e| {
                warn!(
                    env_var = HEALTH_PORT_ENV,
                    value = %v,
                    error = %e,
                    default = DEFAULT_HEALTH_PORT,
                    "Failed to parse port, using default"
                );
                DEFAULT_HEALTH_PORT
            }),
            None => DEFAULT_HEALTH_PORT,
        };

        Ok(Self {
            ambassador_namespace,
            ambassador_service_name,
            cluster_domain,
            route_mirroring,
            resync_interval,
            sweep_interval,
            health_port,
        })
    }

    /// In-cluster DNS name of the gateway, reported as `domainInternal`
    pub fn load_balancer_domain(&self) -> String {
        format!(
            "{}.{}.svc.{}",
            self.ambassador_service_name, self.ambassador_namespace, self.cluster_domain
        )
    }
}

/// Cluster domain from the `svc.<domain>` entry of a resolv.conf search line
pub fn cluster_domain_from_resolv_conf(contents: &str) -> Option<String> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            (fields.next() == Some("search")).then_some(fields)
        })
        .flatten()
        .find_map(|domain| domain.strip_prefix("svc."))
        .map(|domain| domain.trim_end_matches('.').to_string())
        .filter(|domain| !domain.is_empty())
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(v) => match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            Ok(_) => {
                warn!(env_var = key, "Zero interval is not allowed, using default");
                default
            }
            Err(e) => {
                warn!(
                    env_var = key,
                    value = %v,
                    error = %e,
                    default_secs = default.as_secs(),
                    "Failed to parse interval, using default"
                );
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_namespace_fails() {
        let result = OperatorConfig::from_lookup(lookup_from(&[]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("must be set"), "{err}");
    }

    #[test]
    fn test_empty_namespace_fails() {
        let result = OperatorConfig::from_lookup(lookup_from(&[(AMBASSADOR_NAMESPACE_ENV, "  ")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains("must not be empty"), "{err}");
    }

    #[test]
    fn test_defaults() {
        let config =
            OperatorConfig::from_lookup(lookup_from(&[(AMBASSADOR_NAMESPACE_ENV, "ambassador")]))
                .unwrap();

        assert_eq!(config.ambassador_namespace, "ambassador");
        assert_eq!(config.ambassador_service_name, "ambassador");
        assert_eq!(config.cluster_domain, "cluster.local");
        assert!(!config.route_mirroring);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.health_port, DEFAULT_HEALTH_PORT);
    }

    #[test]
    fn test_overrides() {
        let config = OperatorConfig::from_lookup(lookup_from(&[
            (AMBASSADOR_NAMESPACE_ENV, "gateway"),
            (AMBASSADOR_SERVICE_NAME_ENV, "edge"),
            (CLUSTER_DOMAIN_ENV, "example.internal"),
            (ROUTE_MIRRORING_ENABLED_ENV, "TRUE"),
            (RESYNC_INTERVAL_ENV, "30"),
            (SWEEP_INTERVAL_ENV, "not-a-number"),
            (HEALTH_PORT_ENV, "9090"),
        ]))
        .unwrap();

        assert!(config.route_mirroring);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        // Invalid values fall back to defaults
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.health_port, 9090);
        assert_eq!(
            config.load_balancer_domain(),
            "edge.gateway.svc.example.internal"
        );
    }

    #[test]
    fn test_managed_selector() {
        assert_eq!(
            labels::managed_selector(),
            "app.kubernetes.io/managed-by=ambassador-ingress-operator"
        );
        assert_eq!(
            labels::ingress_selector("hello"),
            "app.kubernetes.io/managed-by=ambassador-ingress-operator,\
             networking.internal.knative.dev/clusteringress=hello"
        );
    }

    #[test]
    fn test_cluster_domain_from_resolv_conf() {
        let contents = "nameserver 10.96.0.10\n\
                        search ambassador.svc.corp.internal svc.corp.internal corp.internal\n\
                        options ndots:5\n";
        assert_eq!(
            cluster_domain_from_resolv_conf(contents).as_deref(),
            Some("corp.internal")
        );
    }

    #[test]
    fn test_cluster_domain_from_resolv_conf_trailing_dot() {
        let contents = "search default.svc.cluster.local. svc.cluster.local.\n";
        assert_eq!(
            cluster_domain_from_resolv_conf(contents).as_deref(),
            Some("cluster.local")
        );
    }

    #[test]
    fn test_cluster_domain_from_resolv_conf_without_search() {
        assert_eq!(cluster_domain_from_resolv_conf("nameserver 8.8.8.8\n"), None);
        assert_eq!(cluster_domain_from_resolv_conf("search example.com\n"), None);
        assert_eq!(cluster_domain_from_resolv_conf(""), None);
    }
}
