//! Ambassador Mapping translation
//!
//! Rules are flattened into one Mapping per (rule, path, split), in input
//! order. Ambassador matches Mappings in the order it sees them, so the
//! output order is part of the contract.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use crate::clusteringress::{ClusterIngressBackendSplit, ClusterIngressRule, DEFAULT_TIMEOUT};
use crate::error::ReconcileError;

pub const MAPPING_API_VERSION: &str = "ambassador/v1";
pub const MAPPING_KIND: &str = "Mapping";

/// One Ambassador Mapping document. Field order is the serialized order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Mapping {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub prefix: String,
    pub prefix_regex: bool,
    pub service: String,
    pub weight: i32,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub add_request_headers: BTreeMap<String, String>,
    pub host: String,
    pub host_regex: bool,
    pub timeout_ms: u64,
}

/// Translate ingress rules into ordered Mappings.
///
/// Fails on the first malformed rule; no partial output is returned.
pub fn translate(
    ingress_name: &str,
    rules: &[ClusterIngressRule],
) -> Result<Vec<Mapping>, ReconcileError> {
    let mut mappings = Vec::new();

    for (r, rule) in rules.iter().enumerate() {
        let first_host = rule.hosts.first().ok_or_else(|| {
            ReconcileError::InvalidSpec(format!("rule {r} has no hosts"))
        })?;
        let http = rule.http.as_ref().ok_or_else(|| {
            ReconcileError::InvalidSpec(format!("rule {r} has no http section"))
        })?;
        let host = host_pattern(&rule.hosts);

        for (p, path) in http.paths.iter().enumerate() {
            let (prefix, prefix_regex) = if path.path.is_empty() {
                ("/".to_string(), false)
            } else {
                (path.path.clone(), true)
            };
            let timeout_ms = parse_timeout_ms(path.timeout.as_deref().unwrap_or(DEFAULT_TIMEOUT))
                .map_err(|e| {
                    ReconcileError::InvalidSpec(format!("rule {r} path {p}: {e}"))
                })?;

            for (s, split) in path.splits.iter().enumerate() {
                validate_split(split).map_err(|e| {
                    ReconcileError::InvalidSpec(format!("rule {r} path {p} split {s}: {e}"))
                })?;
                let service = service_address(split);

                mappings.push(Mapping {
                    api_version: MAPPING_API_VERSION.to_string(),
                    kind: MAPPING_KIND.to_string(),
                    name: format!("{ingress_name}-{first_host}-{service}-{r}-{p}-{s}"),
                    prefix: prefix.clone(),
                    prefix_regex,
                    service,
                    weight: split.percent,
                    add_request_headers: path.append_headers.clone(),
                    host: host.clone(),
                    host_regex: true,
                    timeout_ms,
                });
            }
        }
    }

    Ok(mappings)
}

/// Render Mappings as a multi-document YAML blob.
///
/// Each document is preceded by `---` and followed by a blank line.
pub fn serialize(mappings: &[Mapping]) -> Result<String, ReconcileError> {
    let mut blob = String::new();
    for mapping in mappings {
        let doc = serde_yaml::to_string(mapping)
            .map_err(|e| ReconcileError::SerializationFailed(format!("{}: {e}", mapping.name)))?;
        blob.push_str("---\n");
        blob.push_str(&doc);
        blob.push('\n');
    }
    Ok(blob)
}

fn host_pattern(hosts: &[String]) -> String {
    format!("^({})$", hosts.join("|"))
}

fn service_address(split: &ClusterIngressBackendSplit) -> String {
    format!(
        "{}.{}:{}",
        split.service_name,
        split.service_namespace,
        split.port_string()
    )
}

fn validate_split(split: &ClusterIngressBackendSplit) -> Result<(), String> {
    if split.service_name.is_empty() {
        return Err("serviceName is empty".to_string());
    }
    if split.service_namespace.is_empty() {
        return Err("serviceNamespace is empty".to_string());
    }
    match &split.service_port {
        IntOrString::Int(port) if *port <= 0 => {
            return Err(format!("servicePort {port} is not a valid port"))
        }
        IntOrString::String(name) if name.is_empty() => {
            return Err("servicePort is empty".to_string())
        }
        _ => {}
    }
    if !(0..=100).contains(&split.percent) {
        return Err(format!("percent {} is outside 0..=100", split.percent));
    }
    Ok(())
}

/// Go duration string to whole milliseconds, truncating
fn parse_timeout_ms(timeout: &str) -> Result<u64, String> {
    let duration = humantime::parse_duration(timeout)
        .map_err(|e| format!("invalid timeout {timeout:?}: {e}"))?;
    u64::try_from(duration.as_millis()).map_err(|_| format!("timeout {timeout:?} is too large"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusteringress::{HttpClusterIngressPath, HttpClusterIngressRuleValue};

    fn split(name: &str, percent: i32) -> ClusterIngressBackendSplit {
        ClusterIngressBackendSplit {
            service_name: name.to_string(),
            service_namespace: "ns".to_string(),
            service_port: IntOrString::Int(8080),
            percent,
        }
    }

    fn rule(hosts: &[&str], paths: Vec<HttpClusterIngressPath>) -> ClusterIngressRule {
        ClusterIngressRule {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            http: Some(HttpClusterIngressRuleValue { paths }),
        }
    }

    fn path(path: &str, splits: Vec<ClusterIngressBackendSplit>) -> HttpClusterIngressPath {
        HttpClusterIngressPath {
            path: path.to_string(),
            splits,
            timeout: Some("10m0s".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_path_single_split() {
        let rules = vec![rule(&["a.example.com"], vec![path("", vec![split("svc", 100)])])];

        let mappings = translate("hello", &rules).unwrap();

        assert_eq!(mappings.len(), 1);
        let m = &mappings[0];
        assert_eq!(m.prefix, "/");
        assert!(!m.prefix_regex);
        assert_eq!(m.host, "^(a.example.com)$");
        assert!(m.host_regex);
        assert_eq!(m.service, "svc.ns:8080");
        assert_eq!(m.weight, 100);
        assert_eq!(m.timeout_ms, 600_000);
    }

    #[test]
    fn test_explicit_path_two_splits() {
        let rules = vec![rule(
            &["a.example.com"],
            vec![path("/api", vec![split("v1", 70), split("v2", 30)])],
        )];

        let mappings = translate("hello", &rules).unwrap();

        assert_eq!(mappings.len(), 2);
        assert!(mappings.iter().all(|m| m.prefix == "/api" && m.prefix_regex));
        assert_eq!(mappings[0].weight, 70);
        assert_eq!(mappings[1].weight, 30);
        assert_eq!(mappings[0].service, "v1.ns:8080");
        assert_eq!(mappings[1].service, "v2.ns:8080");
        assert_eq!(mappings[0].host, mappings[1].host);
        assert_eq!(mappings[0].timeout_ms, mappings[1].timeout_ms);
    }

    #[test]
    fn test_multiple_hosts_joined() {
        let rules = vec![rule(
            &["a.example.com", "a.default.svc.cluster.local"],
            vec![path("", vec![split("svc", 100)])],
        )];

        let mappings = translate("hello", &rules).unwrap();
        assert_eq!(mappings[0].host, "^(a.example.com|a.default.svc.cluster.local)$");
    }

    #[test]
    fn test_order_follows_input() {
        let rules = vec![
            rule(
                &["a.example.com"],
                vec![
                    path("/one", vec![split("s1", 50), split("s2", 50)]),
                    path("/two", vec![split("s3", 100)]),
                ],
            ),
            rule(&["b.example.com"], vec![path("", vec![split("s4", 100)])]),
        ];

        let mappings = translate("hello", &rules).unwrap();
        let services: Vec<&str> = mappings.iter().map(|m| m.service.as_str()).collect();
        assert_eq!(
            services,
            vec!["s1.ns:8080", "s2.ns:8080", "s3.ns:8080", "s4.ns:8080"]
        );
    }

    #[test]
    fn test_names_unique_for_repeated_service() {
        // Same host and service on two paths must still yield distinct names
        let rules = vec![rule(
            &["a.example.com"],
            vec![
                path("/one", vec![split("svc", 100)]),
                path("/two", vec![split("svc", 100)]),
            ],
        )];

        let mappings = translate("hello", &rules).unwrap();
        assert_ne!(mappings[0].name, mappings[1].name);
        assert_eq!(mappings[0].name, "hello-a.example.com-svc.ns:8080-0-0-0");
    }

    #[test]
    fn test_timeout_truncates() {
        assert_eq!(parse_timeout_ms("10m0s").unwrap(), 600_000);
        assert_eq!(parse_timeout_ms("1h0m0s").unwrap(), 3_600_000);
        assert_eq!(parse_timeout_ms("1500us").unwrap(), 1);
        assert!(parse_timeout_ms("soon").is_err());
    }

    #[test]
    fn test_missing_timeout_uses_default() {
        let mut p = path("", vec![split("svc", 100)]);
        p.timeout = None;
        let mappings = translate("hello", &[rule(&["a.example.com"], vec![p])]).unwrap();
        assert_eq!(mappings[0].timeout_ms, 600_000);
    }

    #[test]
    fn test_invalid_input_rejected() {
        let no_hosts = vec![rule(&[], vec![path("", vec![split("svc", 100)])])];
        assert!(matches!(
            translate("hello", &no_hosts),
            Err(ReconcileError::InvalidSpec(_))
        ));

        let no_http = vec![ClusterIngressRule {
            hosts: vec!["a.example.com".to_string()],
            http: None,
        }];
        assert!(matches!(
            translate("hello", &no_http),
            Err(ReconcileError::InvalidSpec(_))
        ));

        let mut incomplete = split("svc", 100);
        incomplete.service_namespace.clear();
        let rules = vec![rule(&["a.example.com"], vec![path("", vec![incomplete])])];
        assert!(matches!(
            translate("hello", &rules),
            Err(ReconcileError::InvalidSpec(_))
        ));

        let rules = vec![rule(&["a.example.com"], vec![path("", vec![split("svc", 101)])])];
        assert!(matches!(
            translate("hello", &rules),
            Err(ReconcileError::InvalidSpec(_))
        ));

        let mut bad_timeout = path("", vec![split("svc", 100)]);
        bad_timeout.timeout = Some("forever".to_string());
        let rules = vec![rule(&["a.example.com"], vec![bad_timeout])];
        assert!(matches!(
            translate("hello", &rules),
            Err(ReconcileError::InvalidSpec(_))
        ));
    }

    #[test]
    fn test_weights_not_required_to_sum() {
        let rules = vec![rule(
            &["a.example.com"],
            vec![path("", vec![split("v1", 30), split("v2", 30)])],
        )];
        assert_eq!(translate("hello", &rules).unwrap().len(), 2);
    }

    #[test]
    fn test_serialize_document_layout() {
        let mut p = path("", vec![split("svc", 100)]);
        p.append_headers
            .insert("knative-serving-namespace".to_string(), "ns".to_string());
        let mappings = translate("hello", &[rule(&["a.example.com"], vec![p])]).unwrap();

        let blob = serialize(&mappings).unwrap();

        let expected = "---\n\
apiVersion: ambassador/v1\n\
kind: Mapping\n\
name: hello-a.example.com-svc.ns:8080-0-0-0\n\
prefix: /\n\
prefix_regex: false\n\
service: svc.ns:8080\n\
weight: 100\n\
add_request_headers:\n  knative-serving-namespace: ns\n\
host: ^(a.example.com)$\n\
host_regex: true\n\
timeout_ms: 600000\n\
\n";
        assert_eq!(blob, expected);
    }

    #[test]
    fn test_serialize_omits_empty_headers() {
        let mappings =
            translate("hello", &[rule(&["a.example.com"], vec![path("", vec![split("svc", 100)])])])
                .unwrap();
        let blob = serialize(&mappings).unwrap();
        assert!(!blob.contains("add_request_headers"));
    }

    #[test]
    fn test_deterministic() {
        let rules = vec![rule(
            &["a.example.com", "b.example.com"],
            vec![path("/api", vec![split("v1", 70), split("v2", 30)])],
        )];

        let first = serialize(&translate("hello", &rules).unwrap()).unwrap();
        let second = serialize(&translate("hello", &rules).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.matches("---\n").count(), 2);
    }

    #[test]
    fn test_serialize_empty() {
        assert_eq!(serialize(&[]).unwrap(), "");
    }
}
