//! Leader election over a Kubernetes Lease.
//!
//! Only the lease holder runs the controller and the sweep. Standby replicas
//! block in [`LeaderElection::acquire`]; a leader that loses its lease stops
//! and lets Kubernetes restart it as a standby.

use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tracing::{info, trace, warn};

pub const LEADER_ELECTION_ENABLED_ENV: &str = "LEADER_ELECTION_ENABLED";
pub const LEADER_ELECTION_LEASE_NAME_ENV: &str = "LEADER_ELECTION_LEASE_NAME";
pub const LEADER_ELECTION_LEASE_DURATION_ENV: &str = "LEADER_ELECTION_LEASE_DURATION";
pub const LEADER_ELECTION_RENEW_INTERVAL_ENV: &str = "LEADER_ELECTION_RENEW_INTERVAL";
pub const POD_NAME_ENV: &str = "POD_NAME";
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

const DEFAULT_LEASE_NAME: &str = "ambassador-ingress-operator-leader";
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive renewal errors tolerated before giving up the lease
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Validated lease settings. `None` in [`LeaderElectionConfig::from_env`]
/// means election is disabled and this replica always leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    pub fn new(
        lease_name: String,
        namespace: String,
        holder_id: String,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        ensure!(!lease_name.is_empty(), "lease_name cannot be empty");
        ensure!(!namespace.is_empty(), "namespace cannot be empty");
        ensure!(!holder_id.is_empty(), "holder_id cannot be empty");
        ensure!(
            renew_interval < lease_duration,
            "renew_interval ({renew_interval:?}) must be less than lease_duration ({lease_duration:?})"
        );

        Ok(Self {
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_interval,
        })
    }

    /// Read settings from the process environment
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through a key lookup.
    ///
    /// Election is off unless `LEADER_ELECTION_ENABLED` is `true`; when on,
    /// `POD_NAME` and `POD_NAMESPACE` are required.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = lookup(LEADER_ELECTION_ENABLED_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return Ok(None);
        }

        let lease_name = lookup(LEADER_ELECTION_LEASE_NAME_ENV)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string());
        let namespace = lookup(POD_NAMESPACE_ENV)
            .with_context(|| format!("{POD_NAMESPACE_ENV} required when leader election is enabled"))?;
        let holder_id = lookup(POD_NAME_ENV)
            .with_context(|| format!("{POD_NAME_ENV} required when leader election is enabled"))?;

        let lease_duration = parse_secs(
            &lookup,
            LEADER_ELECTION_LEASE_DURATION_ENV,
            DEFAULT_LEASE_DURATION,
        );
        let renew_interval = parse_secs(
            &lookup,
            LEADER_ELECTION_RENEW_INTERVAL_ENV,
            DEFAULT_RENEW_INTERVAL,
        );

        Self::new(lease_name, namespace, holder_id, lease_duration, renew_interval).map(Some)
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    let Some(v) = lookup(key) else {
        return default;
    };
    v.parse::<u64>().map(Duration::from_secs).unwrap_or_else(|e| {
        warn!(
            env_var = key,
            value = %v,
            error = %e,
            default_secs = default.as_secs(),
            "Failed to parse duration, using default"
        );
        default
    })
}

fn holder_of(lease: Option<&Lease>) -> &str {
    lease
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

/// Lease-based leader election
pub struct LeaderElection {
    lease_lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            config.namespace(),
            LeaseLockParams {
                holder_id: config.holder_id().to_string(),
                lease_name: config.lease_name().to_string(),
                lease_ttl: config.lease_duration(),
            },
        );

        Self {
            lease_lock,
            renew_interval: config.renew_interval(),
        }
    }

    /// Block until this replica holds the lease
    pub async fn acquire(&self) {
        info!("Attempting to acquire leadership");

        loop {
            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder = %holder_of(result.lease.as_ref()), "Leadership acquired");
                    return;
                }
                Ok(result) => {
                    info!(
                        current_holder = %holder_of(result.lease.as_ref()),
                        "Another replica is leader, waiting"
                    );
                }
                Err(e) => warn!(error = %e, "Failed to check leadership, retrying"),
            }

            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Keep renewing the lease. Returns only when leadership is lost or
    /// renewal keeps failing; the caller should then shut down.
    pub async fn hold(self) -> anyhow::Error {
        let mut interval = tokio::time::interval(self.renew_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut consecutive_failures: u32 = 0;

        loop {
            interval.tick().await;

            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    if consecutive_failures > 0 {
                        info!(
                            previous_failures = consecutive_failures,
                            "Lease renewed after transient failures"
                        );
                    }
                    consecutive_failures = 0;
                    trace!("Lease renewed");
                }
                Ok(result) => {
                    return anyhow!(
                        "lost leadership to {}",
                        holder_of(result.lease.as_ref())
                    );
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= MAX_RENEWAL_FAILURES {
                        return anyhow!(
                            "failed to renew lease {consecutive_failures} times in a row: {e}"
                        );
                    }
                    warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        max_attempts = MAX_RENEWAL_FAILURES,
                        "Transient lease renewal failure, will retry"
                    );
                }
            }
        }
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
    fn test_disabled_by_default() {
        assert_eq!(LeaderElectionConfig::from_lookup(lookup_from(&[])).unwrap(), None);
    }

    #[test]
    fn test_enabled_requires_pod_identity() {
        let result =
            LeaderElectionConfig::from_lookup(lookup_from(&[(LEADER_ELECTION_ENABLED_ENV, "true")]));
        let err = result.unwrap_err().to_string();
        assert!(err.contains(POD_NAMESPACE_ENV), "{err}");
    }

    #[test]
    fn test_enabled_with_defaults() {
        let config = LeaderElectionConfig::from_lookup(lookup_from(&[
            (LEADER_ELECTION_ENABLED_ENV, "TRUE"),
            (POD_NAMESPACE_ENV, "ambassador"),
            (POD_NAME_ENV, "operator-0"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(config.lease_name(), DEFAULT_LEASE_NAME);
        assert_eq!(config.namespace(), "ambassador");
        assert_eq!(config.holder_id(), "operator-0");
        assert_eq!(config.lease_duration(), DEFAULT_LEASE_DURATION);
        assert_eq!(config.renew_interval(), DEFAULT_RENEW_INTERVAL);
    }

    #[test]
    fn test_overrides_and_invalid_durations() {
        let config = LeaderElectionConfig::from_lookup(lookup_from(&[
            (LEADER_ELECTION_ENABLED_ENV, "true"),
            (LEADER_ELECTION_LEASE_NAME_ENV, "custom-lease"),
            (POD_NAMESPACE_ENV, "ambassador"),
            (POD_NAME_ENV, "operator-0"),
            (LEADER_ELECTION_LEASE_DURATION_ENV, "30"),
            (LEADER_ELECTION_RENEW_INTERVAL_ENV, "soon"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(config.lease_name(), "custom-lease");
        assert_eq!(config.lease_duration(), Duration::from_secs(30));
        assert_eq!(config.renew_interval(), DEFAULT_RENEW_INTERVAL);
    }

    #[test]
    fn test_new_rejects_empty_fields() {
        let err = LeaderElectionConfig::new(
            String::new(),
            "ns".to_string(),
            "holder".to_string(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(err.to_string().contains("lease_name"));
    }

    #[test]
    fn test_new_rejects_renew_not_shorter_than_lease() {
        let err = LeaderElectionConfig::new(
            "lease".to_string(),
            "ns".to_string(),
            "holder".to_string(),
            Duration::from_secs(10),
            Duration::from_secs(10),
        )
        .unwrap_err();
        assert!(err.to_string().contains("renew_interval"));
    }

    #[test]
    fn test_holder_of_missing_lease() {
        assert_eq!(holder_of(None), "unknown");
    }
}
