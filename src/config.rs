//! Operator configuration.
//!
//! Timeouts and requeue intervals, read from `ETCD_OPERATOR_*` environment
//! variables. Values are whole seconds; an unset or unparsable variable keeps
//! the default.

use std::time::Duration;

use tracing::warn;

use crate::client::etcd::MAX_REQUEST_TIMEOUT;

/// Prefix of every configuration variable.
pub const ENV_PREFIX: &str = "ETCD_OPERATOR_";

/// Runtime configuration of the operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Timeout of a single membership RPC. Capped at 10s.
    pub membership_timeout: Duration,
    /// Timeout for connecting to a cluster's client endpoint.
    pub connect_timeout: Duration,
    /// Upper bound of one reconciliation pass.
    pub reconcile_timeout: Duration,
    /// Requeue while creating.
    pub creating_interval: Duration,
    /// Requeue while scaling.
    pub scaling_interval: Duration,
    /// Requeue while running; also the health check period.
    pub health_interval: Duration,
    /// Requeue while stopped.
    pub stopped_interval: Duration,
    /// Requeue while failed.
    pub failed_interval: Duration,
    /// Restrict the controller to one namespace.
    pub watch_namespace: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            membership_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            reconcile_timeout: Duration::from_secs(60),
            creating_interval: Duration::from_secs(10),
            scaling_interval: Duration::from_secs(5),
            health_interval: Duration::from_secs(60),
            stopped_interval: Duration::from_secs(300),
            failed_interval: Duration::from_secs(120),
            watch_namespace: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| -> Duration {
            let key = format!("{}{}", ENV_PREFIX, name);
            match lookup(&key) {
                None => default,
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(0) | Err(_) => {
                        warn!(key = %key, value = %raw, "Ignoring invalid duration");
                        default
                    }
                    Ok(v) => Duration::from_secs(v),
                },
            }
        };

        let membership_timeout = secs("MEMBERSHIP_TIMEOUT_SECS", defaults.membership_timeout);
        if membership_timeout > MAX_REQUEST_TIMEOUT {
            warn!(
                requested = ?membership_timeout,
                max = ?MAX_REQUEST_TIMEOUT,
                "Membership timeout capped"
            );
        }

        Self {
            membership_timeout: membership_timeout.min(MAX_REQUEST_TIMEOUT),
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
            reconcile_timeout: secs("RECONCILE_TIMEOUT_SECS", defaults.reconcile_timeout),
            creating_interval: secs("CREATING_INTERVAL_SECS", defaults.creating_interval),
            scaling_interval: secs("SCALING_INTERVAL_SECS", defaults.scaling_interval),
            health_interval: secs("HEALTH_INTERVAL_SECS", defaults.health_interval),
            stopped_interval: secs("STOPPED_INTERVAL_SECS", defaults.stopped_interval),
            failed_interval: secs("FAILED_INTERVAL_SECS", defaults.failed_interval),
            watch_namespace: lookup(&format!("{}WATCH_NAMESPACE", ENV_PREFIX))
                .filter(|ns| !ns.trim().is_empty()),
        }
    }
}
