//! Controller configuration from environment variables
//!
//! Every setting has a default so the controller starts with no
//! configuration at all. Unparseable values are logged and replaced by the
//! default rather than aborting startup.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default Prometheus address when `VAAKA_PROMETHEUS_ADDRESS` is unset
pub const DEFAULT_PROMETHEUS_ADDRESS: &str = "http://prometheus:9090";

/// Default port for health and metrics endpoints
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

/// Runtime settings for the reconciliation engine
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Controller-wide Prometheus address
    pub prometheus_address: String,
    /// Budget for each call to an external collaborator
    pub call_timeout: Duration,
    /// Requeue after a tick that moved the experiment forward
    pub progress_requeue: Duration,
    /// Requeue while waiting for samples to accumulate
    pub inconclusive_requeue: Duration,
    /// Requeue when nothing is expected to change soon (e.g., paused)
    pub idle_requeue: Duration,
    /// First retry delay after a retryable failure
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
    /// Consecutive retryable failures tolerated before the experiment fails
    pub retry_budget: u32,
    /// Optional age limit for cached snapshots
    pub snapshot_ttl: Option<Duration>,
    /// Whether Lease-based leader election is enabled
    pub leader_election: bool,
    /// Port for /healthz, /readyz and /metrics
    pub health_port: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            prometheus_address: DEFAULT_PROMETHEUS_ADDRESS.to_string(),
            call_timeout: Duration::from_secs(10),
            progress_requeue: Duration::from_secs(10),
            inconclusive_requeue: Duration::from_secs(60),
            idle_requeue: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            retry_budget: 10,
            snapshot_ttl: None,
            leader_election: false,
            health_port: DEFAULT_HEALTH_PORT,
        }
    }
}

impl ControllerConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Tests pass a closure over a map instead of mutating the process
    /// environment, which is shared between parallel tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ControllerConfig::default();

        let secs = |key: &str, default: Duration| -> Duration {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        let snapshot_ttl = lookup("VAAKA_SNAPSHOT_TTL_SECS").and_then(|raw| {
            match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(n) => Some(Duration::from_secs(n)),
                Err(e) => {
                    warn!(key = "VAAKA_SNAPSHOT_TTL_SECS", value = %raw, error = %e, "Ignoring invalid setting");
                    None
                }
            }
        });

        let backoff_base = secs("VAAKA_BACKOFF_BASE_SECS", defaults.backoff_base);
        let backoff_max = secs("VAAKA_BACKOFF_MAX_SECS", defaults.backoff_max).max(backoff_base);

        ControllerConfig {
            prometheus_address: lookup("VAAKA_PROMETHEUS_ADDRESS")
                .filter(|a| !a.trim().is_empty())
                .unwrap_or(defaults.prometheus_address),
            call_timeout: secs("VAAKA_CALL_TIMEOUT_SECS", defaults.call_timeout),
            progress_requeue: secs("VAAKA_PROGRESS_REQUEUE_SECS", defaults.progress_requeue),
            inconclusive_requeue: secs(
                "VAAKA_INCONCLUSIVE_REQUEUE_SECS",
                defaults.inconclusive_requeue,
            ),
            idle_requeue: secs("VAAKA_IDLE_REQUEUE_SECS", defaults.idle_requeue),
            backoff_base,
            backoff_max,
            retry_budget: parse_or(&lookup, "VAAKA_RETRY_BUDGET", defaults.retry_budget)
                .unwrap_or(defaults.retry_budget),
            snapshot_ttl,
            leader_election: lookup("VAAKA_LEADER_ELECTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            health_port: parse_or(&lookup, "VAAKA_HEALTH_PORT", defaults.health_port)
                .unwrap_or(defaults.health_port),
        }
    }
}

/// Parse `key` if present; a malformed value yields `Some(default)` and a warning
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key = key, value = %raw, error = %e, "Ignoring invalid setting, using default");
            Some(default)
        }
    }
}
