//! Cluster layer configuration.

use std::time::Duration;

/// Tuning knobs for inventory polling, hostname blocking, and the
/// deployment monitor. All fields have production defaults.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// How often the backend's node capacity is re-polled.
    pub inventory_poll_period: Duration,
    /// Dump the full inventory snapshot to the debug log every N polls.
    pub inventory_debug_frequency: u32,
    /// Externally-routable ports available for lease endpoints.
    pub external_port_quantity: u32,
    /// Overcommit factors: committed = requested / level for level > 1.
    pub cpu_commit_level: f64,
    pub memory_commit_level: f64,
    pub storage_commit_level: f64,
    /// Exact hostnames and `.domain` suffixes never reservable.
    pub blocked_hostnames: Vec<String>,
    /// Monitor healthcheck cadence and jitter.
    pub monitor_healthcheck_period: Duration,
    pub monitor_healthcheck_jitter: Duration,
    /// Monitor retry cadence (after an unhealthy check) and jitter.
    pub monitor_retry_period: Duration,
    pub monitor_retry_jitter: Duration,
    /// Unhealthy checks tolerated before the lease is closed.
    pub monitor_max_retries: u32,
    /// Grace period for teardown during an unclean shutdown.
    pub teardown_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            inventory_poll_period: Duration::from_secs(5),
            inventory_debug_frequency: 10,
            external_port_quantity: 1000,
            cpu_commit_level: 1.0,
            memory_commit_level: 1.0,
            storage_commit_level: 1.0,
            blocked_hostnames: Vec::new(),
            monitor_healthcheck_period: Duration::from_secs(10),
            monitor_healthcheck_jitter: Duration::from_secs(5),
            monitor_retry_period: Duration::from_secs(2),
            monitor_retry_jitter: Duration::from_secs(5),
            monitor_max_retries: 20,
            teardown_grace_period: Duration::from_secs(30),
        }
    }
}
