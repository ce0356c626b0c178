//! Daemon configuration.
//!
//! All knobs are named flags with production defaults, overridable via
//! `PROVD_`-prefixed environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use provd_bidengine::{BidPricingStrategy, PricingError, RandomRangePricing, ScalePricing, ShellScriptPricing};
use provd_cluster::ClusterConfig;
use provd_manifest::ManifestConfig;

use crate::balance::BalanceConfig;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Address for the manifest ingestion endpoint.
    #[arg(long, env = "PROVD_LISTEN", default_value = "0.0.0.0:8443")]
    pub listen: SocketAddr,

    /// Chain polling interval in seconds.
    #[arg(long, env = "PROVD_CHAIN_POLL_SECS", default_value = "5")]
    pub chain_poll_secs: u64,

    /// Inventory re-poll period in seconds.
    #[arg(long, env = "PROVD_INVENTORY_POLL_SECS", default_value = "5")]
    pub inventory_poll_secs: u64,

    /// Dump the inventory snapshot to the debug log every N polls.
    #[arg(long, env = "PROVD_INVENTORY_DEBUG_FREQUENCY", default_value = "10")]
    pub inventory_debug_frequency: u32,

    /// Externally-routable ports available for lease endpoints.
    #[arg(long, env = "PROVD_EXTERNAL_PORT_QUANTITY", default_value = "1000")]
    pub external_port_quantity: u32,

    /// CPU overcommit level (committed = requested / level for > 1).
    #[arg(long, env = "PROVD_CPU_COMMIT_LEVEL", default_value = "1.0")]
    pub cpu_commit_level: f64,

    /// Memory overcommit level.
    #[arg(long, env = "PROVD_MEMORY_COMMIT_LEVEL", default_value = "1.0")]
    pub memory_commit_level: f64,

    /// Storage overcommit level.
    #[arg(long, env = "PROVD_STORAGE_COMMIT_LEVEL", default_value = "1.0")]
    pub storage_commit_level: f64,

    /// Hostnames (exact, or `.domain` suffixes) never reservable.
    #[arg(long = "blocked-hostname", env = "PROVD_BLOCKED_HOSTNAMES", value_delimiter = ',')]
    pub blocked_hostnames: Vec<String>,

    /// Monitor healthcheck period in seconds.
    #[arg(long, env = "PROVD_MONITOR_HEALTHCHECK_SECS", default_value = "10")]
    pub monitor_healthcheck_secs: u64,

    /// Monitor retry period after an unhealthy check, in seconds.
    #[arg(long, env = "PROVD_MONITOR_RETRY_SECS", default_value = "2")]
    pub monitor_retry_secs: u64,

    /// Unhealthy checks tolerated before the lease is closed.
    #[arg(long, env = "PROVD_MONITOR_MAX_RETRIES", default_value = "20")]
    pub monitor_max_retries: u32,

    /// Idle manifest manager linger in seconds.
    #[arg(long, env = "PROVD_MANIFEST_LINGER_SECS", default_value = "120")]
    pub manifest_linger_secs: u64,

    /// Manifest submission deadline in seconds.
    #[arg(long, env = "PROVD_MANIFEST_TIMEOUT_SECS", default_value = "30")]
    pub manifest_timeout_secs: u64,

    /// Accept HTTP-exposed services that declare no hostname.
    #[arg(long, env = "PROVD_ALLOW_MISSING_HOSTNAMES")]
    pub allow_missing_hostnames: bool,

    /// Lease funds check interval in seconds.
    #[arg(long, env = "PROVD_FUNDS_CHECK_SECS", default_value = "600")]
    pub funds_check_secs: u64,

    /// Forced withdrawal period in seconds; 0 disables periodic
    /// withdrawal.
    #[arg(long, env = "PROVD_WITHDRAWAL_PERIOD_SECS", default_value = "86400")]
    pub withdrawal_period_secs: u64,

    /// Pricing strategy: scale, random, or script.
    #[arg(long, env = "PROVD_PRICING", default_value = "scale")]
    pub pricing: String,

    /// Scale pricing: price per CPU millicore.
    #[arg(long, env = "PROVD_PRICE_CPU_SCALE", default_value = "1")]
    pub price_cpu_scale: u64,

    /// Scale pricing: price per MiB of memory.
    #[arg(long, env = "PROVD_PRICE_MEMORY_SCALE", default_value = "0")]
    pub price_memory_scale: u64,

    /// Scale pricing: price per MiB of storage.
    #[arg(long, env = "PROVD_PRICE_STORAGE_SCALE", default_value = "0")]
    pub price_storage_scale: u64,

    /// Scale pricing: price per exposed endpoint.
    #[arg(long, env = "PROVD_PRICE_ENDPOINT_SCALE", default_value = "0")]
    pub price_endpoint_scale: u64,

    /// Script pricing: path to the pricing executable.
    #[arg(long, env = "PROVD_PRICE_SCRIPT")]
    pub price_script: Option<PathBuf>,

    /// Script pricing: maximum concurrent invocations.
    #[arg(long, env = "PROVD_PRICE_SCRIPT_CONCURRENCY", default_value = "8")]
    pub price_script_concurrency: usize,

    /// Script pricing: per-invocation timeout in seconds.
    #[arg(long, env = "PROVD_PRICE_SCRIPT_TIMEOUT_SECS", default_value = "10")]
    pub price_script_timeout_secs: u64,
}

impl Config {
    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            inventory_poll_period: Duration::from_secs(self.inventory_poll_secs),
            inventory_debug_frequency: self.inventory_debug_frequency,
            external_port_quantity: self.external_port_quantity,
            cpu_commit_level: self.cpu_commit_level,
            memory_commit_level: self.memory_commit_level,
            storage_commit_level: self.storage_commit_level,
            blocked_hostnames: self.blocked_hostnames.clone(),
            monitor_healthcheck_period: Duration::from_secs(self.monitor_healthcheck_secs),
            monitor_retry_period: Duration::from_secs(self.monitor_retry_secs),
            monitor_max_retries: self.monitor_max_retries,
            ..ClusterConfig::default()
        }
    }

    pub fn manifest(&self) -> ManifestConfig {
        ManifestConfig {
            linger: Duration::from_secs(self.manifest_linger_secs),
            submit_timeout: Duration::from_secs(self.manifest_timeout_secs),
            require_hostnames_for_http: !self.allow_missing_hostnames,
        }
    }

    pub fn balance(&self) -> BalanceConfig {
        BalanceConfig {
            check_interval: Duration::from_secs(self.funds_check_secs),
            withdrawal_period: (self.withdrawal_period_secs > 0)
                .then(|| Duration::from_secs(self.withdrawal_period_secs)),
            ..BalanceConfig::default()
        }
    }

    pub fn pricing_strategy(&self) -> Result<Arc<dyn BidPricingStrategy>, PricingError> {
        match self.pricing.as_str() {
            "random" => Ok(Arc::new(RandomRangePricing::default())),
            "script" => {
                let path = self
                    .price_script
                    .clone()
                    .ok_or_else(|| PricingError::Script("no script path configured".to_string()))?;
                Ok(Arc::new(ShellScriptPricing::new(
                    path,
                    self.price_script_concurrency,
                    Duration::from_secs(self.price_script_timeout_secs),
                )))
            }
            _ => Ok(Arc::new(ScalePricing::new(
                self.price_cpu_scale,
                self.price_memory_scale,
                self.price_storage_scale,
                self.price_endpoint_scale,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn defaults_parse() {
        let cli = TestCli::parse_from(["provd"]);
        let config = cli.config;
        assert_eq!(config.chain_poll_secs, 5);
        assert_eq!(config.monitor_max_retries, 20);
        assert!(config.pricing_strategy().is_ok());
        assert!(config.balance().withdrawal_period.is_some());
    }

    #[test]
    fn blocked_hostnames_are_comma_separated() {
        let cli = TestCli::parse_from([
            "provd",
            "--blocked-hostname",
            "a.example.com,.internal",
        ]);
        assert_eq!(
            cli.config.blocked_hostnames,
            vec!["a.example.com".to_string(), ".internal".to_string()]
        );
        let cluster = cli.config.cluster();
        assert_eq!(cluster.blocked_hostnames.len(), 2);
    }

    #[test]
    fn zero_withdrawal_period_disables_forced_withdrawal() {
        let cli = TestCli::parse_from(["provd", "--withdrawal-period-secs", "0"]);
        assert!(cli.config.balance().withdrawal_period.is_none());
    }

    #[test]
    fn script_pricing_requires_a_path() {
        let cli = TestCli::parse_from(["provd", "--pricing", "script"]);
        assert!(cli.config.pricing_strategy().is_err());
    }
}
