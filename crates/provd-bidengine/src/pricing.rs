//! Pricing strategies.
//!
//! A strategy is a pure function of a group spec; the order state
//! machine treats them interchangeably through [`BidPricingStrategy`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::debug;

use provd_types::{GroupSpec, GIB, MIB};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PricingError {
    #[error("all scale factors are zero")]
    AllScalesZero,

    #[error("price computation overflowed")]
    Overflow,

    #[error("pricing script failed: {0}")]
    Script(String),

    #[error("pricing script timed out")]
    ScriptTimeout,

    #[error("pricing script returned an invalid price: {0}")]
    InvalidPrice(String),
}

/// Computes a bid price for a group spec.
#[async_trait]
pub trait BidPricingStrategy: Send + Sync {
    async fn calculate_price(&self, group: &GroupSpec) -> Result<u64, PricingError>;
}

/// Linear pricing: a per-unit scale factor for each resource kind,
/// summed over the group. Scales are individually optional; a strategy
/// with every scale zero would bid zero on everything and is rejected
/// at construction.
#[derive(Debug, Clone)]
pub struct ScalePricing {
    /// Price per CPU millicore.
    pub cpu_scale: u64,
    /// Price per MiB of memory.
    pub memory_scale: u64,
    /// Price per MiB of storage.
    pub storage_scale: u64,
    /// Price per exposed endpoint.
    pub endpoint_scale: u64,
}

impl ScalePricing {
    pub fn new(
        cpu_scale: u64,
        memory_scale: u64,
        storage_scale: u64,
        endpoint_scale: u64,
    ) -> Result<Self, PricingError> {
        if cpu_scale == 0 && memory_scale == 0 && storage_scale == 0 && endpoint_scale == 0 {
            return Err(PricingError::AllScalesZero);
        }
        Ok(Self {
            cpu_scale,
            memory_scale,
            storage_scale,
            endpoint_scale,
        })
    }
}

#[async_trait]
impl BidPricingStrategy for ScalePricing {
    async fn calculate_price(&self, group: &GroupSpec) -> Result<u64, PricingError> {
        let mut total: u64 = 0;
        for resource in &group.resources {
            let unit = self
                .cpu_scale
                .checked_mul(resource.resources.cpu_millis)
                .and_then(|cpu| {
                    self.memory_scale
                        .checked_mul(resource.resources.memory_bytes / MIB)
                        .and_then(|v| cpu.checked_add(v))
                })
                .and_then(|acc| {
                    self.storage_scale
                        .checked_mul(resource.resources.storage_bytes / MIB)
                        .and_then(|v| acc.checked_add(v))
                })
                .and_then(|acc| {
                    self.endpoint_scale
                        .checked_mul(u64::from(resource.resources.endpoints))
                        .and_then(|v| acc.checked_add(v))
                })
                .ok_or(PricingError::Overflow)?;
            total = unit
                .checked_mul(u64::from(resource.count))
                .and_then(|v| total.checked_add(v))
                .ok_or(PricingError::Overflow)?;
        }
        Ok(total)
    }
}

/// Uniform random pricing in a memory-scaled band, clamped so the bid
/// never exceeds the group's declared maximum price.
#[derive(Debug, Clone)]
pub struct RandomRangePricing {
    /// Band floor, per GiB of requested memory.
    pub min_per_gib: u64,
    /// Band ceiling, per GiB of requested memory.
    pub max_per_gib: u64,
}

impl Default for RandomRangePricing {
    fn default() -> Self {
        Self {
            min_per_gib: 50,
            max_per_gib: 100,
        }
    }
}

#[async_trait]
impl BidPricingStrategy for RandomRangePricing {
    async fn calculate_price(&self, group: &GroupSpec) -> Result<u64, PricingError> {
        // At least one GiB-equivalent so tiny groups still get a band.
        let gib = (group.memory_total().max(1) + GIB - 1) / GIB;

        let ceiling = group.price();
        let max = self.max_per_gib.saturating_mul(gib).min(ceiling);
        let min = self.min_per_gib.saturating_mul(gib).min(max);

        if min == max {
            return Ok(min);
        }
        Ok(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Serialize)]
struct ScriptResource<'a> {
    cpu: u64,
    memory: u64,
    storage: u64,
    endpoints: u32,
    count: u32,
    price: u64,
    #[serde(skip_serializing_if = "str::is_empty")]
    group: &'a str,
}

/// Delegates pricing to an operator-supplied executable. The group's
/// resources are written to the script's stdin as JSON; the script must
/// print a single positive integer price. Concurrent invocations are
/// bounded by a semaphore and each run is bounded by a timeout.
pub struct ShellScriptPricing {
    path: PathBuf,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl ShellScriptPricing {
    pub fn new(path: PathBuf, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            path,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            timeout,
        }
    }
}

#[async_trait]
impl BidPricingStrategy for ShellScriptPricing {
    async fn calculate_price(&self, group: &GroupSpec) -> Result<u64, PricingError> {
        // Held for the whole invocation; released on every exit path
        // when the permit drops.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PricingError::Script("semaphore closed".to_string()))?;

        let input: Vec<ScriptResource<'_>> = group
            .resources
            .iter()
            .map(|r| ScriptResource {
                cpu: r.resources.cpu_millis,
                memory: r.resources.memory_bytes,
                storage: r.resources.storage_bytes,
                endpoints: r.resources.endpoints,
                count: r.count,
                price: r.price,
                group: &group.name,
            })
            .collect();
        let payload =
            serde_json::to_vec(&input).map_err(|e| PricingError::Script(e.to_string()))?;

        let run = async {
            let mut child = Command::new(&self.path)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| PricingError::Script(e.to_string()))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&payload)
                    .await
                    .map_err(|e| PricingError::Script(e.to_string()))?;
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| PricingError::Script(e.to_string()))?;
            if !output.status.success() {
                return Err(PricingError::Script(format!(
                    "exit status {}",
                    output.status
                )));
            }
            parse_price(&output.stdout)
        };

        let price = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| PricingError::ScriptTimeout)??;
        debug!(group = %group.name, price, "script pricing complete");
        Ok(price)
    }
}

/// Strict positive-integer parse: no sign, no fraction, no garbage.
fn parse_price(stdout: &[u8]) -> Result<u64, PricingError> {
    let text = std::str::from_utf8(stdout)
        .map_err(|_| PricingError::InvalidPrice("non-utf8 output".to_string()))?
        .trim();
    if text.is_empty() {
        return Err(PricingError::InvalidPrice("empty output".to_string()));
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PricingError::InvalidPrice(text.to_string()));
    }
    let price: u64 = text
        .parse()
        .map_err(|_| PricingError::InvalidPrice(text.to_string()))?;
    if price == 0 {
        return Err(PricingError::InvalidPrice("zero price".to_string()));
    }
    Ok(price)
}
