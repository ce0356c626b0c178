//! Lease escrow monitoring.
//!
//! One lightweight watcher task per active lease. Each check estimates
//! how many funded blocks remain from the deployment's escrow account
//! and the aggregate price of its active leases, then either schedules
//! the next check or triggers a withdrawal. Watchers also fire
//! periodic forced withdrawals when configured.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use provd_chain::{LeaseState, Session};
use provd_pubsub::{Bus, Subscriber};
use provd_types::{Event, LeaseId};

/// Average block time of the chain.
const BLOCK_PERIOD: Duration = Duration::from_secs(6);
/// Retry delay while the queried node is still catching up.
const SYNC_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BalanceConfig {
    /// Upper bound between two funds checks for one lease.
    pub check_interval: Duration,
    /// Forced withdrawal period; `None` disables periodic withdrawal.
    pub withdrawal_period: Option<Duration>,
    /// New watchers delay their first check by up to this much, so a
    /// restart does not stampede the query endpoint.
    pub start_jitter_max: Duration,
    /// Withdrawal delay once a lease is observed out of funds.
    pub out_of_funds_delay: Duration,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10 * 60),
            withdrawal_period: Some(Duration::from_secs(24 * 60 * 60)),
            start_jitter_max: Duration::from_secs(60),
            out_of_funds_delay: Duration::from_secs(10 * 60),
        }
    }
}

/// Owns the per-lease watcher map. Watchers come and go with
/// add/remove-funds-monitor events; lease-won adds one directly so the
/// daemon needs no extra glue.
pub struct BalanceChecker {
    session: Session,
    bus: Bus,
    config: BalanceConfig,
    sub: Subscriber,
    shutdown: watch::Receiver<bool>,
    watchers: HashMap<LeaseId, (watch::Sender<bool>, JoinHandle<()>)>,
}

impl BalanceChecker {
    pub async fn spawn(
        session: Session,
        bus: Bus,
        config: BalanceConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, provd_pubsub::PubsubError> {
        let sub = bus.subscribe().await?;
        let mut checker = Self {
            session,
            bus,
            config,
            sub,
            shutdown,
            watchers: HashMap::new(),
        };

        // Leases already active on chain get watchers immediately.
        match checker
            .session
            .query()
            .provider_leases(checker.session.provider_address())
            .await
        {
            Ok(leases) => {
                for lease in leases {
                    if lease.state == LeaseState::Active {
                        checker.add_watcher(lease.id);
                    }
                }
            }
            Err(err) => warn!(%err, "existing lease query failed"),
        }

        info!(watchers = checker.watchers.len(), "balance checker starting");
        Ok(tokio::spawn(checker.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    match ev {
                        Event::LeaseWon { lease_id, .. }
                        | Event::LeaseAddFundsMonitor { lease_id } => {
                            self.add_watcher(lease_id);
                        }
                        Event::LeaseClosed { lease_id }
                        | Event::LeaseRemoveFundsMonitor { lease_id } => {
                            self.remove_watcher(&lease_id).await;
                        }
                        _ => {}
                    }
                }
            }
        }

        for (_, (stop_tx, handle)) in self.watchers.drain() {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
        info!("balance checker stopped");
    }

    fn add_watcher(&mut self, lease_id: LeaseId) {
        if let Some((_, handle)) = self.watchers.get(&lease_id) {
            if !handle.is_finished() {
                return;
            }
        }
        debug!(%lease_id, "watching lease funds");
        let (stop_tx, stop_rx) = watch::channel(false);
        let watcher = Watcher {
            lease_id: lease_id.clone(),
            session: self.session.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            shutdown: stop_rx,
        };
        self.watchers
            .insert(lease_id, (stop_tx, tokio::spawn(watcher.run())));
    }

    async fn remove_watcher(&mut self, lease_id: &LeaseId) {
        if let Some((stop_tx, handle)) = self.watchers.remove(lease_id) {
            debug!(%lease_id, "dropping funds watcher");
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }
}

struct Watcher {
    lease_id: LeaseId,
    session: Session,
    bus: Bus,
    config: BalanceConfig,
    shutdown: watch::Receiver<bool>,
}

impl Watcher {
    async fn run(mut self) {
        let jitter = if self.config.start_jitter_max.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.config.start_jitter_max)
        };
        let mut next_check = Instant::now() + jitter;
        let mut withdraw_at: Option<Instant> = self
            .config
            .withdrawal_period
            .map(|period| Instant::now() + period);

        loop {
            let withdraw_deadline = withdraw_at.unwrap_or_else(|| far_future());
            tokio::select! {
                _ = self.shutdown.changed() => break,

                _ = tokio::time::sleep_until(next_check) => {
                    match self.check().await {
                        CheckOutcome::Retry(delay) => next_check = Instant::now() + delay,
                        CheckOutcome::OutOfFunds => {
                            info!(lease_id = %self.lease_id, "lease out of funds");
                            let delay = self.config.out_of_funds_delay;
                            let trigger = Instant::now() + delay;
                            if withdraw_at.map(|at| trigger < at).unwrap_or(true) {
                                withdraw_at = Some(trigger);
                            }
                            next_check = Instant::now() + self.config.check_interval;
                        }
                    }
                }

                _ = tokio::time::sleep_until(withdraw_deadline), if withdraw_at.is_some() => {
                    debug!(lease_id = %self.lease_id, "withdrawal due");
                    if let Err(err) = self.bus.publish(Event::LeaseWithdraw {
                        lease_id: self.lease_id.clone(),
                    }) {
                        warn!(lease_id = %self.lease_id, %err, "withdraw publish failed");
                    }
                    withdraw_at = self
                        .config
                        .withdrawal_period
                        .map(|period| Instant::now() + period);
                }
            }
        }
        debug!(lease_id = %self.lease_id, "funds watcher stopped");
    }

    async fn check(&self) -> CheckOutcome {
        let query = self.session.query();

        let sync = match query.sync_info().await {
            Ok(sync) => sync,
            Err(err) => {
                warn!(lease_id = %self.lease_id, %err, "sync query failed");
                return CheckOutcome::Retry(SYNC_RETRY);
            }
        };
        if sync.catching_up {
            debug!(lease_id = %self.lease_id, "node catching up, deferring check");
            return CheckOutcome::Retry(SYNC_RETRY);
        }

        let deployment_id = self.lease_id.deployment_id();
        let account = match query.escrow_account(&deployment_id).await {
            Ok(account) => account,
            Err(err) => {
                warn!(lease_id = %self.lease_id, %err, "escrow query failed");
                return CheckOutcome::Retry(self.config.check_interval);
            }
        };
        let price_per_block = match query.deployment_leases(&deployment_id).await {
            Ok(leases) => leases
                .iter()
                .filter(|l| l.state == LeaseState::Active)
                .map(|l| l.price)
                .sum::<u64>(),
            Err(err) => {
                warn!(lease_id = %self.lease_id, %err, "lease query failed");
                return CheckOutcome::Retry(self.config.check_interval);
            }
        };
        if price_per_block == 0 {
            return CheckOutcome::Retry(self.config.check_interval);
        }

        let remaining = remaining_blocks(
            account.balance,
            account.settled_at,
            sync.latest_block_height,
            price_per_block,
        );
        debug!(lease_id = %self.lease_id, remaining, "funds check");
        if remaining == 0 {
            return CheckOutcome::OutOfFunds;
        }

        let funded_for = BLOCK_PERIOD.saturating_mul(remaining.min(u64::from(u32::MAX)) as u32);
        CheckOutcome::Retry(funded_for.min(self.config.check_interval))
    }
}

enum CheckOutcome {
    Retry(Duration),
    OutOfFunds,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

/// Blocks the escrow can still cover, rounded down. Burn since the
/// last settlement is charged before dividing.
fn remaining_blocks(balance: u64, settled_at: u64, height: u64, price_per_block: u64) -> u64 {
    let burned = height
        .saturating_sub(settled_at)
        .saturating_mul(price_per_block);
    balance.saturating_sub(burned) / price_per_block
}
