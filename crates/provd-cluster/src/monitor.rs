//! Per-lease health monitor.
//!
//! Started by the deployment manager once a deploy completes. Polls the
//! backend for per-service availability on a jittered cadence, publishes
//! pending/deployed status events, and closes the lease on chain when a
//! deployment stays unhealthy past the retry budget.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use provd_chain::Session;
use provd_pubsub::Bus;
use provd_types::{DeploymentStatus, Event, LeaseId, ManifestGroup};

use crate::client::{ClusterClient, ClusterError, LeaseStatus};
use crate::config::ClusterConfig;

pub(crate) struct Monitor {
    lease_id: LeaseId,
    group: ManifestGroup,
    client: Arc<dyn ClusterClient>,
    session: Session,
    bus: Bus,
    config: ClusterConfig,
    shutdown: watch::Receiver<bool>,
}

impl Monitor {
    pub(crate) fn spawn(
        lease_id: LeaseId,
        group: ManifestGroup,
        client: Arc<dyn ClusterClient>,
        session: Session,
        bus: Bus,
        config: ClusterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Self {
            lease_id,
            group,
            client,
            session,
            bus,
            config,
            shutdown,
        };
        tokio::spawn(monitor.run())
    }

    async fn run(mut self) {
        info!(lease_id = %self.lease_id, "deployment monitor starting");

        let mut attempts: u32 = 0;
        // First check runs on the healthcheck cadence; the retry
        // cadence only applies after an unhealthy result.
        let mut next = Instant::now()
            + jittered(
                self.config.monitor_healthcheck_period,
                self.config.monitor_healthcheck_jitter,
            );
        let mut check: Option<JoinHandle<Result<LeaseStatus, ClusterError>>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                _ = tokio::time::sleep_until(next), if check.is_none() => {
                    let client = self.client.clone();
                    let lease_id = self.lease_id.clone();
                    check = Some(tokio::spawn(async move {
                        client.lease_status(&lease_id).await
                    }));
                }

                res = async { check.as_mut().expect("check in flight").await }, if check.is_some() => {
                    check = None;
                    let healthy = match res {
                        Ok(Ok(status)) => self.is_healthy(&status),
                        Ok(Err(err)) => {
                            warn!(lease_id = %self.lease_id, %err, "lease status check failed");
                            false
                        }
                        Err(err) => {
                            error!(lease_id = %self.lease_id, %err, "lease status task panicked");
                            false
                        }
                    };

                    if healthy {
                        attempts = 0;
                        self.publish(DeploymentStatus::Deployed);
                        next = Instant::now()
                            + jittered(
                                self.config.monitor_healthcheck_period,
                                self.config.monitor_healthcheck_jitter,
                            );
                    } else {
                        attempts += 1;
                        self.publish(DeploymentStatus::Pending);
                        if attempts > self.config.monitor_max_retries {
                            warn!(
                                lease_id = %self.lease_id,
                                attempts,
                                "deployment never became healthy, closing lease"
                            );
                            if let Err(err) =
                                self.session.tx().close_lease(&self.lease_id).await
                            {
                                error!(lease_id = %self.lease_id, %err, "close lease failed");
                            }
                            break;
                        }
                        next = Instant::now()
                            + jittered(
                                self.config.monitor_retry_period,
                                self.config.monitor_retry_jitter,
                            );
                    }
                }
            }
        }

        if let Some(check) = check {
            check.abort();
        }
        debug!(lease_id = %self.lease_id, "deployment monitor stopped");
    }

    /// Healthy means every declared service reports at least its
    /// target replica count available. A missing service is a
    /// shortfall.
    fn is_healthy(&self, status: &LeaseStatus) -> bool {
        self.group.services.iter().all(|service| {
            status
                .services
                .get(&service.name)
                .map(|s| s.available >= service.count)
                .unwrap_or(false)
        })
    }

    fn publish(&self, status: DeploymentStatus) {
        let result = self.bus.publish(Event::ClusterDeployment {
            lease_id: self.lease_id.clone(),
            group_name: self.group.name.clone(),
            status,
        });
        if let Err(err) = result {
            warn!(lease_id = %self.lease_id, %err, "status publish failed");
        }
    }
}

pub(crate) fn jittered(period: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return period;
    }
    period + rand::thread_rng().gen_range(Duration::ZERO..jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use provd_chain::mock::MockChain;
    use provd_chain::{ProviderInfo, Session};
    use provd_types::{OrderId, ResourceUnits, Service};

    fn lease() -> LeaseId {
        LeaseId {
            order: OrderId {
                owner: "owner".to_string(),
                dseq: 1,
                gseq: 1,
                oseq: 1,
            },
            provider: "provider".to_string(),
        }
    }

    fn group() -> ManifestGroup {
        ManifestGroup {
            name: "web".to_string(),
            services: vec![Service {
                name: "api".to_string(),
                image: "registry/api:1".to_string(),
                args: Vec::new(),
                env: Vec::new(),
                resources: ResourceUnits {
                    cpu_millis: 100,
                    memory_bytes: 1 << 20,
                    storage_bytes: 0,
                    endpoints: 0,
                },
                count: 2,
                expose: Vec::new(),
            }],
        }
    }

    fn session(chain: Arc<MockChain>) -> Session {
        Session::new(
            ProviderInfo {
                address: "provider".to_string(),
                attributes: Vec::new(),
            },
            chain.clone(),
            chain,
        )
    }

    fn fast_config() -> ClusterConfig {
        ClusterConfig {
            monitor_healthcheck_period: Duration::from_millis(10),
            monitor_healthcheck_jitter: Duration::ZERO,
            monitor_retry_period: Duration::from_millis(5),
            monitor_retry_jitter: Duration::ZERO,
            monitor_max_retries: 3,
            ..ClusterConfig::default()
        }
    }

    #[tokio::test]
    async fn healthy_lease_publishes_deployed() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_lease_status(lease(), &[("api", 2, 2)]);
        let chain = Arc::new(MockChain::new());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = Monitor::spawn(
            lease(),
            group(),
            cluster,
            session(chain),
            bus.clone(),
            fast_config(),
            stop_rx,
        );

        let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            Event::ClusterDeployment {
                lease_id: lease(),
                group_name: "web".to_string(),
                status: DeploymentStatus::Deployed,
            }
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn replica_shortfall_publishes_pending() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_lease_status(lease(), &[("api", 1, 2)]);
        let chain = Arc::new(MockChain::new());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = Monitor::spawn(
            lease(),
            group(),
            cluster,
            session(chain),
            bus.clone(),
            fast_config(),
            stop_rx,
        );

        let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ev,
            Event::ClusterDeployment {
                lease_id: lease(),
                group_name: "web".to_string(),
                status: DeploymentStatus::Pending,
            }
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_closes_lease() {
        let cluster = Arc::new(MockCluster::new());
        // No scripted status: every check is unhealthy.
        let chain = Arc::new(MockChain::new());
        let bus = Bus::new();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let handle = Monitor::spawn(
            lease(),
            group(),
            cluster,
            session(chain.clone()),
            bus.clone(),
            fast_config(),
            stop_rx,
        );

        // Monitor stops on its own after exhausting retries.
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let broadcasts = chain.broadcasts();
        assert!(broadcasts
            .iter()
            .any(|b| matches!(b, provd_chain::mock::Broadcast::CloseLease(id) if *id == lease())));
    }

    #[tokio::test]
    async fn first_check_runs_on_healthcheck_cadence() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_lease_status(lease(), &[("api", 2, 2)]);
        let chain = Arc::new(MockChain::new());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let config = ClusterConfig {
            monitor_healthcheck_period: Duration::from_millis(300),
            monitor_healthcheck_jitter: Duration::ZERO,
            monitor_retry_period: Duration::from_millis(5),
            monitor_retry_jitter: Duration::ZERO,
            monitor_max_retries: 3,
            ..ClusterConfig::default()
        };
        let handle = Monitor::spawn(
            lease(),
            group(),
            cluster,
            session(chain),
            bus.clone(),
            config,
            stop_rx,
        );

        // No check fires on the (much shorter) retry cadence.
        assert!(tokio::time::timeout(Duration::from_millis(150), sub.recv())
            .await
            .is_err());

        let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            ev,
            Event::ClusterDeployment {
                status: DeploymentStatus::Deployed,
                ..
            }
        ));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn healthy_check_resets_retry_budget() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_lease_status(lease(), &[("api", 2, 2)]);
        let chain = Arc::new(MockChain::new());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = Monitor::spawn(
            lease(),
            group(),
            cluster,
            session(chain.clone()),
            bus.clone(),
            fast_config(),
            stop_rx,
        );

        // Several healthy cycles pass without the monitor closing the
        // lease.
        for _ in 0..5 {
            let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(
                ev,
                Event::ClusterDeployment {
                    status: DeploymentStatus::Deployed,
                    ..
                }
            ));
        }
        assert!(chain.broadcasts().is_empty());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
