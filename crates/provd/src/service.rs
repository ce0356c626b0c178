//! Daemon assembly.
//!
//! Wires the bus, cluster, bid engine, manifest, balance, withdraw and
//! listener tasks together and tears them down in dependency order.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use provd_bidengine::{BidEngineService, BidEngineStatus};
use provd_chain::Session;
use provd_cluster::{ClusterClient, ClusterService, ClusterServiceStatus};
use provd_manifest::{ManifestService, ManifestStatus};
use provd_pubsub::Bus;

use crate::balance::BalanceChecker;
use crate::config::Config;
use crate::http::ManifestIngest;
use crate::listener::ChainListener;
use crate::withdraw::WithdrawHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStatus {
    pub cluster: ClusterServiceStatus,
    pub bidengine: BidEngineStatus,
    pub manifest: ManifestStatus,
}

/// A fully wired provider daemon. Dropping it does not stop anything;
/// flip the shutdown channel and call [`ProviderService::join`].
pub struct ProviderService {
    bus: Bus,
    cluster: ClusterService,
    bidengine: BidEngineService,
    manifests: ManifestService,
    handles: Handles,
}

struct Handles {
    http: JoinHandle<()>,
    listener: JoinHandle<()>,
    bidengine: JoinHandle<()>,
    manifest: JoinHandle<()>,
    balance: JoinHandle<()>,
    withdraw: JoinHandle<()>,
    cluster: JoinHandle<()>,
}

impl ProviderService {
    pub async fn start(
        session: Session,
        cluster_client: Arc<dyn ClusterClient>,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let pricing = config.pricing_strategy()?;
        let bus = Bus::new();

        let (cluster, cluster_handle) = ClusterService::spawn(
            cluster_client,
            session.clone(),
            bus.clone(),
            config.cluster(),
            shutdown.clone(),
        )
        .await?;

        let (bidengine, bidengine_handle) = BidEngineService::spawn(
            session.clone(),
            cluster.inventory().clone(),
            pricing,
            bus.clone(),
            shutdown.clone(),
        )
        .await?;

        let (manifests, manifest_handle) = ManifestService::spawn(
            session.clone(),
            bus.clone(),
            config.manifest(),
            shutdown.clone(),
        )
        .await?;

        let balance_handle = BalanceChecker::spawn(
            session.clone(),
            bus.clone(),
            config.balance(),
            shutdown.clone(),
        )
        .await?;

        let withdraw_handle =
            WithdrawHandler::spawn(session.clone(), &bus, shutdown.clone()).await?;

        let listener_handle = ChainListener::spawn(
            session.clone(),
            bus.clone(),
            std::time::Duration::from_secs(config.chain_poll_secs),
            shutdown.clone(),
        );

        let http_handle = ManifestIngest::new(config.listen, manifests.clone())
            .serve(shutdown)
            .await?;

        info!(provider = %session.provider_address(), "provider daemon started");
        Ok(Self {
            bus,
            cluster,
            bidengine,
            manifests,
            handles: Handles {
                http: http_handle,
                listener: listener_handle,
                bidengine: bidengine_handle,
                manifest: manifest_handle,
                balance: balance_handle,
                withdraw: withdraw_handle,
                cluster: cluster_handle,
            },
        })
    }

    pub fn manifests(&self) -> &ManifestService {
        &self.manifests
    }

    pub async fn status(&self) -> anyhow::Result<ProviderStatus> {
        Ok(ProviderStatus {
            cluster: self.cluster.status().await?,
            bidengine: self.bidengine.status().await?,
            manifest: self.manifests.status().await?,
        })
    }

    /// Wait for every task to exit. Event producers drain first so the
    /// consumers below them see a quiet bus while they tear down.
    pub async fn join(self) {
        let Handles {
            http,
            listener,
            bidengine,
            manifest,
            balance,
            withdraw,
            cluster,
        } = self.handles;
        for (name, handle) in [
            ("http", http),
            ("listener", listener),
            ("bidengine", bidengine),
            ("manifest", manifest),
            ("balance", balance),
            ("withdraw", withdraw),
            ("cluster", cluster),
        ] {
            if let Err(err) = handle.await {
                warn!(task = name, %err, "task panicked during shutdown");
            }
        }
        self.bus.close().await;
        info!("provider daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use provd_chain::mock::MockChain;
    use provd_chain::ProviderInfo;
    use provd_cluster::mock::MockCluster;
    use provd_cluster::Node;
    use provd_types::ResourceUnits;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: Config,
    }

    fn test_config() -> Config {
        // Port 0 so parallel tests never collide on the listen socket.
        TestCli::parse_from(["provd", "--listen", "127.0.0.1:0"]).config
    }

    #[tokio::test]
    async fn starts_and_stops_cleanly() {
        let chain = Arc::new(MockChain::new());
        let session = Session::new(
            ProviderInfo {
                address: "provider".to_string(),
                attributes: Vec::new(),
            },
            chain.clone(),
            chain,
        );
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![Node {
            name: "node0".to_string(),
            available: ResourceUnits {
                cpu_millis: 8000,
                memory_bytes: 16 << 30,
                storage_bytes: 100 << 30,
                endpoints: 0,
            },
        }]);

        let (stop_tx, stop_rx) = watch::channel(false);
        let service = ProviderService::start(session, cluster, &test_config(), stop_rx)
            .await
            .unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status.cluster.deployments, 0);
        assert_eq!(status.bidengine.orders, 0);
        assert_eq!(status.manifest.managers, 0);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), service.join())
            .await
            .expect("shutdown hung");
    }
}
