//! Manifest layer of the provider daemon.
//!
//! Tenants upload workload manifests off-chain; this crate pairs each
//! upload with the deployment's won leases and its on-chain record,
//! validates version hash and structural conformance, and publishes
//! manifest-received events consumed by the cluster layer.

mod manager;
mod service;

use thiserror::Error;

use provd_chain::ChainError;
use provd_types::DeploymentId;

pub use service::{ManifestConfig, ManifestService, ManifestStatus};

/// Manifest layer errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// Upload does not hash to the version recorded on chain.
    #[error("manifest version mismatch")]
    ManifestVersion,

    #[error("no lease for deployment {0}")]
    NoLeaseForDeployment(DeploymentId),

    #[error(transparent)]
    Validation(#[from] provd_types::ManifestError),

    /// Every HTTP-exposed service needs at least one hostname.
    #[error("service {0} exposes HTTP without a hostname")]
    MissingHostname(String),

    /// A newer upload replaced this one before it completed.
    #[error("superseded by a newer manifest")]
    Superseded,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use async_trait::async_trait;

    use provd_chain::mock::MockChain;
    use provd_chain::{
        BidInfo, ChainError, DeploymentInfo, EscrowAccount, LeaseInfo, LeaseState, OrderInfo,
        ProviderInfo, QueryClient, Session, SyncInfo,
    };
    use provd_pubsub::Bus;
    use provd_types::{
        manifest_version, DeploymentId, Event, GroupSpec, LeaseId, Manifest, ManifestGroup,
        OrderId, PlacementRequirements, Resource, ResourceUnits, Service, ServiceExpose,
        ServiceProto,
    };

    use super::*;

    const PROVIDER: &str = "provider";

    fn lease_id() -> LeaseId {
        LeaseId {
            order: OrderId {
                owner: "tenant".to_string(),
                dseq: 5,
                gseq: 1,
                oseq: 1,
            },
            provider: PROVIDER.to_string(),
        }
    }

    fn deployment_id() -> DeploymentId {
        lease_id().deployment_id()
    }

    fn group_spec() -> GroupSpec {
        GroupSpec {
            name: "web".to_string(),
            requirements: PlacementRequirements::default(),
            resources: vec![Resource {
                resources: ResourceUnits {
                    cpu_millis: 100,
                    memory_bytes: 1 << 30,
                    storage_bytes: 0,
                    endpoints: 1,
                },
                count: 2,
                price: 100,
            }],
        }
    }

    fn manifest(hosts: &[&str]) -> Manifest {
        Manifest {
            groups: vec![ManifestGroup {
                name: "web".to_string(),
                services: vec![Service {
                    name: "api".to_string(),
                    image: "registry/api:1".to_string(),
                    args: Vec::new(),
                    env: Vec::new(),
                    resources: ResourceUnits {
                        cpu_millis: 100,
                        memory_bytes: 1 << 30,
                        storage_bytes: 0,
                        endpoints: 1,
                    },
                    count: 2,
                    expose: vec![ServiceExpose {
                        port: 80,
                        external_port: 0,
                        proto: ServiceProto::Tcp,
                        global: true,
                        hosts: hosts.iter().map(|h| h.to_string()).collect(),
                    }],
                }],
            }],
        }
    }

    fn seed_chain(chain: &MockChain, manifest: &Manifest) {
        chain.set_deployment(DeploymentInfo {
            id: deployment_id(),
            version: manifest_version(manifest),
            groups: vec![group_spec()],
        });
    }

    fn session(chain: Arc<MockChain>) -> Session {
        Session::new(
            ProviderInfo {
                address: PROVIDER.to_string(),
                attributes: Vec::new(),
            },
            chain.clone(),
            chain,
        )
    }

    async fn start(
        chain: Arc<MockChain>,
        config: ManifestConfig,
    ) -> (ManifestService, Bus, watch::Sender<bool>) {
        let bus = Bus::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (svc, _handle) = ManifestService::spawn(session(chain), bus.clone(), config, stop_rx)
            .await
            .unwrap();
        (svc, bus, stop_tx)
    }

    #[tokio::test]
    async fn validated_manifest_is_fanned_out_per_lease() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let (svc, bus, _stop) = start(chain, ManifestConfig::default()).await;
        let mut watcher = bus.subscribe().await.unwrap();

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        svc.submit(deployment_id(), m.clone(), None).await.unwrap();

        loop {
            let ev = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
                .await
                .unwrap()
                .unwrap();
            if let Event::ManifestReceived { lease_id: got, group } = ev {
                assert_eq!(got, lease_id());
                assert_eq!(group, m.groups[0]);
                break;
            }
        }
    }

    #[tokio::test]
    async fn manifest_before_lease_waits_for_pairing() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        // Lease exists on chain already, so the service adopts it at
        // startup even though no event has fired yet.
        chain.add_lease(LeaseInfo {
            id: lease_id(),
            price: 100,
            state: LeaseState::Active,
        });
        let (svc, _bus, _stop) = start(chain, ManifestConfig::default()).await;

        svc.submit(deployment_id(), m, None).await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_is_rejected_for_any_mutation() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let (svc, bus, _stop) = start(chain, ManifestConfig::default()).await;

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Any content difference changes the hash.
        let mut mutated = m.clone();
        mutated.groups[0].services[0].env.push("A=1".to_string());
        assert_eq!(
            svc.submit(deployment_id(), mutated, None).await.unwrap_err(),
            ManifestError::ManifestVersion
        );

        let mut mutated = m.clone();
        mutated.groups[0].services[0].image = "registry/api:2".to_string();
        assert_eq!(
            svc.submit(deployment_id(), mutated, None).await.unwrap_err(),
            ManifestError::ManifestVersion
        );

        // The unmutated manifest still passes.
        svc.submit(deployment_id(), m, None).await.unwrap();
    }

    #[tokio::test]
    async fn submission_without_lease_fails_fast() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let (svc, _bus, _stop) = start(chain, ManifestConfig::default()).await;

        let started = std::time::Instant::now();
        let err = svc.submit(deployment_id(), m, None).await.unwrap_err();
        assert_eq!(err, ManifestError::NoLeaseForDeployment(deployment_id()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn http_service_without_hostname_is_rejected() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&[]);
        seed_chain(&chain, &m);
        let (svc, bus, _stop) = start(chain, ManifestConfig::default()).await;

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            svc.submit(deployment_id(), m, None).await.unwrap_err(),
            ManifestError::MissingHostname("api".to_string())
        );
    }

    #[tokio::test]
    async fn hostname_requirement_can_be_disabled() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&[]);
        seed_chain(&chain, &m);
        let config = ManifestConfig {
            require_hostnames_for_http: false,
            ..ManifestConfig::default()
        };
        let (svc, bus, _stop) = start(chain, config).await;

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        svc.submit(deployment_id(), m, None).await.unwrap();
    }

    /// Forwards to a [`MockChain`] except that deployment record
    /// queries never resolve.
    struct StalledDeployments(Arc<MockChain>);

    #[async_trait]
    impl QueryClient for StalledDeployments {
        async fn group(&self, id: &provd_types::GroupId) -> Result<GroupSpec, ChainError> {
            self.0.group(id).await
        }

        async fn deployment(&self, _id: &DeploymentId) -> Result<DeploymentInfo, ChainError> {
            std::future::pending().await
        }

        async fn open_orders(&self) -> Result<Vec<OrderInfo>, ChainError> {
            self.0.open_orders().await
        }

        async fn bid(&self, id: &provd_types::BidId) -> Result<Option<BidInfo>, ChainError> {
            self.0.bid(id).await
        }

        async fn provider_leases(&self, provider: &str) -> Result<Vec<LeaseInfo>, ChainError> {
            self.0.provider_leases(provider).await
        }

        async fn deployment_leases(&self, id: &DeploymentId) -> Result<Vec<LeaseInfo>, ChainError> {
            self.0.deployment_leases(id).await
        }

        async fn provider(&self, address: &str) -> Result<ProviderInfo, ChainError> {
            self.0.provider(address).await
        }

        async fn auditor_attributes(
            &self,
            auditor: &str,
            provider: &str,
        ) -> Result<Option<Vec<provd_types::Attribute>>, ChainError> {
            self.0.auditor_attributes(auditor, provider).await
        }

        async fn escrow_account(&self, id: &DeploymentId) -> Result<EscrowAccount, ChainError> {
            self.0.escrow_account(id).await
        }

        async fn sync_info(&self) -> Result<SyncInfo, ChainError> {
            self.0.sync_info().await
        }
    }

    #[tokio::test]
    async fn submission_deadline_is_honored() {
        // The deployment record never arrives, so a paired lease still
        // cannot complete the submission before the caller's deadline.
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let session = Session::new(
            ProviderInfo {
                address: PROVIDER.to_string(),
                attributes: Vec::new(),
            },
            Arc::new(StalledDeployments(chain.clone())),
            chain,
        );
        let bus = Bus::new();
        let (_stop, stop_rx) = watch::channel(false);
        let (svc, _handle) =
            ManifestService::spawn(session, bus.clone(), ManifestConfig::default(), stop_rx)
                .await
                .unwrap();

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = svc
            .submit(deployment_id(), m, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err, ManifestError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn submission_after_last_lease_closes_fails_fast() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let (svc, bus, _stop) = start(chain, ManifestConfig::default()).await;

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(Event::LeaseClosed { lease_id: lease_id() }).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The lingering manager has no lease left; the submission must
        // not sit out its deadline.
        let started = std::time::Instant::now();
        let err = svc
            .submit(deployment_id(), m, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, ManifestError::NoLeaseForDeployment(deployment_id()));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn idle_manager_stops_after_linger() {
        let chain = Arc::new(MockChain::new());
        let m = manifest(&["app.example.com"]);
        seed_chain(&chain, &m);
        let config = ManifestConfig {
            linger: Duration::from_millis(100),
            ..ManifestConfig::default()
        };
        let (svc, bus, _stop) = start(chain, config).await;

        bus.publish(Event::LeaseWon {
            lease_id: lease_id(),
            group: group_spec(),
            price: 100,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.status().await.unwrap().managers, 1);

        bus.publish(Event::LeaseClosed { lease_id: lease_id() }).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(svc.status().await.unwrap().managers, 0);
    }
}
