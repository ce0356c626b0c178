//! Cluster service: owns the inventory, hostname claims, and one
//! deployment manager per won lease.
//!
//! Reacts to bus events: a validated manifest starts or updates a
//! manager, a closed lease tears its manager down and releases the
//! inventory reservation. On startup, deployments already running on
//! the backend are re-adopted so monitoring and reservations survive a
//! daemon restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use provd_chain::Session;
use provd_pubsub::{Bus, Subscriber};
use provd_types::{Event, GroupSpec, LeaseId, ManifestGroup, Resource};

use crate::client::{ClusterClient, ClusterError};
use crate::config::ClusterConfig;
use crate::hostname::HostnameService;
use crate::inventory::InventoryService;
use crate::manager::DeploymentManager;

const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Counters for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterServiceStatus {
    pub deployments: usize,
    pub active_reservations: usize,
    pub pending_reservations: usize,
}

enum Cmd {
    Status {
        reply: oneshot::Sender<ClusterServiceStatus>,
    },
}

/// Handle to the cluster service task. Cheap to clone.
#[derive(Clone)]
pub struct ClusterService {
    cmd_tx: mpsc::Sender<Cmd>,
    inventory: InventoryService,
    hostnames: HostnameService,
}

impl ClusterService {
    /// Spawn the service and its inventory/hostname children. Fails if
    /// the backend cannot report its running deployments.
    pub async fn spawn(
        client: Arc<dyn ClusterClient>,
        session: Session,
        bus: Bus,
        config: ClusterConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), ClusterError> {
        let recovered = client.deployments().await?;
        info!(count = recovered.len(), "adopting existing deployments");

        let seeds = recovered
            .iter()
            .map(|d| (d.lease_id.order_id(), reservation_spec(&d.group)))
            .collect();

        let inv_sub = bus
            .subscribe()
            .await
            .map_err(|e| ClusterError::Inventory(e.to_string()))?;
        let (inventory, inventory_handle) = InventoryService::spawn(
            client.clone(),
            inv_sub,
            config.clone(),
            seeds,
            shutdown.clone(),
        );
        let (hostnames, hostname_handle) =
            HostnameService::spawn(config.blocked_hostnames.clone(), shutdown.clone());

        let sub = bus
            .subscribe()
            .await
            .map_err(|e| ClusterError::Inventory(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let mut task = Task {
            client,
            session,
            bus,
            config,
            sub,
            cmd_rx,
            shutdown,
            inventory: inventory.clone(),
            hostnames: hostnames.clone(),
            inventory_handle,
            hostname_handle,
            managers: HashMap::new(),
        };
        for deployment in recovered {
            task.start_manager(deployment.lease_id, deployment.group);
        }
        let handle = tokio::spawn(task.run());

        Ok((
            Self {
                cmd_tx,
                inventory,
                hostnames,
            },
            handle,
        ))
    }

    /// Inventory admission surface, used by the bid engine.
    pub fn inventory(&self) -> &InventoryService {
        &self.inventory
    }

    /// Hostname claim surface.
    pub fn hostnames(&self) -> &HostnameService {
        &self.hostnames
    }

    pub async fn status(&self) -> Result<ClusterServiceStatus, ClusterError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| ClusterError::NotRunning)?;
        rx.await.map_err(|_| ClusterError::NotRunning)
    }
}

/// Inventory demand equivalent of a manifest group, used to seed
/// reservations for adopted deployments.
fn reservation_spec(group: &ManifestGroup) -> GroupSpec {
    GroupSpec {
        name: group.name.clone(),
        requirements: Default::default(),
        resources: group
            .services
            .iter()
            .map(|s| Resource {
                resources: s.resources.clone(),
                count: s.count,
                price: 0,
            })
            .collect(),
    }
}

struct Task {
    client: Arc<dyn ClusterClient>,
    session: Session,
    bus: Bus,
    config: ClusterConfig,
    sub: Subscriber,
    cmd_rx: mpsc::Receiver<Cmd>,
    shutdown: watch::Receiver<bool>,
    inventory: InventoryService,
    hostnames: HostnameService,
    inventory_handle: JoinHandle<()>,
    hostname_handle: JoinHandle<()>,
    managers: HashMap<LeaseId, DeploymentManager>,
}

impl Task {
    async fn run(mut self) {
        info!("cluster service starting");
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Cmd::Status { reply } => {
                            let _ = reply.send(self.status().await);
                        }
                    }
                }

                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    self.handle_event(ev).await;
                }

                _ = sweep.tick() => {
                    self.managers.retain(|lease_id, m| {
                        if m.is_finished() {
                            debug!(%lease_id, "reaping finished deployment manager");
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }

        // Hierarchical drain: managers first, then the capacity tasks.
        for (_, manager) in self.managers.drain() {
            manager.join().await;
        }
        let _ = self.inventory_handle.await;
        let _ = self.hostname_handle.await;
        info!("cluster service stopped");
    }

    async fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::ManifestReceived { lease_id, group } => {
                match self.managers.get(&lease_id) {
                    Some(manager) if !manager.is_finished() => {
                        debug!(%lease_id, "manifest update for running deployment");
                        if let Err(err) = manager.update(group).await {
                            warn!(%lease_id, %err, "manager update failed");
                        }
                    }
                    _ => self.start_manager(lease_id, group),
                }
            }
            Event::LeaseClosed { lease_id } => {
                if let Some(manager) = self.managers.get(&lease_id) {
                    info!(%lease_id, "lease closed, tearing down");
                    if let Err(err) = manager.teardown().await {
                        warn!(%lease_id, %err, "manager teardown failed");
                    }
                }
                match self.inventory.unreserve(lease_id.order_id()).await {
                    Ok(_) => {}
                    Err(crate::inventory::InventoryError::NotFound) => {}
                    Err(err) => warn!(%lease_id, %err, "unreserve failed"),
                }
            }
            _ => {}
        }
    }

    fn start_manager(&mut self, lease_id: LeaseId, group: ManifestGroup) {
        info!(%lease_id, group = %group.name, "starting deployment manager");
        let manager = DeploymentManager::spawn(
            lease_id.clone(),
            group,
            self.client.clone(),
            self.hostnames.clone(),
            self.session.clone(),
            self.bus.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        );
        if let Some(old) = self.managers.insert(lease_id.clone(), manager) {
            if !old.is_finished() {
                error!(%lease_id, "replaced a live deployment manager");
            }
        }
    }

    async fn status(&self) -> ClusterServiceStatus {
        let (active, pending) = match self.inventory.status().await {
            Ok(status) => (status.active.len(), status.pending.len()),
            Err(_) => (0, 0),
        };
        ClusterServiceStatus {
            deployments: self
                .managers
                .values()
                .filter(|m| !m.is_finished())
                .count(),
            active_reservations: active,
            pending_reservations: pending,
        }
    }
}
