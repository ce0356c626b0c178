//! Inventory and reservation tracking.
//!
//! A single task owns the reservation set and a periodically-refreshed
//! snapshot of node capacity. Admission is pessimistic: every
//! *unallocated* reservation's demand is subtracted from the snapshot
//! before a candidate is fitted, while allocated reservations are
//! trusted to already be reflected in the polled numbers. Capacity
//! checks never wait for a poll; they run against the last good
//! snapshot.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use provd_pubsub::Subscriber;
use provd_types::{DeploymentStatus, Event, GroupSpec, OrderId, Resource, ResourceUnits};

use crate::client::{ClusterClient, ClusterError, Node};
use crate::config::ClusterConfig;

/// Inventory service errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// Normal business rejection, not a fault.
    #[error("insufficient capacity")]
    InsufficientCapacity,

    #[error("reservation not found")]
    NotFound,

    #[error("inventory status not available yet")]
    NotAvailable,

    #[error("not running")]
    NotRunning,
}

/// A provider-local hold against cluster capacity for an order.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub order: OrderId,
    pub resources: GroupSpec,
    pub allocated: bool,
}

/// Snapshot of reservations and remaining capacity.
#[derive(Debug, Clone)]
pub struct InventoryStatus {
    pub active: Vec<GroupSpec>,
    pub pending: Vec<GroupSpec>,
    pub available: Vec<Node>,
}

struct ReserveReq {
    order: OrderId,
    resources: GroupSpec,
    reply: oneshot::Sender<Result<Reservation, InventoryError>>,
}

enum Cmd {
    Reserve(ReserveReq),
    Lookup {
        order: OrderId,
        group_name: String,
        reply: oneshot::Sender<Result<Reservation, InventoryError>>,
    },
    Unreserve {
        order: OrderId,
        reply: oneshot::Sender<Result<Reservation, InventoryError>>,
    },
    Status {
        reply: oneshot::Sender<Result<InventoryStatus, InventoryError>>,
    },
}

/// Handle to the inventory task. Cheap to clone.
#[derive(Clone)]
pub struct InventoryService {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl InventoryService {
    /// Spawn the inventory task. `seeds` are reservations recovered
    /// from deployments already running on the backend; they start
    /// allocated.
    pub fn spawn(
        client: Arc<dyn ClusterClient>,
        sub: Subscriber,
        config: ClusterConfig,
        seeds: Vec<(OrderId, GroupSpec)>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let reservations = seeds
            .into_iter()
            .map(|(order, resources)| Reservation {
                order,
                resources,
                allocated: true,
            })
            .collect();
        let task = Task {
            client,
            sub,
            config,
            cmd_rx,
            shutdown,
            snapshot: None,
            available: Vec::new(),
            reservations,
            paused: Vec::new(),
            fetch_count: 0,
        };
        let handle = tokio::spawn(task.run());
        (Self { cmd_tx }, handle)
    }

    pub async fn reserve(
        &self,
        order: OrderId,
        resources: GroupSpec,
    ) -> Result<Reservation, InventoryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Reserve(ReserveReq {
                order,
                resources,
                reply,
            }))
            .await
            .map_err(|_| InventoryError::NotRunning)?;
        rx.await.map_err(|_| InventoryError::NotRunning)?
    }

    pub async fn lookup(
        &self,
        order: OrderId,
        resources: &GroupSpec,
    ) -> Result<Reservation, InventoryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Lookup {
                order,
                group_name: resources.name.clone(),
                reply,
            })
            .await
            .map_err(|_| InventoryError::NotRunning)?;
        rx.await.map_err(|_| InventoryError::NotRunning)?
    }

    pub async fn unreserve(&self, order: OrderId) -> Result<Reservation, InventoryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Unreserve { order, reply })
            .await
            .map_err(|_| InventoryError::NotRunning)?;
        rx.await.map_err(|_| InventoryError::NotRunning)?
    }

    pub async fn status(&self) -> Result<InventoryStatus, InventoryError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| InventoryError::NotRunning)?;
        rx.await.map_err(|_| InventoryError::NotRunning)?
    }
}

struct Task {
    client: Arc<dyn ClusterClient>,
    sub: Subscriber,
    config: ClusterConfig,
    cmd_rx: mpsc::Receiver<Cmd>,
    shutdown: watch::Receiver<bool>,
    /// Last good poll of node capacity.
    snapshot: Option<Vec<Node>>,
    /// Snapshot minus every unallocated reservation's demand.
    available: Vec<Node>,
    reservations: Vec<Reservation>,
    /// Reserve requests held while a forced refresh is in flight.
    paused: Vec<ReserveReq>,
    fetch_count: u32,
}

impl Task {
    async fn run(mut self) {
        info!(
            existing = self.reservations.len(),
            "inventory service starting"
        );

        let mut poll: Option<JoinHandle<Result<Vec<Node>, ClusterError>>> =
            Some(self.spawn_poll());
        let mut poll_at = Instant::now() + self.config.inventory_poll_period;
        // While true, reserve requests wait for the next snapshot.
        let mut refreshing = true;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Cmd::Reserve(req) if refreshing => self.paused.push(req),
                        Cmd::Reserve(req) => self.handle_reserve(req),
                        Cmd::Lookup { order, group_name, reply } => {
                            let _ = reply.send(self.find(&order, &group_name));
                        }
                        Cmd::Unreserve { order, reply } => {
                            let _ = reply.send(self.handle_unreserve(&order));
                        }
                        Cmd::Status { reply } => {
                            let _ = reply.send(self.handle_status());
                        }
                    }
                }

                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    if self.apply_event(ev) && poll.is_none() {
                        // An allocation flipped; refresh before
                        // admitting more work so the flip is not
                        // double counted.
                        refreshing = true;
                        poll = Some(self.spawn_poll());
                    }
                }

                _ = tokio::time::sleep_until(poll_at), if poll.is_none() => {
                    poll = Some(self.spawn_poll());
                }

                res = async { poll.as_mut().expect("poll in flight").await }, if poll.is_some() => {
                    poll = None;
                    poll_at = Instant::now() + self.config.inventory_poll_period;
                    match res {
                        Ok(Ok(nodes)) => {
                            self.apply_snapshot(nodes);
                            refreshing = false;
                            for req in std::mem::take(&mut self.paused) {
                                self.handle_reserve(req);
                            }
                        }
                        Ok(Err(err)) => error!(%err, "inventory poll failed"),
                        Err(err) => error!(%err, "inventory poll task panicked"),
                    }
                }
            }
        }

        if let Some(poll) = poll {
            let _ = poll.await;
        }
        debug!("inventory service stopped");
    }

    fn spawn_poll(&self) -> JoinHandle<Result<Vec<Node>, ClusterError>> {
        let client = self.client.clone();
        tokio::spawn(async move { client.inventory().await })
    }

    fn apply_snapshot(&mut self, nodes: Vec<Node>) {
        if self.fetch_count % self.config.inventory_debug_frequency == 0 {
            match serde_json::to_string(&nodes) {
                Ok(dump) => debug!(%dump, "cluster resources"),
                Err(err) => error!(%err, "unable to dump cluster inventory"),
            }
        }
        self.fetch_count = self.fetch_count.wrapping_add(1);
        self.snapshot = Some(nodes);
        self.recompute_available();
    }

    /// Rebuild the admission view: snapshot minus unallocated demand.
    fn recompute_available(&mut self) {
        let Some(snapshot) = &self.snapshot else {
            return;
        };
        let mut nodes = snapshot.clone();
        for res in self.reservations.iter().filter(|r| !r.allocated) {
            if !place(&mut nodes, &res.resources) {
                warn!(order = %res.order, "pending reservation no longer fits inventory");
            }
        }
        self.available = nodes;
    }

    fn handle_reserve(&mut self, req: ReserveReq) {
        debug!(order = %req.order, "reservation requested");

        if self.snapshot.is_none() {
            let _ = req.reply.send(Err(InventoryError::NotAvailable));
            return;
        }

        let committed = self.committed(&req.resources);

        // Endpoints are a separate, flat capacity domain.
        let reserved_endpoints: u32 = self
            .reservations
            .iter()
            .map(|r| r.resources.endpoint_total())
            .sum();
        if reserved_endpoints + committed.endpoint_total() > self.config.external_port_quantity {
            info!(order = %req.order, "insufficient external ports for reservation");
            let _ = req.reply.send(Err(InventoryError::InsufficientCapacity));
            return;
        }

        let mut candidate_view = self.available.clone();
        if !place(&mut candidate_view, &committed) {
            info!(order = %req.order, "insufficient capacity for reservation");
            let _ = req.reply.send(Err(InventoryError::InsufficientCapacity));
            return;
        }

        self.available = candidate_view;
        let reservation = Reservation {
            order: req.order,
            resources: committed,
            allocated: false,
        };
        self.reservations.push(reservation.clone());
        info!(order = %reservation.order, "reservation created");
        let _ = req.reply.send(Ok(reservation));
    }

    fn handle_unreserve(&mut self, order: &OrderId) -> Result<Reservation, InventoryError> {
        let idx = self
            .reservations
            .iter()
            .position(|r| r.order == *order)
            .ok_or(InventoryError::NotFound)?;
        let removed = self.reservations.remove(idx);
        info!(order = %order, "reservation removed");
        self.recompute_available();
        Ok(removed)
    }

    fn find(&self, order: &OrderId, group_name: &str) -> Result<Reservation, InventoryError> {
        self.reservations
            .iter()
            .find(|r| r.order == *order && r.resources.name == group_name)
            .cloned()
            .ok_or(InventoryError::NotFound)
    }

    fn handle_status(&self) -> Result<InventoryStatus, InventoryError> {
        if self.snapshot.is_none() {
            return Err(InventoryError::NotAvailable);
        }
        let (active, pending): (Vec<_>, Vec<_>) =
            self.reservations.iter().partition(|r| r.allocated);
        Ok(InventoryStatus {
            active: active.into_iter().map(|r| r.resources.clone()).collect(),
            pending: pending.into_iter().map(|r| r.resources.clone()).collect(),
            available: self.available.clone(),
        })
    }

    /// Returns true when an allocation flag flipped.
    fn apply_event(&mut self, ev: Event) -> bool {
        let Event::ClusterDeployment {
            lease_id,
            group_name,
            status,
        } = ev
        else {
            return false;
        };
        let order = lease_id.order_id();
        for res in &mut self.reservations {
            if res.order == order && res.resources.name == group_name {
                let allocated = status == DeploymentStatus::Deployed;
                let flipped = res.allocated != allocated;
                res.allocated = allocated;
                debug!(order = %res.order, allocated, "reservation status update");
                return flipped;
            }
        }
        false
    }

    /// Scale requested units by the configured commit levels.
    fn committed(&self, group: &GroupSpec) -> GroupSpec {
        let scale = |level: f64, v: u64| -> u64 {
            if level <= 1.0 {
                v
            } else {
                (v as f64 / level) as u64
            }
        };
        GroupSpec {
            name: group.name.clone(),
            requirements: Default::default(),
            resources: group
                .resources
                .iter()
                .map(|r| Resource {
                    resources: ResourceUnits {
                        cpu_millis: scale(self.config.cpu_commit_level, r.resources.cpu_millis),
                        memory_bytes: scale(
                            self.config.memory_commit_level,
                            r.resources.memory_bytes,
                        ),
                        storage_bytes: scale(
                            self.config.storage_commit_level,
                            r.resources.storage_bytes,
                        ),
                        endpoints: r.resources.endpoints,
                    },
                    count: r.count,
                    price: r.price,
                })
                .collect(),
        }
    }
}

/// First-fit placement of a group across nodes, decrementing node
/// capacity as units are placed. Fails if any unit cannot be placed.
fn place(nodes: &mut [Node], group: &GroupSpec) -> bool {
    for resource in &group.resources {
        for _ in 0..resource.count {
            let slot = nodes.iter_mut().find(|n| fits(&n.available, &resource.resources));
            match slot {
                Some(node) => consume(&mut node.available, &resource.resources),
                None => return false,
            }
        }
    }
    true
}

fn fits(avail: &ResourceUnits, want: &ResourceUnits) -> bool {
    avail.cpu_millis >= want.cpu_millis
        && avail.memory_bytes >= want.memory_bytes
        && avail.storage_bytes >= want.storage_bytes
}

fn consume(avail: &mut ResourceUnits, want: &ResourceUnits) {
    avail.cpu_millis -= want.cpu_millis;
    avail.memory_bytes -= want.memory_bytes;
    avail.storage_bytes -= want.storage_bytes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use provd_pubsub::Bus;
    use provd_types::{LeaseId, PlacementRequirements};

    fn node(name: &str, cpu: u64, mem: u64) -> Node {
        Node {
            name: name.to_string(),
            available: ResourceUnits {
                cpu_millis: cpu,
                memory_bytes: mem,
                storage_bytes: 1 << 40,
                endpoints: 0,
            },
        }
    }

    fn group(name: &str, cpu: u64, mem: u64, count: u32) -> GroupSpec {
        GroupSpec {
            name: name.to_string(),
            requirements: PlacementRequirements::default(),
            resources: vec![Resource {
                resources: ResourceUnits {
                    cpu_millis: cpu,
                    memory_bytes: mem,
                    storage_bytes: 0,
                    endpoints: 0,
                },
                count,
                price: 1,
            }],
        }
    }

    fn order(oseq: u32) -> OrderId {
        OrderId {
            owner: "owner".to_string(),
            dseq: 1,
            gseq: 1,
            oseq,
        }
    }

    async fn start(
        cluster: Arc<MockCluster>,
    ) -> (InventoryService, Bus, watch::Sender<bool>, JoinHandle<()>) {
        let bus = Bus::new();
        let sub = bus.subscribe().await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (svc, handle) = InventoryService::spawn(
            cluster,
            sub,
            ClusterConfig::default(),
            Vec::new(),
            shutdown_rx,
        );
        // Let the first poll land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        (svc, bus, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn reserve_within_capacity() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        let res = svc.reserve(order(1), group("web", 100, 1 << 20, 2)).await.unwrap();
        assert!(!res.allocated);
        assert_eq!(res.order, order(1));
    }

    #[tokio::test]
    async fn reserve_beyond_capacity_rejected() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 500, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        let err = svc
            .reserve(order(1), group("web", 200, 1 << 20, 3))
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::InsufficientCapacity);
    }

    #[tokio::test]
    async fn admission_is_pessimistic_about_pending_reservations() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        // Each fits alone; together they exceed the node.
        svc.reserve(order(1), group("a", 600, 1 << 20, 1)).await.unwrap();
        let err = svc
            .reserve(order(2), group("b", 600, 1 << 20, 1))
            .await
            .unwrap_err();
        assert_eq!(err, InventoryError::InsufficientCapacity);
    }

    #[tokio::test]
    async fn unreserve_returns_reservation_once() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        let g = group("web", 100, 1 << 20, 1);
        let created = svc.reserve(order(1), g.clone()).await.unwrap();
        let removed = svc.unreserve(order(1)).await.unwrap();
        assert_eq!(created, removed);

        assert_eq!(svc.unreserve(order(1)).await.unwrap_err(), InventoryError::NotFound);
    }

    #[tokio::test]
    async fn unreserve_frees_capacity() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 500, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        svc.reserve(order(1), group("a", 400, 1 << 20, 1)).await.unwrap();
        assert!(svc.reserve(order(2), group("b", 400, 1 << 20, 1)).await.is_err());

        svc.unreserve(order(1)).await.unwrap();
        svc.reserve(order(2), group("b", 400, 1 << 20, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn lookup_finds_reservation_by_order_and_group() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        let g = group("web", 100, 1 << 20, 1);
        svc.reserve(order(1), g.clone()).await.unwrap();

        assert!(svc.lookup(order(1), &g).await.is_ok());
        assert_eq!(
            svc.lookup(order(2), &g).await.unwrap_err(),
            InventoryError::NotFound
        );
    }

    #[tokio::test]
    async fn deployed_event_marks_reservation_allocated() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, bus, _stop, _h) = start(cluster).await;

        let g = group("web", 100, 1 << 20, 1);
        svc.reserve(order(1), g.clone()).await.unwrap();

        let lease_id = LeaseId {
            order: order(1),
            provider: "provider".to_string(),
        };
        bus.publish(Event::ClusterDeployment {
            lease_id,
            group_name: "web".to_string(),
            status: DeploymentStatus::Deployed,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let found = svc.lookup(order(1), &g).await.unwrap();
        assert!(found.allocated);
    }

    #[tokio::test]
    async fn no_over_admission_under_mixed_sequences() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, _stop, _h) = start(cluster).await;

        let unit = |oseq| (order(oseq), group("g", 300, 1 << 20, 1));

        let mut held = Vec::new();
        for oseq in 0..10 {
            let (o, g) = unit(oseq);
            if svc.reserve(o.clone(), g).await.is_ok() {
                held.push(o);
            }
        }
        // 1000 millicores / 300 per reservation: at most 3 admitted.
        assert_eq!(held.len(), 3);

        for o in &held {
            svc.unreserve(o.clone()).await.unwrap();
        }
        // Capacity fully restored.
        let (o, g) = unit(100);
        svc.reserve(o, g).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_task() {
        let cluster = Arc::new(MockCluster::new());
        cluster.set_nodes(vec![node("n1", 1000, 1 << 30)]);
        let (svc, _bus, stop, handle) = start(cluster).await;

        stop.send(true).unwrap();
        handle.await.unwrap();

        let err = svc.reserve(order(1), group("g", 1, 1, 1)).await.unwrap_err();
        assert_eq!(err, InventoryError::NotRunning);
    }
}
