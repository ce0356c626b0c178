//! Bid engine service: one order task per open order.
//!
//! Subscribes to order-created events and spawns an [`OrderTask`] for
//! each. At startup, open orders still on chain are re-adopted as
//! catchup orders so a restart neither misses nor double-bids them.
//! Order tasks get their subscriber by cloning the service's own, so
//! events published between the service reading order-created and the
//! task starting are replayed, never lost.
//!
//! [`OrderTask`]: crate::order::OrderTask

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use provd_chain::Session;
use provd_cluster::InventoryService;
use provd_pubsub::{Bus, Subscriber};
use provd_types::{Event, OrderId};

use crate::order::{BidError, OrderTask};
use crate::pricing::BidPricingStrategy;

const SWEEP_PERIOD: Duration = Duration::from_secs(10);

/// Counters for the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BidEngineStatus {
    pub orders: usize,
}

enum Cmd {
    Status {
        reply: oneshot::Sender<BidEngineStatus>,
    },
}

/// Handle to the bid engine task. Cheap to clone.
#[derive(Clone)]
pub struct BidEngineService {
    cmd_tx: mpsc::Sender<Cmd>,
}

impl BidEngineService {
    /// Spawn the service. Queries open orders for catchup before the
    /// event loop starts.
    pub async fn spawn(
        session: Session,
        inventory: InventoryService,
        pricing: Arc<dyn BidPricingStrategy>,
        bus: Bus,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, JoinHandle<()>), BidError> {
        let existing = session.query().open_orders().await?;
        let sub = bus.subscribe().await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let mut task = Task {
            session,
            inventory,
            pricing,
            bus,
            sub,
            cmd_rx,
            shutdown,
            orders: HashMap::new(),
        };
        for order in &existing {
            task.start_order(order.id.clone(), true).await;
        }
        info!(catchup = existing.len(), "bid engine starting");
        let handle = tokio::spawn(task.run());
        Ok((Self { cmd_tx }, handle))
    }

    pub async fn status(&self) -> Result<BidEngineStatus, BidError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Status { reply })
            .await
            .map_err(|_| BidError::NotRunning)?;
        rx.await.map_err(|_| BidError::NotRunning)
    }
}

struct Task {
    session: Session,
    inventory: InventoryService,
    pricing: Arc<dyn BidPricingStrategy>,
    bus: Bus,
    sub: Subscriber,
    cmd_rx: mpsc::Receiver<Cmd>,
    shutdown: watch::Receiver<bool>,
    orders: HashMap<OrderId, JoinHandle<()>>,
}

impl Task {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_PERIOD);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Cmd::Status { reply } => {
                            let live = self.orders.values().filter(|h| !h.is_finished()).count();
                            let _ = reply.send(BidEngineStatus { orders: live });
                        }
                    }
                }

                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    if let Event::OrderCreated { order_id } = ev {
                        match self.orders.get(&order_id) {
                            Some(handle) if !handle.is_finished() => {
                                debug!(%order_id, "order already tracked");
                            }
                            _ => self.start_order(order_id, false).await,
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.orders.retain(|_, h| !h.is_finished());
                }
            }
        }

        // Drain: every order task observes the same shutdown signal
        // and releases its reservation before exiting.
        for (order_id, handle) in self.orders.drain() {
            if let Err(err) = handle.await {
                error!(%order_id, %err, "order task failed");
            }
        }
        info!("bid engine stopped");
    }

    async fn start_order(&mut self, order_id: OrderId, catchup: bool) {
        let sub = match self.sub.clone_subscriber().await {
            Ok(sub) => sub,
            Err(err) => {
                warn!(%order_id, %err, "subscriber clone failed");
                return;
            }
        };
        info!(%order_id, catchup, "tracking order");
        let handle = OrderTask::spawn(
            order_id.clone(),
            self.session.clone(),
            self.inventory.clone(),
            self.pricing.clone(),
            self.bus.clone(),
            sub,
            catchup,
            self.shutdown.clone(),
        );
        self.orders.insert(order_id, handle);
    }
}
