//! Chain event listener.
//!
//! Polls the query client and diffs successive snapshots into bus
//! events: orders appearing and disappearing, leases being created for
//! tracked orders (for any provider, so the bid engine can observe
//! losses), and this provider's leases closing.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use provd_chain::{LeaseState, Session};
use provd_pubsub::Bus;
use provd_types::{Event, LeaseId, OrderId};

pub struct ChainListener {
    session: Session,
    bus: Bus,
    poll_period: Duration,
    shutdown: watch::Receiver<bool>,
    open_orders: HashSet<OrderId>,
    /// Leases already announced, so a poll never re-publishes one.
    seen_leases: HashSet<LeaseId>,
    /// This provider's active leases, for close detection.
    own_leases: HashMap<LeaseId, ()>,
}

impl ChainListener {
    pub fn spawn(
        session: Session,
        bus: Bus,
        poll_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let listener = Self {
            session,
            bus,
            poll_period,
            shutdown,
            open_orders: HashSet::new(),
            seen_leases: HashSet::new(),
            own_leases: HashMap::new(),
        };
        tokio::spawn(listener.run())
    }

    async fn run(mut self) {
        info!(period = ?self.poll_period, "chain listener starting");
        let mut ticker = tokio::time::interval(self.poll_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll().await {
                        warn!(%err, "chain poll failed");
                    }
                }
            }
        }
        info!("chain listener stopped");
    }

    async fn poll(&mut self) -> Result<(), provd_chain::ChainError> {
        let query = self.session.query().clone();

        // Orders.
        let open: HashSet<OrderId> = query
            .open_orders()
            .await?
            .into_iter()
            .map(|o| o.id)
            .collect();
        for order_id in open.difference(&self.open_orders) {
            debug!(%order_id, "order detected");
            let _ = self.bus.publish(Event::OrderCreated {
                order_id: order_id.clone(),
            });
        }

        // This provider's leases, fetched once per tick: they answer
        // close detection below and settle most vanished orders
        // without a per-order chain query.
        let own = query
            .provider_leases(self.session.provider_address())
            .await?;
        let active: HashMap<LeaseId, u64> = own
            .iter()
            .filter(|l| l.state == LeaseState::Active)
            .map(|l| (l.id.clone(), l.price))
            .collect();

        // A vanished order was either matched (a lease exists for it)
        // or closed outright. An order we won ourselves is settled
        // from the lease set already in hand; only a foreign winner
        // needs a lookup.
        let gone: Vec<OrderId> = self.open_orders.difference(&open).cloned().collect();
        for order_id in gone {
            self.open_orders.remove(&order_id);
            let own_win = active
                .iter()
                .find(|(lease_id, _)| lease_id.order == order_id);
            let matched = if let Some((lease_id, price)) = own_win {
                self.announce_lease(lease_id.clone(), *price);
                true
            } else {
                let mut matched = false;
                for lease in query.deployment_leases(&order_id.deployment_id()).await? {
                    if lease.id.order == order_id {
                        matched = true;
                        self.announce_lease(lease.id, lease.price);
                    }
                }
                matched
            };
            if !matched {
                debug!(%order_id, "order closed");
                let _ = self.bus.publish(Event::OrderClosed { order_id });
            }
        }

        // Lease creation for orders still open.
        for order_id in &open {
            for lease in query.deployment_leases(&order_id.deployment_id()).await? {
                if lease.id.order == *order_id {
                    self.announce_lease(lease.id, lease.price);
                }
            }
        }
        self.open_orders = open;

        // Closure of this provider's leases.
        for lease_id in self.own_leases.keys() {
            if !active.contains_key(lease_id) {
                info!(%lease_id, "lease closed");
                let _ = self.bus.publish(Event::LeaseClosed {
                    lease_id: lease_id.clone(),
                });
            }
        }
        self.own_leases = active.keys().map(|id| (id.clone(), ())).collect();
        Ok(())
    }

    fn announce_lease(&mut self, lease_id: LeaseId, price: u64) {
        if self.seen_leases.insert(lease_id.clone()) {
            debug!(%lease_id, "lease created");
            let _ = self.bus.publish(Event::LeaseCreated { lease_id, price });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use provd_chain::mock::MockChain;
    use provd_chain::{LeaseInfo, ProviderInfo};
    use provd_types::OrderId;

    use super::*;

    fn order_id() -> OrderId {
        OrderId {
            owner: "tenant".to_string(),
            dseq: 2,
            gseq: 1,
            oseq: 1,
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

    async fn expect_event(sub: &mut provd_pubsub::Subscriber) -> Event {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn new_order_is_published_once() {
        let chain = Arc::new(MockChain::new());
        chain.add_open_order(order_id());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ChainListener::spawn(
            session(chain),
            bus.clone(),
            Duration::from_millis(20),
            stop_rx,
        );

        assert_eq!(
            expect_event(&mut sub).await,
            Event::OrderCreated {
                order_id: order_id()
            }
        );

        // Several more polls pass without a duplicate.
        tokio::time::sleep(Duration::from_millis(200)).await;
        bus.publish(Event::OrderClosed {
            order_id: order_id(),
        })
        .unwrap();
        assert_eq!(
            expect_event(&mut sub).await,
            Event::OrderClosed {
                order_id: order_id()
            }
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn lease_creation_is_published_for_any_provider() {
        let chain = Arc::new(MockChain::new());
        chain.add_open_order(order_id());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ChainListener::spawn(
            session(chain.clone()),
            bus.clone(),
            Duration::from_millis(20),
            stop_rx,
        );

        assert!(matches!(
            expect_event(&mut sub).await,
            Event::OrderCreated { .. }
        ));

        let lease_id = LeaseId {
            order: order_id(),
            provider: "someone-else".to_string(),
        };
        chain.add_lease(LeaseInfo {
            id: lease_id.clone(),
            price: 77,
            state: LeaseState::Active,
        });

        assert_eq!(
            expect_event(&mut sub).await,
            Event::LeaseCreated {
                lease_id,
                price: 77
            }
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn won_order_vanishing_is_a_lease_not_a_close() {
        let chain = Arc::new(MockChain::new());
        chain.add_open_order(order_id());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ChainListener::spawn(
            session(chain.clone()),
            bus.clone(),
            Duration::from_millis(20),
            stop_rx,
        );

        assert!(matches!(
            expect_event(&mut sub).await,
            Event::OrderCreated { .. }
        ));

        // Our own lease settles the vanished order from the provider
        // lease set; no close is published.
        let lease_id = LeaseId {
            order: order_id(),
            provider: "provider".to_string(),
        };
        chain.add_lease(LeaseInfo {
            id: lease_id.clone(),
            price: 55,
            state: LeaseState::Active,
        });
        chain.remove_open_order(&order_id());

        assert_eq!(
            expect_event(&mut sub).await,
            Event::LeaseCreated {
                lease_id,
                price: 55
            }
        );
        assert!(
            tokio::time::timeout(Duration::from_millis(200), sub.recv())
                .await
                .is_err()
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn vanished_order_without_lease_is_closed() {
        let chain = Arc::new(MockChain::new());
        chain.add_open_order(order_id());
        let bus = Bus::new();
        let mut sub = bus.subscribe().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = ChainListener::spawn(
            session(chain.clone()),
            bus.clone(),
            Duration::from_millis(20),
            stop_rx,
        );

        assert!(matches!(
            expect_event(&mut sub).await,
            Event::OrderCreated { .. }
        ));

        chain.remove_open_order(&order_id());
        assert_eq!(
            expect_event(&mut sub).await,
            Event::OrderClosed {
                order_id: order_id()
            }
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
