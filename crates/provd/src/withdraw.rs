//! Withdrawal handler.
//!
//! Consumes lease-withdraw events and broadcasts the corresponding
//! withdraw-lease transactions, keeping transaction submission out of
//! the balance checker's timing loops.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use provd_chain::Session;
use provd_pubsub::{Bus, PubsubError, Subscriber};
use provd_types::Event;

pub struct WithdrawHandler {
    session: Session,
    sub: Subscriber,
    shutdown: watch::Receiver<bool>,
}

impl WithdrawHandler {
    pub async fn spawn(
        session: Session,
        bus: &Bus,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, PubsubError> {
        let sub = bus.subscribe().await?;
        let handler = Self {
            session,
            sub,
            shutdown,
        };
        Ok(tokio::spawn(handler.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                ev = self.sub.recv() => {
                    let Some(ev) = ev else { break };
                    if let Event::LeaseWithdraw { lease_id } = ev {
                        match self.session.tx().withdraw_lease(&lease_id).await {
                            Ok(()) => info!(%lease_id, "lease funds withdrawn"),
                            Err(err) => warn!(%lease_id, %err, "withdraw broadcast failed"),
                        }
                    }
                }
            }
        }
        info!("withdraw handler stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use provd_chain::mock::{Broadcast, MockChain};
    use provd_chain::ProviderInfo;
    use provd_types::{LeaseId, OrderId};

    use super::*;

    #[tokio::test]
    async fn withdraw_event_becomes_a_broadcast() {
        let chain = Arc::new(MockChain::new());
        let session = Session::new(
            ProviderInfo {
                address: "provider".to_string(),
                attributes: Vec::new(),
            },
            chain.clone(),
            chain.clone(),
        );
        let bus = Bus::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = WithdrawHandler::spawn(session, &bus, stop_rx).await.unwrap();

        let lease_id = LeaseId {
            order: OrderId {
                owner: "tenant".to_string(),
                dseq: 1,
                gseq: 1,
                oseq: 1,
            },
            provider: "provider".to_string(),
        };
        bus.publish(Event::LeaseWithdraw {
            lease_id: lease_id.clone(),
        })
        .unwrap();

        for _ in 0..100 {
            if !chain.broadcasts().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            chain.broadcasts(),
            vec![Broadcast::WithdrawLease(lease_id)]
        );

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
