//! Per-order bidding state machine.
//!
//! One task per open order. The pipeline is: fetch the group spec,
//! check feasibility, reserve inventory, price, broadcast a bid, then
//! listen for the order's outcome. Each pipeline step runs detached so
//! the task keeps observing bus events and shutdown while a chain call
//! or pricing script is in flight. A reservation never outlives the
//! task: every exit path either converts it into a won lease or
//! releases it.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use provd_chain::{ChainError, QueryClient, Session};
use provd_cluster::{InventoryError, InventoryService};
use provd_pubsub::{Bus, PubsubError, Subscriber};
use provd_types::{match_attributes, Event, GroupSpec, LeaseId, OrderId, SignedBy};

use crate::pricing::{BidPricingStrategy, PricingError};

#[derive(Debug, Error)]
pub enum BidError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Pricing(#[from] PricingError),

    #[error(transparent)]
    Pubsub(#[from] PubsubError),

    #[error("not running")]
    NotRunning,
}

/// Why an order was declined without a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    InvalidGroup,
    AttributeMismatch,
    UnauditedAttributes,
}

enum Step {
    Fetched(GroupSpec),
    Rejected(Rejection),
    Reserved,
    ExistingBid(bool),
    Priced(u64),
    BidPlaced,
}

pub(crate) struct OrderTask {
    order_id: OrderId,
    session: Session,
    inventory: InventoryService,
    pricing: Arc<dyn BidPricingStrategy>,
    bus: Bus,
    sub: Subscriber,
    /// Recovered after a restart: check for a pre-existing bid before
    /// pricing.
    catchup: bool,
    shutdown: watch::Receiver<bool>,
}

impl OrderTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        order_id: OrderId,
        session: Session,
        inventory: InventoryService,
        pricing: Arc<dyn BidPricingStrategy>,
        bus: Bus,
        sub: Subscriber,
        catchup: bool,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let task = Self {
            order_id,
            session,
            inventory,
            pricing,
            bus,
            sub,
            catchup,
            shutdown,
        };
        tokio::spawn(task.run())
    }

    async fn run(mut self) {
        debug!(order_id = %self.order_id, catchup = self.catchup, "order task starting");

        let mut group: Option<GroupSpec> = None;
        let mut reserved = false;
        let mut listening = false;
        let mut won: Option<(LeaseId, u64)> = None;
        let mut step: Option<JoinHandle<Result<Step, BidError>>> = Some(self.spawn_fetch());

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    // Wait for in-flight work so the reservation is
                    // not released while a step still references it.
                    if let Some(step) = step.take() {
                        let _ = step.await;
                    }
                    break;
                }

                ev = self.sub.recv() => {
                    let Some(ev) = ev else {
                        if let Some(step) = step.take() {
                            let _ = step.await;
                        }
                        break;
                    };
                    match ev {
                        Event::LeaseCreated { lease_id, price }
                            if lease_id.order == self.order_id =>
                        {
                            if lease_id.provider == self.session.provider_address() {
                                won = Some((lease_id, price));
                                if listening {
                                    self.finish_won(&mut won, &group, &mut reserved);
                                    break;
                                }
                            } else {
                                info!(order_id = %self.order_id, winner = %lease_id.provider, "lost order");
                                if let Some(step) = step.take() {
                                    let _ = step.await;
                                }
                                break;
                            }
                        }
                        Event::OrderClosed { order_id } if order_id == self.order_id => {
                            info!(order_id = %self.order_id, "order closed");
                            if let Some(step) = step.take() {
                                let _ = step.await;
                            }
                            break;
                        }
                        _ => {}
                    }
                }

                res = async { step.as_mut().expect("step in flight").await }, if step.is_some() => {
                    step = None;
                    let outcome = match res {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            error!(order_id = %self.order_id, %err, "order step panicked");
                            break;
                        }
                    };
                    match outcome {
                        Ok(Step::Fetched(spec)) => {
                            if let Some(rejection) = self.feasibility(&spec).await {
                                info!(order_id = %self.order_id, ?rejection, "order rejected");
                                break;
                            }
                            group = Some(spec.clone());
                            step = Some(self.spawn_reserve(spec));
                        }
                        Ok(Step::Rejected(rejection)) => {
                            info!(order_id = %self.order_id, ?rejection, "order rejected");
                            break;
                        }
                        Ok(Step::Reserved) => {
                            reserved = true;
                            let Some(spec) = group.clone() else { break };
                            if self.catchup {
                                step = Some(self.spawn_bid_check());
                            } else {
                                step = Some(self.spawn_price(spec));
                            }
                        }
                        Ok(Step::ExistingBid(true)) => {
                            debug!(order_id = %self.order_id, "existing bid found, listening");
                            listening = true;
                            if won.is_some() {
                                self.finish_won(&mut won, &group, &mut reserved);
                                break;
                            }
                        }
                        Ok(Step::ExistingBid(false)) => {
                            let Some(spec) = group.clone() else { break };
                            step = Some(self.spawn_price(spec));
                        }
                        Ok(Step::Priced(price)) => {
                            info!(order_id = %self.order_id, price, "bidding");
                            step = Some(self.spawn_broadcast(price));
                        }
                        Ok(Step::BidPlaced) => {
                            listening = true;
                            if won.is_some() {
                                self.finish_won(&mut won, &group, &mut reserved);
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(order_id = %self.order_id, %err, "order aborted");
                            break;
                        }
                    }
                }
            }
        }

        if reserved {
            match self.inventory.unreserve(self.order_id.clone()).await {
                Ok(_) | Err(InventoryError::NotFound) => {}
                Err(err) => warn!(order_id = %self.order_id, %err, "unreserve failed"),
            }
        }
        debug!(order_id = %self.order_id, "order task stopped");
    }

    /// Publish the lease-won event and hand the reservation over to
    /// the cluster layer.
    fn finish_won(
        &self,
        won: &mut Option<(LeaseId, u64)>,
        group: &Option<GroupSpec>,
        reserved: &mut bool,
    ) {
        let Some((lease_id, price)) = won.take() else {
            return;
        };
        let Some(group) = group.clone() else {
            return;
        };
        info!(%lease_id, price, "lease won");
        // The reservation converts into the live deployment.
        *reserved = false;
        if let Err(err) = self.bus.publish(Event::LeaseWon {
            lease_id,
            group,
            price,
        }) {
            warn!(order_id = %self.order_id, %err, "lease-won publish failed");
        }
    }

    fn spawn_fetch(&self) -> JoinHandle<Result<Step, BidError>> {
        let query = self.session.query().clone();
        let group_id = self.order_id.group_id();
        tokio::spawn(async move {
            let spec = query.group(&group_id).await?;
            if !spec.validate() {
                return Ok(Step::Rejected(Rejection::InvalidGroup));
            }
            Ok(Step::Fetched(spec))
        })
    }

    /// Placement feasibility: the provider's own attributes must match,
    /// and any signed-by constraints must be backed by auditor records.
    async fn feasibility(&self, spec: &GroupSpec) -> Option<Rejection> {
        let required = &spec.requirements.attributes;
        if !match_attributes(&self.session.provider().attributes, required) {
            return Some(Rejection::AttributeMismatch);
        }
        let signed_by = &spec.requirements.signed_by;
        if signed_by.is_empty() {
            return None;
        }
        match check_signed_by(
            self.session.query(),
            signed_by,
            self.session.provider_address(),
            required,
        )
        .await
        {
            Ok(true) => None,
            Ok(false) => Some(Rejection::UnauditedAttributes),
            Err(err) => {
                warn!(order_id = %self.order_id, %err, "audit lookup failed");
                Some(Rejection::UnauditedAttributes)
            }
        }
    }

    fn spawn_reserve(&self, spec: GroupSpec) -> JoinHandle<Result<Step, BidError>> {
        let inventory = self.inventory.clone();
        let order_id = self.order_id.clone();
        tokio::spawn(async move {
            inventory.reserve(order_id, spec).await?;
            Ok(Step::Reserved)
        })
    }

    fn spawn_bid_check(&self) -> JoinHandle<Result<Step, BidError>> {
        let query = self.session.query().clone();
        let bid_id = self.order_id.bid_id(self.session.provider_address());
        tokio::spawn(async move {
            let existing = query.bid(&bid_id).await?;
            Ok(Step::ExistingBid(existing.is_some()))
        })
    }

    fn spawn_price(&self, group: GroupSpec) -> JoinHandle<Result<Step, BidError>> {
        let pricing = self.pricing.clone();
        tokio::spawn(async move {
            let price = pricing.calculate_price(&group).await?;
            Ok(Step::Priced(price))
        })
    }

    fn spawn_broadcast(&self, price: u64) -> JoinHandle<Result<Step, BidError>> {
        let tx = self.session.tx().clone();
        let bid_id = self.order_id.bid_id(self.session.provider_address());
        tokio::spawn(async move {
            tx.create_bid(&bid_id, price).await?;
            Ok(Step::BidPlaced)
        })
    }
}

/// Auditor-backed attribute check: every `all_of` auditor must have
/// signed attributes for this provider satisfying the requirements, and
/// when `any_of` is non-empty at least one of those must as well.
async fn check_signed_by(
    query: &Arc<dyn QueryClient>,
    signed_by: &SignedBy,
    provider: &str,
    required: &[provd_types::Attribute],
) -> Result<bool, ChainError> {
    for auditor in &signed_by.all_of {
        match query.auditor_attributes(auditor, provider).await? {
            Some(attrs) if match_attributes(&attrs, required) => {}
            _ => return Ok(false),
        }
    }
    if signed_by.any_of.is_empty() {
        return Ok(true);
    }
    for auditor in &signed_by.any_of {
        if let Some(attrs) = query.auditor_attributes(auditor, provider).await? {
            if match_attributes(&attrs, required) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use provd_chain::mock::MockChain;
    use provd_types::Attribute;

    #[tokio::test]
    async fn signed_by_all_of_requires_every_auditor() {
        let chain = Arc::new(MockChain::new());
        let required = vec![Attribute::new("region", "eu-west")];
        chain.set_auditor_attributes("auditor-a", "provider", required.clone());

        let query: Arc<dyn QueryClient> = chain.clone();
        let signed_by = SignedBy {
            all_of: vec!["auditor-a".to_string(), "auditor-b".to_string()],
            any_of: Vec::new(),
        };
        assert!(!check_signed_by(&query, &signed_by, "provider", &required)
            .await
            .unwrap());

        chain.set_auditor_attributes("auditor-b", "provider", required.clone());
        assert!(check_signed_by(&query, &signed_by, "provider", &required)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn signed_by_any_of_needs_one_match() {
        let chain = Arc::new(MockChain::new());
        let required = vec![Attribute::new("tier", "datacenter")];
        chain.set_auditor_attributes("auditor-b", "provider", required.clone());

        let query: Arc<dyn QueryClient> = chain.clone();
        let signed_by = SignedBy {
            all_of: Vec::new(),
            any_of: vec!["auditor-a".to_string(), "auditor-b".to_string()],
        };
        assert!(check_signed_by(&query, &signed_by, "provider", &required)
            .await
            .unwrap());
    }
}
