//! In-memory chain double used by tests across the workspace.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use provd_types::{Attribute, BidId, DeploymentId, GroupId, GroupSpec, LeaseId, OrderId};

use crate::client::{
    BidInfo, BidState, ChainError, DeploymentInfo, EscrowAccount, LeaseInfo, OrderInfo,
    ProviderInfo, QueryClient, SyncInfo, TxClient,
};

/// Every message broadcast through the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Broadcast {
    CreateBid { id: BidId, price: u64 },
    CloseBid(BidId),
    WithdrawLease(LeaseId),
    CloseLease(LeaseId),
}

#[derive(Default)]
struct State {
    groups: HashMap<GroupId, GroupSpec>,
    deployments: HashMap<DeploymentId, DeploymentInfo>,
    open_orders: Vec<OrderInfo>,
    bids: HashMap<BidId, BidInfo>,
    leases: Vec<LeaseInfo>,
    providers: HashMap<String, ProviderInfo>,
    audits: HashMap<(String, String), Vec<Attribute>>,
    escrow: HashMap<DeploymentId, EscrowAccount>,
    sync: Option<SyncInfo>,
    broadcasts: Vec<Broadcast>,
    fail_broadcasts: bool,
}

/// Mock chain implementing both client traits over shared in-memory
/// state.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<State>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, id: GroupId, spec: GroupSpec) {
        self.state.lock().unwrap().groups.insert(id, spec);
    }

    pub fn set_deployment(&self, info: DeploymentInfo) {
        let mut state = self.state.lock().unwrap();
        state.deployments.insert(info.id.clone(), info);
    }

    pub fn add_open_order(&self, id: OrderId) {
        self.state.lock().unwrap().open_orders.push(OrderInfo {
            id,
            state: crate::client::OrderState::Open,
        });
    }

    pub fn remove_open_order(&self, id: &OrderId) {
        self.state
            .lock()
            .unwrap()
            .open_orders
            .retain(|o| o.id != *id);
    }

    pub fn set_bid(&self, info: BidInfo) {
        let mut state = self.state.lock().unwrap();
        state.bids.insert(info.id.clone(), info);
    }

    pub fn add_lease(&self, info: LeaseInfo) {
        self.state.lock().unwrap().leases.push(info);
    }

    pub fn set_provider(&self, info: ProviderInfo) {
        let mut state = self.state.lock().unwrap();
        state.providers.insert(info.address.clone(), info);
    }

    pub fn set_auditor_attributes(&self, auditor: &str, provider: &str, attrs: Vec<Attribute>) {
        self.state
            .lock()
            .unwrap()
            .audits
            .insert((auditor.to_string(), provider.to_string()), attrs);
    }

    pub fn set_escrow_account(&self, id: DeploymentId, account: EscrowAccount) {
        self.state.lock().unwrap().escrow.insert(id, account);
    }

    pub fn set_sync_info(&self, info: SyncInfo) {
        self.state.lock().unwrap().sync = Some(info);
    }

    /// Make every subsequent broadcast fail.
    pub fn fail_broadcasts(&self, fail: bool) {
        self.state.lock().unwrap().fail_broadcasts = fail;
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    fn record(&self, msg: Broadcast) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_broadcasts {
            return Err(ChainError::Broadcast("mock broadcast failure".to_string()));
        }
        if let Broadcast::CreateBid { id, price } = &msg {
            state.bids.insert(
                id.clone(),
                BidInfo {
                    id: id.clone(),
                    price: *price,
                    state: BidState::Open,
                },
            );
        }
        state.broadcasts.push(msg);
        Ok(())
    }
}

#[async_trait]
impl QueryClient for MockChain {
    async fn group(&self, id: &GroupId) -> Result<GroupSpec, ChainError> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(id)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("group {id}")))
    }

    async fn deployment(&self, id: &DeploymentId) -> Result<DeploymentInfo, ChainError> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(id)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("deployment {id}")))
    }

    async fn open_orders(&self) -> Result<Vec<OrderInfo>, ChainError> {
        Ok(self.state.lock().unwrap().open_orders.clone())
    }

    async fn bid(&self, id: &BidId) -> Result<Option<BidInfo>, ChainError> {
        Ok(self.state.lock().unwrap().bids.get(id).cloned())
    }

    async fn provider_leases(&self, provider: &str) -> Result<Vec<LeaseInfo>, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .leases
            .iter()
            .filter(|l| l.id.provider == provider)
            .cloned()
            .collect())
    }

    async fn deployment_leases(&self, id: &DeploymentId) -> Result<Vec<LeaseInfo>, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .leases
            .iter()
            .filter(|l| l.id.deployment_id() == *id)
            .cloned()
            .collect())
    }

    async fn provider(&self, address: &str) -> Result<ProviderInfo, ChainError> {
        self.state
            .lock()
            .unwrap()
            .providers
            .get(address)
            .cloned()
            .ok_or_else(|| ChainError::NotFound(format!("provider {address}")))
    }

    async fn auditor_attributes(
        &self,
        auditor: &str,
        provider: &str,
    ) -> Result<Option<Vec<Attribute>>, ChainError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .audits
            .get(&(auditor.to_string(), provider.to_string()))
            .cloned())
    }

    async fn escrow_account(&self, id: &DeploymentId) -> Result<EscrowAccount, ChainError> {
        self.state
            .lock()
            .unwrap()
            .escrow
            .get(id)
            .copied()
            .ok_or_else(|| ChainError::NotFound(format!("escrow account {id}")))
    }

    async fn sync_info(&self) -> Result<SyncInfo, ChainError> {
        self.state
            .lock()
            .unwrap()
            .sync
            .ok_or_else(|| ChainError::Query("sync info unavailable".to_string()))
    }
}

#[async_trait]
impl TxClient for MockChain {
    async fn create_bid(&self, id: &BidId, price: u64) -> Result<(), ChainError> {
        self.record(Broadcast::CreateBid {
            id: id.clone(),
            price,
        })
    }

    async fn close_bid(&self, id: &BidId) -> Result<(), ChainError> {
        self.record(Broadcast::CloseBid(id.clone()))
    }

    async fn withdraw_lease(&self, id: &LeaseId) -> Result<(), ChainError> {
        self.record(Broadcast::WithdrawLease(id.clone()))
    }

    async fn close_lease(&self, id: &LeaseId) -> Result<(), ChainError> {
        self.record(Broadcast::CloseLease(id.clone()))
    }
}
