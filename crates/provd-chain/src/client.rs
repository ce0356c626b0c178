//! Query and broadcast client traits.

use async_trait::async_trait;
use thiserror::Error;

use provd_types::{Attribute, BidId, DeploymentId, GroupId, GroupSpec, LeaseId, OrderId};

/// Chain access errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    #[error("{0} not found")]
    NotFound(String),
}

/// On-chain order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Open,
    Matched,
    Closed,
}

/// On-chain bid state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidState {
    Open,
    Active,
    Lost,
    Closed,
}

/// On-chain lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct OrderInfo {
    pub id: OrderId,
    pub state: OrderState,
}

#[derive(Debug, Clone)]
pub struct BidInfo {
    pub id: BidId,
    pub price: u64,
    pub state: BidState,
}

#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub price: u64,
    pub state: LeaseState,
}

/// Deployment record as stored on chain: the manifest version hash
/// plus the group specs it was created with.
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub id: DeploymentId,
    pub version: Vec<u8>,
    pub groups: Vec<GroupSpec>,
}

/// This provider's on-chain registration.
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub address: String,
    pub attributes: Vec<Attribute>,
}

/// Escrow account backing a deployment's leases.
#[derive(Debug, Clone, Copy)]
pub struct EscrowAccount {
    /// Remaining balance, in price units.
    pub balance: u64,
    /// Block height at which the account was last settled.
    pub settled_at: u64,
}

/// Node synchronization status.
#[derive(Debug, Clone, Copy)]
pub struct SyncInfo {
    pub latest_block_height: u64,
    pub catching_up: bool,
}

/// Read-only view of chain state.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn group(&self, id: &GroupId) -> Result<GroupSpec, ChainError>;

    async fn deployment(&self, id: &DeploymentId) -> Result<DeploymentInfo, ChainError>;

    /// Open orders, used for bid-engine catchup after a restart.
    async fn open_orders(&self) -> Result<Vec<OrderInfo>, ChainError>;

    async fn bid(&self, id: &BidId) -> Result<Option<BidInfo>, ChainError>;

    /// Active leases held by `provider`.
    async fn provider_leases(&self, provider: &str) -> Result<Vec<LeaseInfo>, ChainError>;

    /// Active leases under a deployment, across providers.
    async fn deployment_leases(&self, id: &DeploymentId) -> Result<Vec<LeaseInfo>, ChainError>;

    async fn provider(&self, address: &str) -> Result<ProviderInfo, ChainError>;

    /// Attributes of `provider` signed off by `auditor`, if any.
    async fn auditor_attributes(
        &self,
        auditor: &str,
        provider: &str,
    ) -> Result<Option<Vec<Attribute>>, ChainError>;

    async fn escrow_account(&self, id: &DeploymentId) -> Result<EscrowAccount, ChainError>;

    async fn sync_info(&self) -> Result<SyncInfo, ChainError>;
}

/// Submit signed messages to the chain.
#[async_trait]
pub trait TxClient: Send + Sync {
    async fn create_bid(&self, id: &BidId, price: u64) -> Result<(), ChainError>;

    async fn close_bid(&self, id: &BidId) -> Result<(), ChainError>;

    async fn withdraw_lease(&self, id: &LeaseId) -> Result<(), ChainError>;

    async fn close_lease(&self, id: &LeaseId) -> Result<(), ChainError>;
}
