//! Chain access for the provider daemon.
//!
//! The ledger is an external collaborator consumed through two narrow
//! interfaces: a read-only [`QueryClient`] and a fire-and-confirm
//! [`TxClient`]. Both are eventually consistent with chain height;
//! broadcast failures are business errors, not protocol errors.

mod client;
pub mod mock;
mod session;

pub use client::{
    BidInfo, BidState, ChainError, DeploymentInfo, EscrowAccount, LeaseInfo, LeaseState,
    OrderInfo, OrderState, ProviderInfo, QueryClient, SyncInfo, TxClient,
};
pub use session::Session;
