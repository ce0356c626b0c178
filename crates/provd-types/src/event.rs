//! Events crossing the bus.

use serde::{Deserialize, Serialize};

use crate::id::{LeaseId, OrderId};
use crate::manifest::ManifestGroup;
use crate::resource::GroupSpec;

/// Deployment health as observed by the cluster monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    Deployed,
}

/// Everything published on the in-process event bus. Chain listeners
/// publish order/lease events; internal components publish the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// An order was opened on chain.
    OrderCreated { order_id: OrderId },
    /// An order closed before a lease was created.
    OrderClosed { order_id: OrderId },
    /// A lease was created on chain (for any provider).
    LeaseCreated { lease_id: LeaseId, price: u64 },
    /// A lease closed on chain.
    LeaseClosed { lease_id: LeaseId },
    /// This provider won a lease; the reservation converts into a
    /// live deployment.
    LeaseWon {
        lease_id: LeaseId,
        group: GroupSpec,
        price: u64,
    },
    /// A validated manifest has been paired with a won lease and
    /// on-chain deployment data.
    ManifestReceived {
        lease_id: LeaseId,
        group: ManifestGroup,
    },
    /// Deployment health status from the cluster monitor.
    ClusterDeployment {
        lease_id: LeaseId,
        group_name: String,
        status: DeploymentStatus,
    },
    /// Request to withdraw earned funds for a lease.
    LeaseWithdraw { lease_id: LeaseId },
    /// Start watching a lease's escrow funding.
    LeaseAddFundsMonitor { lease_id: LeaseId },
    /// Stop watching a lease's escrow funding.
    LeaseRemoveFundsMonitor { lease_id: LeaseId },
}
