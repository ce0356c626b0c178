//! Marketplace identity types.
//!
//! An order is identified by (owner, dseq, gseq, oseq). A bid adds the
//! provider address, and a lease is a bid that won. Hostname claims are
//! keyed coarser — (owner, dseq, gseq) — so a redeploy under the same
//! deployment/group does not contend with itself.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a deployment on chain: (owner, deployment sequence).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentId {
    pub owner: String,
    pub dseq: u64,
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.dseq)
    }
}

/// Identifies a resource group within a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId {
    pub owner: String,
    pub dseq: u64,
    pub gseq: u32,
}

impl GroupId {
    pub fn deployment_id(&self) -> DeploymentId {
        DeploymentId {
            owner: self.owner.clone(),
            dseq: self.dseq,
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.dseq, self.gseq)
    }
}

/// Identifies an open demand for resources within a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId {
    pub owner: String,
    pub dseq: u64,
    pub gseq: u32,
    pub oseq: u32,
}

impl OrderId {
    pub fn group_id(&self) -> GroupId {
        GroupId {
            owner: self.owner.clone(),
            dseq: self.dseq,
            gseq: self.gseq,
        }
    }

    pub fn deployment_id(&self) -> DeploymentId {
        DeploymentId {
            owner: self.owner.clone(),
            dseq: self.dseq,
        }
    }

    pub fn bid_id(&self, provider: &str) -> BidId {
        BidId {
            order: self.clone(),
            provider: provider.to_string(),
        }
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.owner, self.dseq, self.gseq, self.oseq)
    }
}

/// A provider's priced offer against an order. At most one active bid
/// per (order, provider) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BidId {
    pub order: OrderId,
    pub provider: String,
}

impl BidId {
    pub fn lease_id(&self) -> LeaseId {
        LeaseId {
            order: self.order.clone(),
            provider: self.provider.clone(),
        }
    }
}

impl fmt::Display for BidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.order, self.provider)
    }
}

/// A bid promoted to a won state; identifies one deployment lifecycle
/// on this provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId {
    pub order: OrderId,
    pub provider: String,
}

impl LeaseId {
    pub fn bid_id(&self) -> BidId {
        BidId {
            order: self.order.clone(),
            provider: self.provider.clone(),
        }
    }

    pub fn order_id(&self) -> OrderId {
        self.order.clone()
    }

    pub fn group_id(&self) -> GroupId {
        self.order.group_id()
    }

    pub fn deployment_id(&self) -> DeploymentId {
        self.order.deployment_id()
    }

    pub fn hostname_id(&self) -> HostnameId {
        HostnameId {
            owner: self.order.owner.clone(),
            dseq: self.order.dseq,
            gseq: self.order.gseq,
        }
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.order, self.provider)
    }
}

/// Ownership key for hostname claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostnameId {
    pub owner: String,
    pub dseq: u64,
    pub gseq: u32,
}

impl fmt::Display for HostnameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.dseq, self.gseq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> OrderId {
        OrderId {
            owner: "owner1".to_string(),
            dseq: 7,
            gseq: 1,
            oseq: 2,
        }
    }

    #[test]
    fn order_projections() {
        let o = order();
        assert_eq!(o.group_id().deployment_id(), o.deployment_id());
        assert_eq!(o.to_string(), "owner1/7/1/2");
    }

    #[test]
    fn bid_lease_round_trip() {
        let bid = order().bid_id("provider1");
        let lease = bid.lease_id();
        assert_eq!(lease.bid_id(), bid);
        assert_eq!(lease.order_id(), order());
    }

    #[test]
    fn hostname_id_ignores_order_sequence() {
        let mut a = order();
        let lease_a = a.bid_id("p").lease_id();
        a.oseq = 9;
        let lease_b = a.bid_id("p").lease_id();
        assert_eq!(lease_a.hostname_id(), lease_b.hostname_id());
    }
}
