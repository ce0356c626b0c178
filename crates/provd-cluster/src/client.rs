//! Compute backend capability.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use provd_types::{LeaseId, ManifestGroup, ResourceUnits};

/// Cluster backend errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("deploy failed: {0}")]
    Deploy(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("status query failed: {0}")]
    Status(String),

    #[error("inventory query failed: {0}")]
    Inventory(String),

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("not running")]
    NotRunning,
}

/// A cluster node's advertised available capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub name: String,
    pub available: ResourceUnits,
}

/// Live availability of one declared service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub available: u32,
    pub total: u32,
}

/// Per-service availability for a lease's workloads.
#[derive(Debug, Clone, Default)]
pub struct LeaseStatus {
    pub services: HashMap<String, ServiceStatus>,
}

/// A deployment the backend already runs, discovered at startup.
#[derive(Debug, Clone)]
pub struct ActiveDeployment {
    pub lease_id: LeaseId,
    pub group: ManifestGroup,
}

/// The compute backend as the core consumes it: deploy and tear down
/// manifest groups, query workload health, and report node capacity.
/// Implementations must be safe for concurrent use.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn deploy(&self, lease: &LeaseId, group: &ManifestGroup) -> Result<(), ClusterError>;

    async fn teardown_lease(&self, lease: &LeaseId) -> Result<(), ClusterError>;

    async fn lease_status(&self, lease: &LeaseId) -> Result<LeaseStatus, ClusterError>;

    async fn inventory(&self) -> Result<Vec<Node>, ClusterError>;

    /// Deployments already running on the backend, used to seed
    /// reservations after a restart.
    async fn deployments(&self) -> Result<Vec<ActiveDeployment>, ClusterError>;
}
