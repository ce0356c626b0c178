//! Cluster layer of the provider daemon.
//!
//! Tracks local compute inventory and reservations, owns hostname
//! claims for ingress routing, and drives won leases to a running
//! state on the compute backend through per-lease deployment managers
//! and monitors. The backend itself is consumed through the
//! [`ClusterClient`] capability; its internals are out of scope.

mod client;
mod config;
mod hostname;
mod inventory;
mod manager;
pub mod mock;
mod monitor;
mod service;

pub use client::{
    ActiveDeployment, ClusterClient, ClusterError, LeaseStatus, Node, ServiceStatus,
};
pub use config::ClusterConfig;
pub use hostname::{HostnameError, HostnameService};
pub use inventory::{InventoryError, InventoryService, InventoryStatus, Reservation};
pub use manager::DeploymentManager;
pub use service::{ClusterService, ClusterServiceStatus};
