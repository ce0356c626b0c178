//! Shared domain types for the provd daemon.
//!
//! Everything that crosses a crate boundary lives here: marketplace
//! identity (orders, bids, leases), resource groups, manifests, and
//! the event types published on the bus.

pub mod event;
pub mod id;
pub mod manifest;
pub mod resource;

pub use event::{DeploymentStatus, Event};
pub use id::{BidId, DeploymentId, GroupId, HostnameId, LeaseId, OrderId};
pub use manifest::{
    manifest_version, Manifest, ManifestError, ManifestGroup, Service, ServiceExpose,
    ServiceProto,
};
pub use resource::{
    match_attributes, Attribute, GroupSpec, PlacementRequirements, Resource, ResourceUnits,
    SignedBy, GIB, MIB,
};
