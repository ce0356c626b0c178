//! Tenant-supplied workload manifests.
//!
//! A manifest realizes one or more group specs: concrete service
//! definitions (image, args, exposed ports/hostnames, replica counts)
//! submitted off-chain. A manifest must hash to the version recorded on
//! chain for its deployment and must structurally conform to the group
//! specs it manifests.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::resource::{GroupSpec, ResourceUnits};

/// Manifest validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest has no groups")]
    Empty,

    #[error("manifest group {0} not found in deployment")]
    GroupNotFound(String),

    #[error("service {service} in group {group} exceeds deployment resources")]
    ResourceMismatch { group: String, service: String },

    #[error("service {service} count {got} does not fit deployment count {want}")]
    CountMismatch { service: String, got: u32, want: u32 },

    #[error("service {0} declares no image")]
    NoImage(String),
}

/// Transport protocol for an exposed service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceProto {
    Tcp,
    Udp,
}

/// One exposed port of a service, with optional ingress hostnames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceExpose {
    pub port: u16,
    pub external_port: u16,
    pub proto: ServiceProto,
    pub global: bool,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl ServiceExpose {
    /// The port this expose is reachable on externally.
    pub fn effective_external_port(&self) -> u16 {
        if self.external_port == 0 {
            self.port
        } else {
            self.external_port
        }
    }

    /// Whether this expose is routed through HTTP ingress: a global
    /// TCP expose on the HTTP port.
    pub fn is_ingress(&self) -> bool {
        self.global && self.proto == ServiceProto::Tcp && self.effective_external_port() == 80
    }
}

/// A concrete service definition within a manifest group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub resources: ResourceUnits,
    pub count: u32,
    #[serde(default)]
    pub expose: Vec<ServiceExpose>,
}

/// The services realizing one group spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestGroup {
    pub name: String,
    pub services: Vec<Service>,
}

impl ManifestGroup {
    /// All ingress hostnames declared by this group's services.
    pub fn all_hostnames(&self) -> Vec<String> {
        let mut out = Vec::new();
        for service in &self.services {
            for expose in &service.expose {
                if expose.is_ingress() {
                    out.extend(expose.hosts.iter().cloned());
                }
            }
        }
        out
    }
}

/// A complete tenant manifest for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub groups: Vec<ManifestGroup>,
}

impl Manifest {
    pub fn group(&self, name: &str) -> Option<&ManifestGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Basic structural validation independent of any deployment.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.groups.is_empty() {
            return Err(ManifestError::Empty);
        }
        for group in &self.groups {
            for service in &group.services {
                if service.image.is_empty() {
                    return Err(ManifestError::NoImage(service.name.clone()));
                }
            }
        }
        Ok(())
    }

    /// Validate that this manifest structurally conforms to the
    /// deployment's group specs: every manifest group must name a
    /// deployment group, and each service's (resources, count) must be
    /// covered by that group's declared resources.
    pub fn validate_with_groups(&self, specs: &[GroupSpec]) -> Result<(), ManifestError> {
        for group in &self.groups {
            let spec = specs
                .iter()
                .find(|s| s.name == group.name)
                .ok_or_else(|| ManifestError::GroupNotFound(group.name.clone()))?;

            // Consumable copy of the spec's capacity per resource shape.
            let mut remaining: Vec<(ResourceUnits, u32)> = spec
                .resources
                .iter()
                .map(|r| (r.resources.clone(), r.count))
                .collect();

            for service in &group.services {
                let slot = remaining
                    .iter_mut()
                    .find(|(units, count)| *count > 0 && covers(units, &service.resources));

                match slot {
                    Some((_, count)) => {
                        if service.count > *count {
                            return Err(ManifestError::CountMismatch {
                                service: service.name.clone(),
                                got: service.count,
                                want: *count,
                            });
                        }
                        *count -= service.count;
                    }
                    None => {
                        return Err(ManifestError::ResourceMismatch {
                            group: group.name.clone(),
                            service: service.name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn covers(offered: &ResourceUnits, wanted: &ResourceUnits) -> bool {
    offered.cpu_millis >= wanted.cpu_millis
        && offered.memory_bytes >= wanted.memory_bytes
        && offered.storage_bytes >= wanted.storage_bytes
        && offered.endpoints >= wanted.endpoints
}

/// Compute the version hash of a manifest: sha256 over its canonical
/// JSON encoding. This is the value recorded on chain at deployment
/// creation time.
pub fn manifest_version(manifest: &Manifest) -> Vec<u8> {
    let encoded = serde_json::to_vec(manifest).expect("manifest serialization is infallible");
    Sha256::digest(&encoded).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{PlacementRequirements, Resource, MIB};

    fn units(cpu: u64, mem: u64) -> ResourceUnits {
        ResourceUnits {
            cpu_millis: cpu,
            memory_bytes: mem,
            storage_bytes: 0,
            endpoints: 0,
        }
    }

    fn sample_manifest() -> Manifest {
        Manifest {
            groups: vec![ManifestGroup {
                name: "web".to_string(),
                services: vec![Service {
                    name: "app".to_string(),
                    image: "registry/app:1".to_string(),
                    args: vec![],
                    env: vec![],
                    resources: units(100, 64 * MIB),
                    count: 2,
                    expose: vec![ServiceExpose {
                        port: 80,
                        external_port: 0,
                        proto: ServiceProto::Tcp,
                        global: true,
                        hosts: vec!["app.example.com".to_string()],
                    }],
                }],
            }],
        }
    }

    fn sample_spec() -> GroupSpec {
        GroupSpec {
            name: "web".to_string(),
            requirements: PlacementRequirements::default(),
            resources: vec![Resource {
                resources: units(100, 64 * MIB),
                count: 2,
                price: 10,
            }],
        }
    }

    #[test]
    fn version_is_stable_and_content_sensitive() {
        let m = sample_manifest();
        let v1 = manifest_version(&m);
        let v2 = manifest_version(&m);
        assert_eq!(v1, v2);

        let mut mutated = m;
        mutated.groups[0].services[0].count = 3;
        assert_ne!(v1, manifest_version(&mutated));
    }

    #[test]
    fn conforming_manifest_passes() {
        let m = sample_manifest();
        m.validate().unwrap();
        m.validate_with_groups(&[sample_spec()]).unwrap();
    }

    #[test]
    fn unknown_group_is_rejected() {
        let mut m = sample_manifest();
        m.groups[0].name = "batch".to_string();
        assert_eq!(
            m.validate_with_groups(&[sample_spec()]),
            Err(ManifestError::GroupNotFound("batch".to_string()))
        );
    }

    #[test]
    fn oversized_service_is_rejected() {
        let mut m = sample_manifest();
        m.groups[0].services[0].resources.cpu_millis = 4000;
        assert!(matches!(
            m.validate_with_groups(&[sample_spec()]),
            Err(ManifestError::ResourceMismatch { .. })
        ));
    }

    #[test]
    fn excess_count_is_rejected() {
        let mut m = sample_manifest();
        m.groups[0].services[0].count = 5;
        assert!(matches!(
            m.validate_with_groups(&[sample_spec()]),
            Err(ManifestError::CountMismatch { .. })
        ));
    }

    #[test]
    fn ingress_detection_and_hostnames() {
        let m = sample_manifest();
        assert_eq!(m.groups[0].all_hostnames(), vec!["app.example.com".to_string()]);

        let mut non_ingress = m.clone();
        non_ingress.groups[0].services[0].expose[0].external_port = 8080;
        assert!(non_ingress.groups[0].all_hostnames().is_empty());
    }
}
