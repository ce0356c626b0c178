//! Resource groups and placement requirements.

use serde::{Deserialize, Serialize};

/// One mebibyte, used for memory-scaled pricing.
pub const MIB: u64 = 1 << 20;
/// One gibibyte.
pub const GIB: u64 = 1 << 30;

/// A single compute unit: CPU in millicores, memory/storage in bytes,
/// plus the number of externally-exposed endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceUnits {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub endpoints: u32,
}

/// A resource requirement within a group: `count` replicas of `resources`,
/// each priced at `price` per block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub resources: ResourceUnits,
    pub count: u32,
    pub price: u64,
}

/// A provider attribute, or an attribute predicate in placement
/// requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Auditor sign-off constraints on provider attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBy {
    pub all_of: Vec<String>,
    pub any_of: Vec<String>,
}

impl SignedBy {
    pub fn is_empty(&self) -> bool {
        self.all_of.is_empty() && self.any_of.is_empty()
    }
}

/// Placement requirements for a group: attribute predicates plus
/// auditor constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRequirements {
    pub attributes: Vec<Attribute>,
    pub signed_by: SignedBy,
}

/// Resource requirements for a deployment group. Read-only once fetched
/// from chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub requirements: PlacementRequirements,
    pub resources: Vec<Resource>,
}

impl GroupSpec {
    /// The group's declared maximum price per block: the sum over all
    /// resources of `price * count`.
    pub fn price(&self) -> u64 {
        self.resources
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.price.saturating_mul(u64::from(r.count))))
    }

    /// Total requested memory across the group, weighted by count.
    pub fn memory_total(&self) -> u64 {
        self.resources.iter().fold(0u64, |acc, r| {
            acc.saturating_add(r.resources.memory_bytes.saturating_mul(u64::from(r.count)))
        })
    }

    /// Total endpoint count across the group. Replica count does not
    /// multiply endpoints.
    pub fn endpoint_total(&self) -> u32 {
        self.resources
            .iter()
            .fold(0u32, |acc, r| acc.saturating_add(r.resources.endpoints))
    }

    /// Structural sanity: at least one resource, every count nonzero.
    pub fn validate(&self) -> bool {
        !self.resources.is_empty() && self.resources.iter().all(|r| r.count > 0)
    }
}

/// Check whether provider attributes satisfy every attribute predicate
/// in the requirements. Each required (key, value) pair must appear
/// verbatim in the provider's attribute set.
pub fn match_attributes(provider: &[Attribute], required: &[Attribute]) -> bool {
    required.iter().all(|req| {
        provider
            .iter()
            .any(|attr| attr.key == req.key && attr.value == req.value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GroupSpec {
        GroupSpec {
            name: "web".to_string(),
            requirements: PlacementRequirements::default(),
            resources: vec![Resource {
                resources: ResourceUnits {
                    cpu_millis: 100,
                    memory_bytes: 128 * MIB,
                    storage_bytes: GIB,
                    endpoints: 1,
                },
                count: 3,
                price: 50,
            }],
        }
    }

    #[test]
    fn group_price_weighs_count() {
        assert_eq!(spec().price(), 150);
    }

    #[test]
    fn memory_total_weighs_count() {
        assert_eq!(spec().memory_total(), 3 * 128 * MIB);
    }

    #[test]
    fn endpoint_total_ignores_count() {
        assert_eq!(spec().endpoint_total(), 1);
    }

    #[test]
    fn attribute_matching() {
        let provider = vec![Attribute::new("region", "us-west"), Attribute::new("tier", "ssd")];

        assert!(match_attributes(&provider, &[]));
        assert!(match_attributes(&provider, &[Attribute::new("region", "us-west")]));
        assert!(!match_attributes(&provider, &[Attribute::new("region", "eu-east")]));
        assert!(!match_attributes(&provider, &[Attribute::new("gpu", "a100")]));
        assert!(match_attributes(
            &provider,
            &[Attribute::new("region", "us-west"), Attribute::new("tier", "ssd")]
        ));
    }

    #[test]
    fn validate_rejects_empty_and_zero_count() {
        let mut s = spec();
        assert!(s.validate());
        s.resources[0].count = 0;
        assert!(!s.validate());
        s.resources.clear();
        assert!(!s.validate());
    }
}
