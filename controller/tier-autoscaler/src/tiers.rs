//! Tier table and escalation policy
//!
//! The tier table is an ordered list of capacity classes, lowest first. Scale
//! order is lexicographic on (tier position, unit count). Escalation walks that
//! order one step at a time: add a unit within the current tier, and once the
//! tier is full move to the next tier at its minimum unit count.

use crate::error::{ConfigError, CycleError};
use crate::provider::ResourceDescription;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// One capacity class of the managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierSpec {
    pub name: String,
    pub min_units: u32,
    pub max_units: u32,
    /// Quota allowance granted by a single unit of this tier
    pub unit_capacity: u64,
}

impl TierSpec {
    pub fn new(name: &str, min_units: u32, max_units: u32, unit_capacity: u64) -> Self {
        Self {
            name: name.to_string(),
            min_units,
            max_units,
            unit_capacity,
        }
    }
}

/// Ordered, validated set of tiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<TierSpec>,
}

impl Default for TierTable {
    /// Messaging-hub style defaults: S1/S2/S3 with per-unit daily message quotas
    fn default() -> Self {
        Self {
            tiers: vec![
                TierSpec::new("S1", 1, 200, 400_000),
                TierSpec::new("S2", 1, 200, 6_000_000),
                TierSpec::new("S3", 1, 10, 300_000_000),
            ],
        }
    }
}

impl TierTable {
    pub fn new(tiers: Vec<TierSpec>) -> Result<Self, ConfigError> {
        if tiers.is_empty() {
            return Err(ConfigError::EmptyTierTable);
        }

        let mut seen = HashSet::new();
        for tier in &tiers {
            if !seen.insert(tier.name.as_str()) {
                return Err(ConfigError::DuplicateTier {
                    tier: tier.name.clone(),
                });
            }
            if tier.min_units == 0 {
                return Err(ConfigError::InvalidTier {
                    tier: tier.name.clone(),
                    message: "minUnits must be at least 1".to_string(),
                });
            }
            if tier.min_units > tier.max_units {
                return Err(ConfigError::InvalidTier {
                    tier: tier.name.clone(),
                    message: format!(
                        "minUnits {} exceeds maxUnits {}",
                        tier.min_units, tier.max_units
                    ),
                });
            }
            if tier.unit_capacity == 0 {
                return Err(ConfigError::InvalidTier {
                    tier: tier.name.clone(),
                    message: "unitCapacity must be positive".to_string(),
                });
            }
        }

        Ok(Self { tiers })
    }

    /// Parse a JSON array of tier specs, lowest tier first
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let tiers: Vec<TierSpec> =
            serde_json::from_str(raw).map_err(|e| ConfigError::TierTableParse {
                message: e.to_string(),
            })?;
        Self::new(tiers)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::TierTableIo {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json(&raw)
    }

    pub fn tiers(&self) -> &[TierSpec] {
        &self.tiers
    }

    pub fn get(&self, name: &str) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// Look up a tier, treating an unknown name as a cycle failure
    pub fn require(&self, name: &str) -> Result<&TierSpec, CycleError> {
        self.get(name).ok_or_else(|| CycleError::UnknownTier {
            tier: name.to_string(),
        })
    }

    /// Next step up in scale order, or `None` at the top unit count of the top tier
    pub fn next_tier(
        &self,
        current: &ResourceDescription,
    ) -> Result<Option<ResourceDescription>, CycleError> {
        let position = self
            .tiers
            .iter()
            .position(|t| t.name == current.tier_name)
            .ok_or_else(|| CycleError::UnknownTier {
                tier: current.tier_name.clone(),
            })?;
        let tier = &self.tiers[position];

        if current.capacity_units < tier.min_units {
            return Ok(Some(ResourceDescription::new(&tier.name, tier.min_units)));
        }

        if current.capacity_units < tier.max_units {
            return Ok(Some(ResourceDescription::new(
                &tier.name,
                current.capacity_units + 1,
            )));
        }

        Ok(self
            .tiers
            .get(position + 1)
            .map(|next| ResourceDescription::new(&next.name, next.min_units)))
    }

    /// Position of a description in scale order; `None` for unknown tiers
    pub fn scale_rank(&self, description: &ResourceDescription) -> Option<(usize, u32)> {
        self.tiers
            .iter()
            .position(|t| t.name == description.tier_name)
            .map(|idx| (idx, description.capacity_units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tier_table() -> TierTable {
        TierTable::new(vec![
            TierSpec::new("S1", 1, 2, 100),
            TierSpec::new("S2", 1, 3, 1_000),
        ])
        .unwrap()
    }

    #[test]
    fn test_increments_within_tier() {
        let table = two_tier_table();
        let next = table
            .next_tier(&ResourceDescription::new("S1", 1))
            .unwrap();
        assert_eq!(next, Some(ResourceDescription::new("S1", 2)));
    }

    #[test]
    fn test_moves_to_next_tier_minimum_when_full() {
        let table = two_tier_table();
        let next = table
            .next_tier(&ResourceDescription::new("S1", 2))
            .unwrap();
        assert_eq!(next, Some(ResourceDescription::new("S2", 1)));
    }

    #[test]
    fn test_none_at_top_of_top_tier() {
        let table = two_tier_table();
        let next = table
            .next_tier(&ResourceDescription::new("S2", 3))
            .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_unknown_tier_is_an_error() {
        let table = two_tier_table();
        let err = table
            .next_tier(&ResourceDescription::new("F1", 1))
            .unwrap_err();
        assert_eq!(
            err,
            CycleError::UnknownTier {
                tier: "F1".to_string()
            }
        );
    }

    #[test]
    fn test_capacity_below_minimum_is_raised_to_minimum() {
        let table = TierTable::new(vec![TierSpec::new("P1", 2, 4, 10)]).unwrap();
        let next = table
            .next_tier(&ResourceDescription::new("P1", 1))
            .unwrap();
        assert_eq!(next, Some(ResourceDescription::new("P1", 2)));
    }

    #[test]
    fn test_next_tier_is_strictly_increasing_over_whole_table() {
        let table = TierTable::default();

        for tier in table.tiers() {
            for units in tier.min_units..=tier.max_units {
                let current = ResourceDescription::new(&tier.name, units);
                let next = table.next_tier(&current).unwrap();
                let is_top = tier.name == "S3" && units == tier.max_units;

                match next {
                    Some(next) => {
                        assert!(!is_top, "top of table must not escalate");
                        assert!(
                            table.scale_rank(&next).unwrap() > table.scale_rank(&current).unwrap(),
                            "{:?} -> {:?} is not an escalation",
                            current,
                            next
                        );
                    }
                    None => assert!(is_top, "{:?} reported no higher tier", current),
                }
            }
        }
    }

    #[test]
    fn test_rejects_invalid_tables() {
        assert!(matches!(
            TierTable::new(vec![]),
            Err(ConfigError::EmptyTierTable)
        ));
        assert!(matches!(
            TierTable::new(vec![
                TierSpec::new("S1", 1, 2, 100),
                TierSpec::new("S1", 1, 2, 100)
            ]),
            Err(ConfigError::DuplicateTier { .. })
        ));
        assert!(matches!(
            TierTable::new(vec![TierSpec::new("S1", 3, 2, 100)]),
            Err(ConfigError::InvalidTier { .. })
        ));
        assert!(matches!(
            TierTable::new(vec![TierSpec::new("S1", 0, 2, 100)]),
            Err(ConfigError::InvalidTier { .. })
        ));
        assert!(matches!(
            TierTable::new(vec![TierSpec::new("S1", 1, 2, 0)]),
            Err(ConfigError::InvalidTier { .. })
        ));
    }

    #[test]
    fn test_from_json() {
        let table = TierTable::from_json(
            r#"[
                {"name": "B1", "minUnits": 1, "maxUnits": 4, "unitCapacity": 500},
                {"name": "B2", "minUnits": 2, "maxUnits": 8, "unitCapacity": 5000}
            ]"#,
        )
        .unwrap();

        assert_eq!(table.tiers().len(), 2);
        assert_eq!(table.get("B2").unwrap().min_units, 2);
        assert!(matches!(
            TierTable::from_json("{not json"),
            Err(ConfigError::TierTableParse { .. })
        ));
    }
}
