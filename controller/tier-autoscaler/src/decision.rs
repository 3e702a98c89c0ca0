//! Scale decision engine
//!
//! Compares the observed quota metric against a threshold share of the
//! resource's provisioned capacity:
//!
//! ```text
//! limit = floor(capacity_units * unit_capacity(tier) * percentage / 100)
//! value >= limit  => Escalate
//! value <  limit  => NoAction
//! ```

use crate::error::{ConfigError, CycleError};
use crate::provider::ResourceDescription;
use crate::tiers::{TierSpec, TierTable};

/// Share of provisioned capacity that triggers escalation, in (0, 100]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    percentage: f64,
}

impl ThresholdConfig {
    pub fn new(percentage: f64) -> Result<Self, ConfigError> {
        if !percentage.is_finite() || percentage <= 0.0 || percentage > 100.0 {
            return Err(ConfigError::InvalidThreshold { value: percentage });
        }
        Ok(Self { percentage })
    }

    pub fn percentage(&self) -> f64 {
        self.percentage
    }
}

/// Outcome of comparing one metric reading against the limit
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    NoAction { limit: u64, observed: f64 },
    Escalate { limit: u64, observed: f64 },
}

impl Decision {
    pub fn limit(&self) -> u64 {
        match self {
            Decision::NoAction { limit, .. } | Decision::Escalate { limit, .. } => *limit,
        }
    }
}

/// Limit for `capacity_units` of `tier` at the given threshold, truncated toward zero
pub fn message_limit(tier: &TierSpec, capacity_units: u32, threshold: &ThresholdConfig) -> u64 {
    let provisioned = u128::from(capacity_units) * u128::from(tier.unit_capacity);
    (provisioned as f64 * threshold.percentage / 100.0).floor() as u64
}

/// Immutable scaling configuration shared by the decision engine and the
/// escalation policy for the lifetime of the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub threshold: ThresholdConfig,
    pub tiers: TierTable,
}

impl ScalingPolicy {
    pub fn new(threshold: ThresholdConfig, tiers: TierTable) -> Self {
        Self { threshold, tiers }
    }

    pub fn message_limit(&self, description: &ResourceDescription) -> Result<u64, CycleError> {
        let tier = self.tiers.require(&description.tier_name)?;
        Ok(message_limit(
            tier,
            description.capacity_units,
            &self.threshold,
        ))
    }

    pub fn decide(
        &self,
        description: &ResourceDescription,
        metric_value: f64,
    ) -> Result<Decision, CycleError> {
        let limit = self.message_limit(description)?;

        if metric_value >= limit as f64 {
            Ok(Decision::Escalate {
                limit,
                observed: metric_value,
            })
        } else {
            Ok(Decision::NoAction {
                limit,
                observed: metric_value,
            })
        }
    }

    pub fn next_tier(
        &self,
        description: &ResourceDescription,
    ) -> Result<Option<ResourceDescription>, CycleError> {
        self.tiers.next_tier(description)
    }
}
