//! Error types for the tier autoscaler
//!
//! `CycleError` is the per-cycle failure taxonomy. It never escapes a cycle;
//! the worker folds it into `CycleOutcome::Failed`. `ConfigError` is raised
//! while validating startup configuration and aborts the process.

use thiserror::Error;

/// Why a single evaluation cycle stopped early
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CycleError {
    #[error("Provider client unavailable: {message}")]
    ClientUnavailable { message: String },

    #[error("Failed to fetch resource state: {message}")]
    FetchError { message: String },

    #[error("Quota metric {metric} not reported for resource {resource_id}")]
    MetricUnavailable { metric: String, resource_id: String },

    #[error("No higher tier available above {tier} with {capacity} units")]
    NoHigherTierAvailable { tier: String, capacity: u32 },

    #[error("Tier {tier} is not in the configured tier table")]
    UnknownTier { tier: String },

    #[error("Provisioning update failed: {message}")]
    ProvisioningError { message: String },
}

impl CycleError {
    /// Short, stable label used in structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::ClientUnavailable { .. } => "client_unavailable",
            CycleError::FetchError { .. } => "fetch_error",
            CycleError::MetricUnavailable { .. } => "metric_unavailable",
            CycleError::NoHigherTierAvailable { .. } => "no_higher_tier_available",
            CycleError::UnknownTier { .. } => "unknown_tier",
            CycleError::ProvisioningError { .. } => "provisioning_error",
        }
    }

    /// True for conditions that recur every cycle until an operator changes
    /// configuration or the resource's tier.
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            CycleError::NoHigherTierAvailable { .. } | CycleError::UnknownTier { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Threshold percentage must be in (0, 100], got {value}")]
    InvalidThreshold { value: f64 },

    #[error("Tier table is empty")]
    EmptyTierTable,

    #[error("Tier {tier} appears more than once in the tier table")]
    DuplicateTier { tier: String },

    #[error("Tier {tier} has invalid unit bounds: {message}")]
    InvalidTier { tier: String, message: String },

    #[error("Instance id {value:?} contains characters outside [A-Za-z0-9._-]")]
    InvalidInstanceId { value: String },

    #[error("Interval must be at least one second")]
    InvalidInterval,

    #[error("Lease of {lease_secs}s must exceed {minimum_secs}s (interval plus request budget)")]
    LeaseTooShort { lease_secs: u64, minimum_secs: u64 },

    #[error("Failed to read tier table {path}: {message}")]
    TierTableIo { path: String, message: String },

    #[error("Failed to parse tier table: {message}")]
    TierTableParse { message: String },
}
