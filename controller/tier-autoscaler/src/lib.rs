//! Tier Autoscaler - keeps a managed resource's capacity tier ahead of its quota usage
//!
//! A single control loop per resource periodically reads the resource's tier
//! and a named quota metric, and escalates to the next capacity step once usage
//! crosses a configured share of what is provisioned. The loop is guarded by a
//! fixed identity in an instance registry so overlapping ticks never produce
//! overlapping cycles.

pub mod config;
pub mod decision;
pub mod error;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod tiers;
pub mod worker;

pub use config::Config;
pub use decision::{Decision, ScalingPolicy, ThresholdConfig};
pub use error::{ConfigError, CycleError};
pub use metrics::Metrics;
pub use provider::{
    ClientFactory, Credentials, DryRunProvisioner, FixedClients, HttpClientFactory,
    HttpResourceClient, MetricsProvider, ProvisioningProvider, QuotaMetric, ResourceDescription,
};
pub use registry::{InMemoryInstanceRegistry, InstanceRecord, InstanceRegistry, NatsInstanceRegistry};
pub use scheduler::{SingleInstanceScheduler, TickOutcome};
pub use tiers::{TierSpec, TierTable};
pub use worker::{CycleOutcome, ScalingWorker};
