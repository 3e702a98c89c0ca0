//! Configuration for the tier autoscaler service

use crate::decision::{ScalingPolicy, ThresholdConfig};
use crate::error::ConfigError;
use crate::provider::Credentials;
use crate::tiers::TierTable;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tier autoscaler
#[derive(Debug, Clone, Parser)]
#[command(name = "demon-tier-autoscaler")]
#[command(about = "Escalates a managed resource's capacity tier when its quota metric crosses a threshold")]
pub struct Config {
    /// Identifier of the managed resource
    #[arg(long, env)]
    pub resource_id: String,

    /// Fixed loop identity; defaults to tier-autoscaler.<resource-id>
    #[arg(long, env)]
    pub instance_id: Option<String>,

    /// Base URL of the provider resource API
    #[arg(long, env)]
    pub provider_endpoint: String,

    /// Bearer token for the provider API
    #[arg(long, env, hide_env_values = true)]
    pub api_token: Option<String>,

    /// File holding the bearer token; re-read every cycle
    #[arg(long, env)]
    pub api_token_file: Option<PathBuf>,

    /// Name of the quota metric compared against the threshold
    #[arg(long, env, default_value = "TotalMessages")]
    pub metric_name: String,

    /// Percentage of provisioned capacity that triggers escalation, in (0, 100]
    #[arg(long, env, default_value_t = 90.0)]
    pub threshold_percentage: f64,

    /// JSON file with the ordered tier table (lowest tier first)
    #[arg(long, env)]
    pub tier_table: Option<PathBuf>,

    /// Delay between the end of one turn and the start of the next, in seconds
    #[arg(long, env, default_value_t = 3600)]
    pub interval_secs: u64,

    /// Cadence of the external start tick, in seconds
    #[arg(long, env, default_value_t = 3600)]
    pub tick_secs: u64,

    /// Instance lease in seconds; must outlive one interval plus a cycle's
    /// request budget. Defaults to three of each
    #[arg(long, env)]
    pub lease_secs: Option<u64>,

    /// NATS server URL for the shared instance registry (in-memory when unset)
    #[arg(long, env)]
    pub nats_url: Option<String>,

    /// Path to NATS credentials file
    #[arg(long, env)]
    pub nats_creds_path: Option<String>,

    /// JetStream KV bucket holding instance leases
    #[arg(long, env, default_value = "tier_autoscaler_instances")]
    pub registry_bucket: String,

    /// Dry-run mode (log provisioning updates instead of applying them)
    #[arg(long, env)]
    pub dry_run: bool,

    /// Provider API timeout in seconds
    #[arg(long, env, default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    /// Fixed identity of the control loop for this resource
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("tier-autoscaler.{}", self.resource_id))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs.unwrap_or_else(|| {
            self.interval_secs
                .saturating_add(self.request_timeout_secs)
                .saturating_mul(3)
        }))
    }

    /// Shortest lease that still covers an idle wait plus one cycle's
    /// three provider calls at the request timeout
    pub fn minimum_lease_secs(&self) -> u64 {
        self.interval_secs
            .saturating_add(self.request_timeout_secs.saturating_mul(3))
    }

    /// Inline token wins over a token file
    pub fn credentials(&self) -> Credentials {
        match (&self.api_token, &self.api_token_file) {
            (Some(token), _) => Credentials::Token(token.clone()),
            (None, Some(path)) => Credentials::TokenFile(path.clone()),
            (None, None) => Credentials::Missing,
        }
    }

    /// Validate the static configuration and build the scaling policy
    pub fn scaling_policy(&self) -> Result<ScalingPolicy, ConfigError> {
        if self.interval_secs == 0 || self.tick_secs == 0 {
            return Err(ConfigError::InvalidInterval);
        }

        let lease_secs = self.lease().as_secs();
        let minimum_secs = self.minimum_lease_secs();
        if lease_secs <= minimum_secs {
            return Err(ConfigError::LeaseTooShort {
                lease_secs,
                minimum_secs,
            });
        }

        let instance_id = self.instance_id();
        let valid_id = !instance_id.is_empty()
            && instance_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid_id {
            return Err(ConfigError::InvalidInstanceId { value: instance_id });
        }

        let threshold = ThresholdConfig::new(self.threshold_percentage)?;
        let tiers = match &self.tier_table {
            Some(path) => TierTable::load(path)?,
            None => TierTable::default(),
        };

        Ok(ScalingPolicy::new(threshold, tiers))
    }
}
