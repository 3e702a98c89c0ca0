//! Metrics for the tier autoscaler
//!
//! Log-based, same as the scale hint handler: every counter is a structured
//! `tracing` event so it can be scraped from the log pipeline.

use tracing::info;

/// Metrics collector for the tier autoscaler
#[derive(Clone, Debug, Default)]
pub struct Metrics;

impl Metrics {
    /// Record an external tick and whether it started a new instance
    pub fn record_tick(&self, instance_id: &str, started: bool) {
        info!(
            instance_id = %instance_id,
            started = started,
            "Recorded scheduler tick"
        );
    }

    /// Record the terminal outcome of a cycle
    pub fn record_cycle(&self, resource_id: &str, outcome: &str, elapsed_ms: u128) {
        info!(
            resource_id = %resource_id,
            outcome = %outcome,
            elapsed_ms = elapsed_ms,
            "Recorded cycle outcome"
        );
    }

    /// Record the utilization observed during a cycle
    pub fn update_utilization(&self, resource_id: &str, observed: f64, limit: u64) {
        info!(
            resource_id = %resource_id,
            observed = observed,
            limit = limit,
            "Updated utilization gauge"
        );
    }

    /// Record an armed continuation
    pub fn record_continuation(&self, instance_id: &str, turn: u64) {
        info!(
            instance_id = %instance_id,
            turn = turn,
            "Recorded continuation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics;
        metrics.record_tick("tier-autoscaler.hub-1", true);
        metrics.record_cycle("hub-1", "no_action", 12);
        metrics.update_utilization("hub-1", 79.0, 80);
        metrics.record_continuation("tier-autoscaler.hub-1", 2);
    }
}
