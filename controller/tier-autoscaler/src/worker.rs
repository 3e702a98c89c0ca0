//! Scaling worker - one evaluation cycle against the managed resource
//!
//! A cycle reads the resource's tier and quota metric, asks the decision
//! engine whether the limit has been reached, and if so submits the next step
//! of the escalation policy. Every failure ends the cycle with
//! `CycleOutcome::Failed`; nothing is retried inside a cycle, the next
//! scheduled turn is the retry.

use crate::decision::{Decision, ScalingPolicy};
use crate::error::CycleError;
use crate::metrics::Metrics;
use crate::provider::{ClientFactory, ResourceDescription};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Terminal result of one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NoActionTaken {
        limit: u64,
        observed: f64,
    },
    Escalated {
        from: ResourceDescription,
        to: ResourceDescription,
        elapsed: Duration,
    },
    Failed(CycleError),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::NoActionTaken { .. } => "no_action",
            CycleOutcome::Escalated { .. } => "escalated",
            CycleOutcome::Failed(err) => err.kind(),
        }
    }
}

pub struct ScalingWorker {
    resource_id: String,
    metric_name: String,
    policy: Arc<ScalingPolicy>,
    clients: Arc<dyn ClientFactory>,
    metrics: Metrics,
}

impl ScalingWorker {
    pub fn new(
        resource_id: String,
        metric_name: String,
        policy: Arc<ScalingPolicy>,
        clients: Arc<dyn ClientFactory>,
        metrics: Metrics,
    ) -> Self {
        Self {
            resource_id,
            metric_name,
            policy,
            clients,
            metrics,
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Run one cycle; never returns an error, failures are part of the outcome
    pub async fn run_cycle(&self) -> CycleOutcome {
        let started = Instant::now();

        let outcome = match self.evaluate(started).await {
            Ok(outcome) => outcome,
            Err(err) => CycleOutcome::Failed(err),
        };

        self.report(&outcome);
        self.metrics.record_cycle(
            &self.resource_id,
            outcome.label(),
            started.elapsed().as_millis(),
        );
        outcome
    }

    async fn evaluate(&self, started: Instant) -> Result<CycleOutcome, CycleError> {
        let clients = self
            .clients
            .acquire()
            .await
            .map_err(|e| CycleError::ClientUnavailable {
                message: format!("{:#}", e),
            })?;

        let description = clients
            .metrics
            .get_description(&self.resource_id)
            .await
            .map_err(|e| CycleError::FetchError {
                message: format!("{:#}", e),
            })?;

        let quota = clients
            .metrics
            .get_metrics(&self.resource_id)
            .await
            .map_err(|e| CycleError::FetchError {
                message: format!("{:#}", e),
            })?;

        let observed = quota
            .iter()
            .find(|m| m.name == self.metric_name && m.current_value.is_finite())
            .map(|m| m.current_value)
            .ok_or_else(|| CycleError::MetricUnavailable {
                metric: self.metric_name.clone(),
                resource_id: self.resource_id.clone(),
            })?;

        debug!(
            resource_id = %self.resource_id,
            tier = %description.tier_name,
            capacity_units = description.capacity_units,
            metric = %self.metric_name,
            observed = observed,
            "Fetched resource state"
        );

        let limit = match self.policy.decide(&description, observed)? {
            Decision::NoAction { limit, observed } => {
                self.metrics
                    .update_utilization(&self.resource_id, observed, limit);
                return Ok(CycleOutcome::NoActionTaken { limit, observed });
            }
            Decision::Escalate { limit, observed } => {
                self.metrics
                    .update_utilization(&self.resource_id, observed, limit);
                limit
            }
        };

        let target = self.policy.next_tier(&description)?.ok_or_else(|| {
            CycleError::NoHigherTierAvailable {
                tier: description.tier_name.clone(),
                capacity: description.capacity_units,
            }
        })?;

        info!(
            resource_id = %self.resource_id,
            from = %description,
            to = %target,
            observed = observed,
            limit = limit,
            "Quota threshold reached, submitting escalation"
        );

        clients
            .provisioning
            .update(&self.resource_id, &target)
            .await
            .map_err(|e| CycleError::ProvisioningError {
                message: format!("{:#}", e),
            })?;

        Ok(CycleOutcome::Escalated {
            from: description,
            to: target,
            elapsed: started.elapsed(),
        })
    }

    fn report(&self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::NoActionTaken { limit, observed } => {
                info!(
                    resource_id = %self.resource_id,
                    observed = observed,
                    limit = limit,
                    "Below threshold, no action taken"
                );
            }
            CycleOutcome::Escalated { from, to, elapsed } => {
                info!(
                    resource_id = %self.resource_id,
                    from = %from,
                    to = %to,
                    elapsed_ms = elapsed.as_millis(),
                    "Resource escalated"
                );
            }
            CycleOutcome::Failed(err) if err.requires_operator() => {
                error!(
                    resource_id = %self.resource_id,
                    error_kind = err.kind(),
                    requires_operator = true,
                    error = %err,
                    "Cycle failed; condition recurs until configuration or tier changes"
                );
            }
            CycleOutcome::Failed(err) => {
                warn!(
                    resource_id = %self.resource_id,
                    error_kind = err.kind(),
                    requires_operator = false,
                    error = %err,
                    "Cycle failed; will retry on next turn"
                );
            }
        }
    }
}
