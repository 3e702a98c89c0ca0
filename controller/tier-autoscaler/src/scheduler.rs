//! Single-instance scheduler
//!
//! External ticks call `on_tick`. A tick is a no-op while the fixed loop
//! identity has an active record in the registry; otherwise it claims the
//! identity and spawns a driver for the first turn.
//!
//! Each turn first confirms it still owns the identity, then runs one worker
//! cycle, computes `now + interval`, records the continuation in the registry,
//! waits, and hands off to the continuation.
//! A turn carries nothing but the identity record, so the driver's state stays
//! constant no matter how long the loop lives. Turns are strictly sequential:
//! the next turn is only produced after the previous cycle has resolved and its
//! continuation has been recorded.

use crate::metrics::Metrics;
use crate::registry::{InstanceRecord, InstanceRegistry};
use crate::worker::{CycleOutcome, ScalingWorker};
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Result of an external tick
#[derive(Debug)]
pub enum TickOutcome {
    /// A new instance was started; the handle resolves when it stops
    Started(JoinHandle<()>),
    /// An instance with the fixed identity is already active
    AlreadyActive,
}

/// One turn of the loop; consumed by `execute`, which yields the continuation
#[derive(Debug)]
pub struct InstanceTurn {
    record: InstanceRecord,
}

impl InstanceTurn {
    pub fn record(&self) -> &InstanceRecord {
        &self.record
    }
}

#[derive(Clone)]
pub struct SingleInstanceScheduler {
    instance_id: String,
    interval: Duration,
    registry: Arc<dyn InstanceRegistry>,
    worker: Arc<ScalingWorker>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
}

impl SingleInstanceScheduler {
    pub fn new(
        instance_id: String,
        interval: Duration,
        registry: Arc<dyn InstanceRegistry>,
        worker: Arc<ScalingWorker>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            instance_id,
            interval,
            registry,
            worker,
            metrics,
            shutdown,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Handle an external tick
    pub async fn on_tick(&self) -> Result<TickOutcome> {
        let Some(turn) = self.claim().await? else {
            self.metrics.record_tick(&self.instance_id, false);
            return Ok(TickOutcome::AlreadyActive);
        };

        self.metrics.record_tick(&self.instance_id, true);
        info!(
            instance_id = %self.instance_id,
            owner = %turn.record.owner,
            "Starting new control loop instance"
        );

        let scheduler = self.clone();
        Ok(TickOutcome::Started(tokio::spawn(async move {
            scheduler.drive(turn).await;
        })))
    }

    /// Tick on a fixed cadence until `shutdown_signal` resolves, then stop the
    /// active instance at its next idle point and wait for it.
    pub async fn run_ticker<F>(
        &self,
        tick_interval: Duration,
        shutdown_signal: F,
        shutdown_tx: &watch::Sender<bool>,
    ) where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Polled across iterations so a signal during `on_tick` is not dropped
        tokio::pin!(shutdown_signal);
        let mut active: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.on_tick().await {
                    Ok(TickOutcome::Started(handle)) => active = Some(handle),
                    Ok(TickOutcome::AlreadyActive) => {}
                    Err(e) => error!(
                        instance_id = %self.instance_id,
                        error = %format!("{:#}", e),
                        "Scheduler tick failed"
                    ),
                },
                _ = &mut shutdown_signal => {
                    info!(instance_id = %self.instance_id, "Received shutdown signal");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        if let Some(handle) = active {
            if let Err(e) = handle.await {
                error!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Control loop instance ended abnormally"
                );
            }
        }
    }

    /// Claim the identity and run a single turn without arming a continuation.
    /// Returns `None` when another instance is active.
    pub async fn run_once(&self) -> Result<Option<CycleOutcome>> {
        let Some(turn) = self.claim().await? else {
            self.metrics.record_tick(&self.instance_id, false);
            return Ok(None);
        };

        self.metrics.record_tick(&self.instance_id, true);
        let outcome = self.run_cycle_isolated().await;
        self.release(&turn.record).await;
        Ok(Some(outcome))
    }

    async fn claim(&self) -> Result<Option<InstanceTurn>> {
        if let Some(active) = self.registry.get(&self.instance_id).await? {
            info!(
                instance_id = %self.instance_id,
                turn = active.turn,
                next_wake_at = ?active.next_wake_at,
                "Instance already active, tick is a no-op"
            );
            return Ok(None);
        }

        let record = InstanceRecord::first_turn(&self.instance_id, Utc::now());
        if !self.registry.try_claim(&record).await? {
            info!(
                instance_id = %self.instance_id,
                "Lost race to claim instance, tick is a no-op"
            );
            return Ok(None);
        }

        Ok(Some(InstanceTurn { record }))
    }

    /// Feed continuations until one is not produced
    async fn drive(self, first: InstanceTurn) {
        let mut next = Some(first);
        while let Some(turn) = next.take() {
            next = self.execute(turn).await;
        }
        info!(instance_id = %self.instance_id, "Control loop instance stopped");
    }

    /// Run one turn and return its continuation, if the loop should go on
    pub async fn execute(&self, turn: InstanceTurn) -> Option<InstanceTurn> {
        debug!(
            instance_id = %self.instance_id,
            turn = turn.record.turn,
            "Running turn"
        );

        // A turn whose lease lapsed while it slept may have been superseded
        if !self.hold(&turn.record, "start turn").await {
            return None;
        }

        self.run_cycle_isolated().await;

        let now = Utc::now();
        let wake_at = chrono::Duration::from_std(self.interval)
            .ok()
            .and_then(|interval| now.checked_add_signed(interval))
            .unwrap_or(now);
        let continuation = turn.record.continuation(wake_at);

        if !self.hold(&continuation, "record continuation").await {
            return None;
        }

        self.metrics
            .record_continuation(&self.instance_id, continuation.turn);
        info!(
            instance_id = %self.instance_id,
            turn = continuation.turn,
            next_wake_at = ?continuation.next_wake_at,
            "Continuation armed"
        );

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.interval) => Some(InstanceTurn { record: continuation }),
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(instance_id = %self.instance_id, "Shutdown requested during idle wait");
                self.release(&continuation).await;
                None
            }
        }
    }

    /// Run the worker cycle on its own task so a panic cannot take the loop down
    async fn run_cycle_isolated(&self) -> CycleOutcome {
        let worker = self.worker.clone();
        match tokio::spawn(async move { worker.run_cycle().await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    instance_id = %self.instance_id,
                    error = %e,
                    "Cycle task aborted"
                );
                CycleOutcome::Failed(crate::error::CycleError::FetchError {
                    message: format!("cycle task aborted: {}", e),
                })
            }
        }
    }

    /// Renew `record` in the registry; `false` means the turn must not proceed
    async fn hold(&self, record: &InstanceRecord, stage: &str) -> bool {
        match self.registry.renew(record).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    instance_id = %self.instance_id,
                    turn = record.turn,
                    stage = stage,
                    "Instance record no longer held by this owner, stopping"
                );
                false
            }
            Err(e) => {
                error!(
                    instance_id = %self.instance_id,
                    turn = record.turn,
                    stage = stage,
                    error = %e,
                    "Failed to renew instance record, releasing instance"
                );
                self.release(record).await;
                false
            }
        }
    }

    async fn release(&self, record: &InstanceRecord) {
        if let Err(e) = self.registry.release(record).await {
            warn!(
                instance_id = %self.instance_id,
                error = %e,
                "Failed to release instance record; it will expire with its lease"
            );
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Sender gone: no shutdown can ever arrive
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{ScalingPolicy, ThresholdConfig};
    use crate::provider::{
        FixedClients, MetricsProvider, ProvisioningProvider, QuotaMetric, ResourceDescription,
    };
    use crate::registry::InMemoryInstanceRegistry;
    use crate::tiers::TierTable;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResource {
        calls: AtomicUsize,
        panic_on_first: bool,
    }

    #[async_trait]
    impl MetricsProvider for CountingResource {
        async fn get_description(&self, _resource_id: &str) -> Result<ResourceDescription> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_first && call == 0 {
                panic!("provider exploded");
            }
            Ok(ResourceDescription::new("S1", 1))
        }

        async fn get_metrics(&self, _resource_id: &str) -> Result<Vec<QuotaMetric>> {
            Ok(vec![QuotaMetric {
                name: "TotalMessages".to_string(),
                current_value: 10.0,
                max_value: None,
            }])
        }
    }

    struct NeverCalled;

    #[async_trait]
    impl ProvisioningProvider for NeverCalled {
        async fn update(&self, _resource_id: &str, _target: &ResourceDescription) -> Result<()> {
            panic!("below-threshold loop must not provision");
        }
    }

    fn scheduler(
        resource: Arc<CountingResource>,
        registry: Arc<InMemoryInstanceRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> SingleInstanceScheduler {
        let policy = ScalingPolicy::new(ThresholdConfig::new(90.0).unwrap(), TierTable::default());
        let worker = ScalingWorker::new(
            "hub-1".to_string(),
            "TotalMessages".to_string(),
            Arc::new(policy),
            Arc::new(FixedClients::new(resource, Arc::new(NeverCalled))),
            Metrics,
        );
        SingleInstanceScheduler::new(
            "tier-autoscaler.hub-1".to_string(),
            Duration::from_secs(60),
            registry,
            Arc::new(worker),
            Metrics,
            shutdown,
        )
    }

    fn counting(panic_on_first: bool) -> Arc<CountingResource> {
        Arc::new(CountingResource {
            calls: AtomicUsize::new(0),
            panic_on_first,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_tick_is_noop_while_active() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry, rx);

        assert!(matches!(
            scheduler.on_tick().await.unwrap(),
            TickOutcome::Started(_)
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(matches!(
            scheduler.on_tick().await.unwrap(),
            TickOutcome::AlreadyActive
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(resource.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_runs_after_interval() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        scheduler.on_tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(resource.calls.load(Ordering::SeqCst), 2);
        let record = registry.get("tier-autoscaler.hub-1").await.unwrap().unwrap();
        assert_eq!(record.turn, 3);
        assert!(record.next_wake_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_cycle_still_arms_continuation() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(true);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        scheduler.on_tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(registry.get("tier-autoscaler.hub-1").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(resource.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_identity() {
        let (tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        let handle = match scheduler.on_tick().await.unwrap() {
            TickOutcome::Started(handle) => handle,
            TickOutcome::AlreadyActive => panic!("expected a fresh instance"),
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(registry.get("tier-autoscaler.hub-1").await.unwrap().is_none());
        assert!(matches!(
            scheduler.on_tick().await.unwrap(),
            TickOutcome::Started(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_respects_active_instance() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        let outcome = scheduler.run_once().await.unwrap();
        assert!(matches!(outcome, Some(CycleOutcome::NoActionTaken { .. })));
        assert!(registry.get("tier-autoscaler.hub-1").await.unwrap().is_none());

        scheduler.on_tick().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.run_once().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_ownership_stops_instance() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        let stale = InstanceTurn {
            record: InstanceRecord::first_turn("tier-autoscaler.hub-1", Utc::now()),
        };
        let usurper = InstanceRecord::first_turn("tier-autoscaler.hub-1", Utc::now());
        assert!(registry.try_claim(&usurper).await.unwrap());

        assert!(scheduler.execute(stale).await.is_none());
        assert_eq!(resource.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            registry.get("tier-autoscaler.hub-1").await.unwrap(),
            Some(usurper)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_never_yields_overlapping_cycles() {
        let (_tx, rx) = watch::channel(false);
        let resource = counting(false);
        // Lease shorter than the interval: the first instance loses it while idle
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(30)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        let first = match scheduler.on_tick().await.unwrap() {
            TickOutcome::Started(handle) => handle,
            TickOutcome::AlreadyActive => panic!("expected a fresh instance"),
        };
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(resource.calls.load(Ordering::SeqCst), 1);

        assert!(matches!(
            scheduler.on_tick().await.unwrap(),
            TickOutcome::Started(_)
        ));
        tokio::time::sleep(Duration::from_secs(34)).await;

        // The superseded instance woke at t=60 and stopped without a cycle
        assert!(first.is_finished());
        assert_eq!(resource.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_on_shutdown_signal() {
        let (tx, rx) = watch::channel(false);
        let resource = counting(false);
        let registry = Arc::new(InMemoryInstanceRegistry::new(Duration::from_secs(180)));
        let scheduler = scheduler(resource.clone(), registry.clone(), rx);

        // Ticks every 30s; the signal lands between ticks at t=90
        scheduler
            .run_ticker(
                Duration::from_secs(30),
                tokio::time::sleep(Duration::from_secs(90)),
                &tx,
            )
            .await;

        assert_eq!(resource.calls.load(Ordering::SeqCst), 2);
        assert!(registry.get("tier-autoscaler.hub-1").await.unwrap().is_none());
    }
}
