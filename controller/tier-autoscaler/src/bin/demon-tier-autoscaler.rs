//! Tier Autoscaler binary - ticks the single-instance scheduler on a fixed cadence

use std::sync::Arc;
use tier_autoscaler::{
    ClientFactory, Config, CycleOutcome, HttpClientFactory, InMemoryInstanceRegistry,
    InstanceRegistry, Metrics, NatsInstanceRegistry, ScalingWorker, SingleInstanceScheduler,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let config = Config::parse_config();

    // Initialize logging
    init_tracing(config.log_json);

    let policy = Arc::new(config.scaling_policy()?);
    let instance_id = config.instance_id();

    info!("Starting Demon Tier Autoscaler");
    info!("Configuration:");
    info!("  Resource: {}", config.resource_id);
    info!("  Instance id: {}", instance_id);
    info!("  Provider endpoint: {}", config.provider_endpoint);
    info!("  Metric: {}", config.metric_name);
    info!("  Threshold: {}%", policy.threshold.percentage());
    info!("  Tiers: {}", policy.tiers.tiers().len());
    info!("  Interval: {}s (tick {}s)", config.interval_secs, config.tick_secs);
    info!("  Dry-run: {}", config.dry_run);

    let metrics = Metrics;

    let clients: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(
        config.provider_endpoint.clone(),
        config.credentials(),
        config.request_timeout_secs,
        config.dry_run,
    ));

    let worker = Arc::new(ScalingWorker::new(
        config.resource_id.clone(),
        config.metric_name.clone(),
        policy,
        clients,
        metrics.clone(),
    ));

    let registry: Arc<dyn InstanceRegistry> = match &config.nats_url {
        Some(nats_url) => Arc::new(
            NatsInstanceRegistry::connect(
                nats_url,
                config.nats_creds_path.as_deref(),
                &config.registry_bucket,
                config.lease(),
            )
            .await?,
        ),
        None => {
            warn!("No NATS URL configured, instance registry is process-local");
            Arc::new(InMemoryInstanceRegistry::new(config.lease()))
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = SingleInstanceScheduler::new(
        instance_id,
        config.interval(),
        registry,
        worker,
        metrics,
        shutdown_rx,
    );

    if config.once {
        return match scheduler.run_once().await? {
            Some(CycleOutcome::Failed(e)) => {
                error!("Cycle failed: {}", e);
                Err(e.into())
            }
            Some(outcome) => {
                info!(outcome = outcome.label(), "Single cycle completed");
                Ok(())
            }
            None => {
                info!("Another instance is active, nothing to do");
                Ok(())
            }
        };
    }

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };
    scheduler
        .run_ticker(config.tick_interval(), shutdown_signal, &shutdown_tx)
        .await;

    info!("Tier autoscaler exited normally");
    Ok(())
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
