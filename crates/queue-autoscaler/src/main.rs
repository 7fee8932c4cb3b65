//! Queue autoscaler
//!
//! Watches one work queue and launches worker jobs on Kubernetes when its
//! backlog grows. Workers remove themselves once they run out of work.

use anyhow::{Context, Result};
use autoscaler_lib::{
    broker::{AmqpChannelFactory, QueueDepthProbe},
    cluster::{JobTemplate, KubeJobLauncher},
    health::{components, HealthRegistry},
    ScalerMetrics, ScalingController, StructuredLogger,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "queue-autoscaler", version, about = "Scale worker jobs on queue depth")]
struct Cli {
    /// Configuration file, overlaid with AUTOSCALER_* environment variables
    #[arg(short, long, env = "AUTOSCALER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let settings = config::AutoscalerSettings::load(cli.config.as_deref())?;

    let logger = StructuredLogger::new(format!("autoscaler/{}", settings.scaling.worker_type));
    logger.log_autoscaler_startup(AUTOSCALER_VERSION, &settings.scaling.label_selector());

    let health_registry = HealthRegistry::new();
    health_registry.register(components::QUEUE_PROBE).await;
    health_registry.register(components::CLUSTER).await;
    health_registry.register(components::CONTROLLER).await;

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        ScalerMetrics::new(),
    ));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    let broker_uri = settings.broker.uri()?;
    let probe = QueueDepthProbe::new(AmqpChannelFactory::new(broker_uri), settings.queue.clone());
    if let Err(e) = probe.connect().await {
        error!(error = %e, "Broker rejected the queue probe");
        logger.log_autoscaler_shutdown("fatal broker error");
        return Err(e).context("queue probe could not connect");
    }

    let launcher = KubeJobLauncher::try_default(JobTemplate::from(&settings.scaling))
        .await
        .context("failed to create Kubernetes client")?;

    let controller = ScalingController::new(
        Arc::new(probe),
        Arc::new(launcher),
        settings.scaling.clone(),
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    shutdown_signal().await?;
    logger.log_autoscaler_shutdown("signal received");

    let _ = shutdown_tx.send(());
    controller_handle
        .await
        .context("scaling loop panicked")?;
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// SIGINT, or SIGTERM from the kubelet
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}
