//! Queue worker
//!
//! Consumes one queue until it has been idle for too long or the pod is
//! asked to stop. Launched as a Kubernetes job by the queue autoscaler.

use anyhow::{Context, Result};
use autoscaler_lib::{
    broker::{AmqpConsumer, BindingSpec},
    NoopHandler, ShutdownOutcome, StructuredLogger, WorkerRuntime,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[derive(Parser)]
#[command(name = "queue-worker", version, about = "Consume a work queue until idle")]
struct Cli {
    /// Configuration file, overlaid with WORKER_* environment variables
    #[arg(short, long, env = "WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Name used as consumer tag and in logs; the pod name inside Kubernetes
    #[arg(long, env = "HOSTNAME", default_value = "queue-worker")]
    instance: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let settings = config::WorkerSettings::load(cli.config.as_deref())?;

    let consumer = AmqpConsumer::new(settings.broker.uri()?, cli.instance.clone());
    let binding = BindingSpec::new(&settings.worker, settings.queue.clone());
    let runtime = WorkerRuntime::new(
        Arc::new(consumer),
        Arc::new(NoopHandler::new(cli.instance.clone())),
        binding,
        settings.worker.clone(),
        StructuredLogger::new(cli.instance.clone()),
    );

    let metrics_handle = (settings.metrics_port != 0).then(|| {
        let state = api::AppState {
            phase: runtime.subscribe_phase(),
        };
        tokio::spawn(api::serve(settings.metrics_port, state))
    });

    let outcome = runtime.run(interrupted()).await.map_err(|e| {
        error!(error = %e, "Worker stopped on a fatal error");
        e
    });

    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    match outcome.context("worker failed")? {
        ShutdownOutcome::Graceful => {
            info!("Worker exited");
            Ok(())
        }
        // tasks that ignored cancellation may still be running
        ShutdownOutcome::Forced => std::process::exit(0),
    }
}

/// SIGINT, or SIGTERM from the kubelet
async fn interrupted() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
