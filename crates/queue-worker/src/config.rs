//! Worker configuration

use anyhow::{Context, Result};
use autoscaler_lib::{BrokerConfig, QueueSpec, WorkerConfig};
use serde::Deserialize;
use std::path::Path;

/// Environment variable prefix, e.g. `WORKER_WORKER__MAX_IDLE_SECONDS`
const ENV_PREFIX: &str = "WORKER";

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub broker: BrokerConfig,
    pub queue: QueueSpec,
    pub worker: WorkerConfig,

    /// Port for `/metrics` and `/healthz`; 0 disables the listener
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl WorkerSettings {
    /// Load from an optional config file overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read worker configuration")?
            .try_deserialize()
            .context("invalid worker configuration")?;

        settings.broker.uri().context("invalid broker settings")?;
        settings.queue.validate()?;
        settings.worker.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_file_with_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(
            br#"
            [broker]
            user = "worker"
            password = "secret"
            host = "rabbitmq"
            vhost = "jobsToDo"

            [queue]
            name = "test-queue"

            [worker]
            exchange = "test-exch"
            max_idle_seconds = 20
            "#,
        )
        .unwrap();

        let settings = WorkerSettings::load(Some(file.path())).unwrap();

        assert_eq!(settings.worker.max_idle_seconds, 20);
        assert_eq!(settings.metrics_port, 9090);
        assert_eq!(settings.worker.prefetch_count, 1);
        assert_eq!(settings.worker.routing_key, None);
        assert_eq!(settings.worker.shutdown_grace_secs, 30);
        assert_eq!(settings.queue, QueueSpec::durable("test-queue"));
    }

    #[test]
    fn test_missing_exchange_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(
            br#"
            [broker]
            user = "worker"
            password = "secret"
            host = "rabbitmq"

            [queue]
            name = "test-queue"

            [worker]
            exchange = ""
            "#,
        )
        .unwrap();

        let err = WorkerSettings::load(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("worker.exchange"));
    }
}
