//! Error types shared across the autoscaler components

use thiserror::Error;

/// Errors raised while talking to the message broker
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker rejected us outright (bad credentials, refused connection).
    /// Retrying with the same configuration cannot succeed.
    #[error("fatal broker error: {0}")]
    Fatal(String),
    /// Any other connectivity or channel failure
    #[error("transient broker error: {0}")]
    Transient(String),
}

impl BrokerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

/// Errors raised by the orchestrator API
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to list workers for selector '{selector}': {source}")]
    List {
        selector: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to create job '{name}': {source}")]
    Create {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("failed to build kubernetes client: {0}")]
    Client(#[from] kube::Error),
}

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be at least {min}")]
    TooSmall { field: &'static str, min: u64 },
    #[error("invalid broker address: {0}")]
    BrokerAddress(String),
}

/// Errors that end a worker process with a failure status
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
