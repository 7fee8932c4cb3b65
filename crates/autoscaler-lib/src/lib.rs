//! Queue-driven worker autoscaling library
//!
//! This crate provides the core functionality for:
//! - Queue depth probing against an AMQP broker
//! - Counting and launching worker jobs on Kubernetes
//! - The scaling decision loop
//! - The worker lifecycle runtime (consume, reconnect, idle exit)
//! - Health checks and observability

pub mod broker;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod worker;

pub use config::{BrokerConfig, QueueSpec, ScalingConfig, WorkerConfig};
pub use controller::{
    decide, CycleReport, DecisionInput, ScaleDecision, ScaleReason, ScalingController,
    STARTUP_IDLE_CREDIT,
};
pub use error::{BrokerError, ClusterError, ConfigError, WorkerError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ScalerMetrics, StructuredLogger, WorkerMetrics};
pub use worker::{
    ActivityTracker, MessageHandler, NoopHandler, ReconnectBackoff, ShutdownOutcome, WorkerRuntime,
};
