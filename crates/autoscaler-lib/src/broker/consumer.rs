//! Message consumer interface used by the worker runtime

use super::async_trait;
use crate::config::{QueueSpec, WorkerConfig};
use crate::error::BrokerError;

/// Where and how a worker consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: QueueSpec,
    pub routing_key: String,
    pub prefetch_count: u16,
}

impl BindingSpec {
    pub fn new(config: &WorkerConfig, queue: QueueSpec) -> Self {
        let routing_key = config
            .routing_key
            .clone()
            .unwrap_or_else(|| queue.name.clone());

        Self {
            exchange: config.exchange.clone(),
            queue,
            routing_key,
            prefetch_count: config.prefetch_count,
        }
    }
}

/// One message handed to the worker, not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

/// Connects consumer sessions to the broker
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Open a connection, declare the binding and start a manual-ack consumer
    async fn connect(&self, binding: &BindingSpec) -> Result<Box<dyn ConsumerSession>, BrokerError>;
}

/// A live consumer session
#[async_trait]
pub trait ConsumerSession: Send {
    /// Wait for the next delivery.
    ///
    /// Returns `None` once the channel or connection is gone. Must be
    /// cancel-safe: dropping the future never loses a delivery.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Release the channel and connection
    async fn close(&mut self);
}
