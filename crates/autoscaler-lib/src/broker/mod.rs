//! Message broker adapters
//!
//! The control logic only talks to the traits defined here:
//! - [`ChannelFactory`] / [`QueueChannel`] back the queue depth probe
//! - [`MessageConsumer`] / [`ConsumerSession`] back the worker runtime
//!
//! The `amqp` module implements them on top of `lapin`.

mod amqp;
mod consumer;
mod probe;

pub use amqp::{classify_lapin_error, AmqpChannelFactory, AmqpConsumer};
pub use consumer::{BindingSpec, ConsumerSession, Delivery, MessageConsumer};
pub use probe::{QueueDepthProbe, QueueDepthSource, PROBE_RETRY_DELAY};

use crate::config::QueueSpec;
use crate::error::BrokerError;

pub use async_trait::async_trait;

/// An open broker channel able to declare and inspect one queue
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Declare `spec`, returning the ready-message count.
    ///
    /// A passive declaration only inspects the queue and fails if it is
    /// missing; a non-passive one creates it when absent.
    async fn declare(&self, spec: &QueueSpec, passive: bool) -> Result<u64, BrokerError>;

    /// Whether the underlying channel is still usable
    fn is_open(&self) -> bool;
}

/// Opens channels to the broker
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    type Channel: QueueChannel;

    async fn open(&self) -> Result<Self::Channel, BrokerError>;
}
