//! AMQP 0.9.1 implementations of the broker traits, built on `lapin`

use super::{
    async_trait, BindingSpec, ChannelFactory, ConsumerSession, Delivery, MessageConsumer,
    QueueChannel,
};
use crate::config::QueueSpec;
use crate::error::BrokerError;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::io::ErrorKind;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

const CLOSE_REPLY_CODE: u16 = 200;

/// Map a `lapin` error onto the fatal/transient taxonomy.
///
/// Refused connections and refused credentials are fatal; everything else
/// may clear up on its own.
pub fn classify_lapin_error(err: lapin::Error) -> BrokerError {
    let fatal = match &err {
        lapin::Error::IOError(io) => matches!(
            io.kind(),
            ErrorKind::ConnectionRefused | ErrorKind::PermissionDenied
        ),
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
        ),
        _ => false,
    };

    if fatal {
        BrokerError::Fatal(err.to_string())
    } else {
        BrokerError::Transient(err.to_string())
    }
}

fn declare_options(spec: &QueueSpec, passive: bool) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive,
        durable: spec.durable,
        exclusive: spec.exclusive,
        auto_delete: spec.auto_delete,
        nowait: false,
    }
}

async fn open_connection(uri: &str) -> Result<(Connection, Channel), BrokerError> {
    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(classify_lapin_error)?;
    let channel = connection
        .create_channel()
        .await
        .map_err(classify_lapin_error)?;
    Ok((connection, channel))
}

/// Opens probe channels on a dedicated connection
pub struct AmqpChannelFactory {
    uri: String,
}

impl AmqpChannelFactory {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// Probe channel; owns its connection so both close together
pub struct AmqpQueueChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl ChannelFactory for AmqpChannelFactory {
    type Channel = AmqpQueueChannel;

    async fn open(&self) -> Result<AmqpQueueChannel, BrokerError> {
        let (connection, channel) = open_connection(&self.uri).await?;
        Ok(AmqpQueueChannel {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl QueueChannel for AmqpQueueChannel {
    async fn declare(&self, spec: &QueueSpec, passive: bool) -> Result<u64, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                &spec.name,
                declare_options(spec, passive),
                FieldTable::default(),
            )
            .await
            .map_err(classify_lapin_error)?;
        Ok(u64::from(queue.message_count()))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// Creates manual-ack consumer sessions
pub struct AmqpConsumer {
    uri: String,
    consumer_tag: String,
}

impl AmqpConsumer {
    pub fn new(uri: impl Into<String>, consumer_tag: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            consumer_tag: consumer_tag.into(),
        }
    }
}

#[async_trait]
impl MessageConsumer for AmqpConsumer {
    async fn connect(&self, binding: &BindingSpec) -> Result<Box<dyn ConsumerSession>, BrokerError> {
        let (connection, channel) = open_connection(&self.uri).await?;

        channel
            .basic_qos(binding.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(classify_lapin_error)?;
        channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify_lapin_error)?;
        channel
            .queue_declare(
                &binding.queue.name,
                declare_options(&binding.queue, false),
                FieldTable::default(),
            )
            .await
            .map_err(classify_lapin_error)?;
        channel
            .queue_bind(
                &binding.queue.name,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(classify_lapin_error)?;

        let consumer = channel
            .basic_consume(
                &binding.queue.name,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify_lapin_error)?;

        debug!(
            queue = %binding.queue.name,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Consumer registered"
        );

        Ok(Box::new(AmqpSession {
            connection,
            channel,
            consumer,
        }))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl ConsumerSession for AmqpSession {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let item = self.consumer.next().await?;
        Some(
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                body: delivery.data,
            })
            .map_err(classify_lapin_error),
        )
    }

    async fn acknowledge(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(classify_lapin_error)
    }

    async fn close(&mut self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(CLOSE_REPLY_CODE, "worker stopping").await {
                warn!(error = %e, "Error closing channel");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self
                .connection
                .close(CLOSE_REPLY_CODE, "worker stopping")
                .await
            {
                warn!(error = %e, "Error closing connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    #[test]
    fn test_refused_connection_is_fatal() {
        let err = lapin::Error::IOError(Arc::new(io::Error::from(ErrorKind::ConnectionRefused)));
        assert!(classify_lapin_error(err).is_fatal());
    }

    #[test]
    fn test_reset_connection_is_transient() {
        let err = lapin::Error::IOError(Arc::new(io::Error::from(ErrorKind::ConnectionReset)));
        assert!(!classify_lapin_error(err).is_fatal());
    }

    #[test]
    fn test_declare_options_follow_queue_spec() {
        let spec = QueueSpec {
            name: "test-queue".to_string(),
            durable: true,
            exclusive: false,
            auto_delete: true,
        };

        let options = declare_options(&spec, true);
        assert!(options.passive);
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(options.auto_delete);
        assert!(!declare_options(&spec, false).passive);
    }
}
