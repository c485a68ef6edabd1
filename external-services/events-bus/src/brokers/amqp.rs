//! RabbitMQ binding of the broker traits, built on `lapin`.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    redact_uri, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, FaultCallback,
    InboundDelivery,
};
use crate::error::{EventBusError, Result};

const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ through an `amqp://` or `amqps://` URI.
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        debug!("Connecting to RabbitMQ at {}", self.describe());

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| EventBusError::Connection(e.to_string()))?;

        info!("Connected to RabbitMQ at {}", self.describe());
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }

    fn describe(&self) -> String {
        redact_uri(&self.uri)
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_fault(&self, callback: FaultCallback) {
        self.inner.on_error(move |err| callback(err.to_string()));
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await.map_err(map_lapin_error)?;
        // Publisher confirms, so a publish only succeeds once the broker has it
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "event bus shutdown")
            .await
            .map_err(map_lapin_error)
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.inner
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_lapin_error)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(map_lapin_error)?;
        let confirmation = confirm.await.map_err(map_lapin_error)?;
        check_confirmation(confirmation, routing_key)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| InboundDelivery {
                        delivery_tag: d.delivery_tag,
                        routing_key: d.routing_key.as_str().to_string(),
                        body: d.data,
                        redelivered: d.redelivered,
                    })
                    .map_err(map_lapin_error)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "channel closed")
            .await
            .map_err(map_lapin_error)
    }
}

/// A nacked publish is a channel error, so the bus retries it.
fn check_confirmation(confirmation: Confirmation, routing_key: &str) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => Err(EventBusError::Channel(format!(
            "broker rejected message for '{routing_key}'"
        ))),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

/// Transport-level failures are connection errors, everything else is
/// reported against the channel.
fn map_lapin_error(err: lapin::Error) -> EventBusError {
    match err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            EventBusError::Connection(err.to_string())
        }
        other => EventBusError::Channel(other.to_string()),
    }
}
