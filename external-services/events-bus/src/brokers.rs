// Broker abstraction (RabbitMQ via lapin, in-memory)
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::InMemoryBroker;

/// Called once when the broker drops a connection.
pub type FaultCallback = Box<dyn Fn(String) + Send + Sync>;

/// Deliveries of a consumer. An `Err` item, or the end of the stream while
/// the consumer is still wanted, means the channel faulted.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

/// A message handed to a consumer, awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

/// Opens physical connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// One connection attempt, no retries.
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// Endpoint description safe for logs.
    fn describe(&self) -> String;
}

/// A single connection that multiplexes lightweight channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    fn on_fault(&self, callback: FaultCallback);

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Durable exchange of type direct; idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Durable, non-exclusive, non-auto-delete queue; idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Persistent JSON message.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Acknowledges a single delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Strips credentials from a broker URI.
pub fn redact_uri(uri: &str) -> String {
    match uri.split_once("://") {
        Some((scheme, rest)) => match rest.rsplit_once('@') {
            Some((_, host)) => format!("{scheme}://***@{host}"),
            None => uri.to_string(),
        },
        None => uri.to_string(),
    }
}
