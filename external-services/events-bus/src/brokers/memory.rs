//! In-process broker with AMQP-like routing.
//!
//! Useful for:
//! - Unit and integration testing without a running RabbitMQ
//! - Local development through the `memory://` connection string
//!
//! Exchanges route by exact routing key to bound queues. Queues keep ready
//! and unacknowledged messages apart; messages a closed consumer channel
//! never acknowledged go back to the front of the queue flagged as
//! redelivered. Failure injection (`fail_next_connects`,
//! `fail_next_publishes`, `fault_consumers`, `drop_connections`) lets tests
//! drive the retry and recovery paths.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, FaultCallback,
    InboundDelivery,
};
use crate::error::{EventBusError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    channel_id: u64,
    tag: String,
    sender: mpsc::UnboundedSender<Result<InboundDelivery>>,
}

#[derive(Default)]
struct QueueState {
    bindings: BTreeSet<(String, String)>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, (u64, StoredMessage)>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    acked: u64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    closed_channels: HashSet<u64>,
    connections: Vec<Weak<MemoryConnection>>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    connect_attempts: u32,
    publish_attempts: u32,
    failing_connects: u32,
    failing_publishes: u32,
}

impl BrokerState {
    fn queue_mut(&mut self, queue: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| EventBusError::Channel(format!("no queue '{queue}'")))
    }

    /// Hands ready messages of `queue` to its consumers, round robin.
    fn dispatch(&mut self, queue: &str) {
        let Some(q) = self.queues.get_mut(queue) else {
            return;
        };

        while !q.consumers.is_empty() {
            let Some(message) = q.ready.pop_front() else {
                break;
            };
            let index = q.next_consumer % q.consumers.len();
            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let delivery = InboundDelivery {
                delivery_tag: tag,
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
                redelivered: message.redelivered,
            };

            let Some(consumer) = q.consumers.get(index) else {
                q.ready.push_front(message);
                break;
            };
            if consumer.sender.send(Ok(delivery)).is_ok() {
                q.unacked.insert(tag, (consumer.channel_id, message));
                q.next_consumer = index + 1;
            } else {
                // Receiver went away without closing the channel
                q.consumers.remove(index);
                q.ready.push_front(message);
            }
        }
    }

    /// Detaches every consumer of `channel_id` and requeues what it held.
    fn release_channel(&mut self, channel_id: u64, fault: Option<&str>) {
        let mut touched = Vec::new();
        for (name, q) in &mut self.queues {
            let before = q.consumers.len();
            q.consumers.retain(|c| {
                if c.channel_id != channel_id {
                    return true;
                }
                if let Some(reason) = fault {
                    let _ = c
                        .sender
                        .send(Err(EventBusError::Channel(reason.to_string())));
                }
                debug!(consumer_tag = %c.tag, "Consumer cancelled");
                false
            });

            let mut returned: Vec<(u64, StoredMessage)> = q
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == channel_id)
                .map(|(tag, (_, message))| (*tag, message.clone()))
                .collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (tag, _) in &returned {
                q.unacked.remove(tag);
            }
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                q.ready.push_front(message);
            }

            if before != q.consumers.len() || !q.ready.is_empty() {
                touched.push(name.clone());
            }
        }
        self.closed_channels.insert(channel_id);
        for name in touched {
            self.dispatch(&name);
        }
    }
}

/// AMQP-flavoured broker living inside the process.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` connection attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().failing_connects = n;
    }

    /// The next `n` publishes fail with a connection error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().failing_publishes = n;
    }

    /// Faults every channel that currently has a consumer, the way a broker
    /// closes a channel after a failed operation.
    pub fn fault_consumers(&self) {
        let mut state = self.state.lock();
        let channels: BTreeSet<u64> = state
            .queues
            .values()
            .flat_map(|q| q.consumers.iter().map(|c| c.channel_id))
            .collect();
        for channel_id in channels {
            state.release_channel(channel_id, Some("channel closed by broker"));
        }
    }

    /// Closes every open connection as if the network dropped.
    pub fn drop_connections(&self) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut state = self.state.lock();
            let live: Vec<Arc<MemoryConnection>> =
                state.connections.iter().filter_map(Weak::upgrade).collect();
            state.connections.clear();
            live
        };
        for connection in connections {
            connection.fail("connection reset by broker");
        }
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.state.lock().publish_attempts
    }

    pub fn exchange_exists(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains(exchange)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Ready plus unacknowledged messages.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len() + q.unacked.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn acked_count(&self, queue: &str) -> u64 {
        self.state.lock().queues.get(queue).map_or(0, |q| q.acked)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Routing keys bound to `queue`, sorted.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.state.lock().queues.get(queue).map_or_else(Vec::new, |q| {
            q.bindings.iter().map(|(_, key)| key.clone()).collect()
        })
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(EventBusError::Connection("broker unreachable".into()));
        }

        let connection = Arc::new(MemoryConnection {
            broker: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
            fault_callbacks: Mutex::new(Vec::new()),
        });
        state.connections.push(Arc::downgrade(&connection));
        Ok(connection)
    }

    fn describe(&self) -> String {
        "memory://in-process".to_string()
    }
}

pub struct MemoryConnection {
    broker: InMemoryBroker,
    open: Arc<AtomicBool>,
    fault_callbacks: Mutex<Vec<FaultCallback>>,
}

impl MemoryConnection {
    fn fail(&self, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.fault_callbacks.lock());
        for callback in callbacks {
            callback(reason.to_string());
        }
        self.broker.fault_consumers();
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_fault(&self, callback: FaultCallback) {
        self.fault_callbacks.lock().push(callback);
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(EventBusError::Connection("connection is closed".into()));
        }
        let id = {
            let mut state = self.broker.state.lock();
            state.next_channel_id += 1;
            state.next_channel_id
        };
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.fault_callbacks.lock().clear();
        Ok(())
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    connection_open: Arc<AtomicBool>,
    id: u64,
}

impl MemoryChannel {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.broker.state.lock();
        if !self.connection_open.load(Ordering::SeqCst) {
            return Err(EventBusError::Connection("connection is closed".into()));
        }
        if state.closed_channels.contains(&self.id) {
            return Err(EventBusError::Channel(format!("channel {} is closed", self.id)));
        }
        f(&mut state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.connection_open.load(Ordering::SeqCst)
            && !self.broker.state.lock().closed_channels.contains(&self.id)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.with_state(|state| {
            state.exchanges.insert(exchange.to_string());
            Ok(())
        })
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.with_state(|state| {
            state.queues.entry(queue.to_string()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_state(|state| {
            if !state.exchanges.contains(exchange) {
                return Err(EventBusError::Channel(format!("no exchange '{exchange}'")));
            }
            state
                .queue_mut(queue)?
                .bindings
                .insert((exchange.to_string(), routing_key.to_string()));
            Ok(())
        })
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.with_state(|state| {
            state
                .queue_mut(queue)?
                .bindings
                .remove(&(exchange.to_string(), routing_key.to_string()));
            Ok(())
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.with_state(|state| {
            state.publish_attempts += 1;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(EventBusError::Connection("broker unreachable".into()));
            }
            if !state.exchanges.contains(exchange) {
                return Err(EventBusError::Channel(format!("no exchange '{exchange}'")));
            }

            let key = (exchange.to_string(), routing_key.to_string());
            let targets: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.bindings.contains(&key))
                .map(|(name, _)| name.clone())
                .collect();

            for name in targets {
                if let Some(q) = state.queues.get_mut(&name) {
                    q.ready.push_back(StoredMessage {
                        routing_key: routing_key.to_string(),
                        body: body.to_vec(),
                        redelivered: false,
                    });
                }
                state.dispatch(&name);
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.with_state(|state| {
            state.queue_mut(queue)?.consumers.push(ConsumerSlot {
                channel_id: self.id,
                tag: consumer_tag.to_string(),
                sender,
            });
            state.dispatch(queue);
            Ok(())
        })?;
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.with_state(|state| {
            for q in state.queues.values_mut() {
                if let Some((owner, _)) = q.unacked.get(&delivery_tag) {
                    if *owner != self.id {
                        break;
                    }
                    q.unacked.remove(&delivery_tag);
                    q.acked += 1;
                    return Ok(());
                }
            }
            Err(EventBusError::Channel(format!(
                "unknown delivery tag {delivery_tag}"
            )))
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock();
        if !state.closed_channels.contains(&self.id) {
            state.release_channel(self.id, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(stream: &mut DeliveryStream) -> Result<InboundDelivery> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery timed out")
            .expect("stream ended")
    }

    async fn setup(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        channel.declare_exchange("wms_event_bus").await.unwrap();
        channel.declare_queue("picking_service").await.unwrap();
        channel
            .bind_queue("picking_service", "wms_event_bus", "StockAdjusted")
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_routes_by_exact_key() {
        let broker = InMemoryBroker::new();
        let channel = setup(&broker).await;

        channel.publish("wms_event_bus", "StockAdjusted", b"{}").await.unwrap();
        channel.publish("wms_event_bus", "OrderPacked", b"{}").await.unwrap();

        assert_eq!(broker.queue_depth("picking_service"), 1);
        assert_eq!(broker.bindings("picking_service"), vec!["StockAdjusted"]);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        let err = channel.publish("nowhere", "StockAdjusted", b"{}").await.unwrap_err();
        assert!(matches!(err, EventBusError::Channel(_)));
    }

    #[tokio::test]
    async fn test_consume_and_ack() {
        let broker = InMemoryBroker::new();
        let channel = setup(&broker).await;
        channel.publish("wms_event_bus", "StockAdjusted", b"{\"a\":1}").await.unwrap();

        let mut stream = channel.consume("picking_service", "test").await.unwrap();
        let delivery = next(&mut stream).await.unwrap();
        assert_eq!(delivery.routing_key, "StockAdjusted");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("picking_service"), 1);

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.acked_count("picking_service"), 1);
        assert_eq!(broker.queue_depth("picking_service"), 0);
        assert!(channel.ack(delivery.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_after_channel_close() {
        let broker = InMemoryBroker::new();
        let channel = setup(&broker).await;
        channel.publish("wms_event_bus", "StockAdjusted", b"{}").await.unwrap();

        let consumer = broker.connect().await.unwrap().create_channel().await.unwrap();
        let mut stream = consumer.consume("picking_service", "first").await.unwrap();
        next(&mut stream).await.unwrap();
        consumer.close().await.unwrap();
        assert!(!consumer.is_open());
        assert_eq!(broker.consumer_count("picking_service"), 0);

        let mut again = channel.consume("picking_service", "second").await.unwrap();
        let delivery = next(&mut again).await.unwrap();
        assert!(delivery.redelivered);
    }

    #[tokio::test]
    async fn test_fault_consumers_errors_stream() {
        let broker = InMemoryBroker::new();
        let channel = setup(&broker).await;
        let mut stream = channel.consume("picking_service", "test").await.unwrap();

        broker.fault_consumers();

        assert!(matches!(next(&mut stream).await, Err(EventBusError::Channel(_))));
        assert!(!channel.is_open());
        assert_eq!(broker.consumer_count("picking_service"), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(1);
        assert!(matches!(broker.connect().await, Err(EventBusError::Connection(_))));
        assert_eq!(broker.connect_attempts(), 1);

        let channel = setup(&broker).await;
        broker.fail_next_publishes(1);
        assert!(channel.publish("wms_event_bus", "StockAdjusted", b"{}").await.is_err());
        assert!(channel.publish("wms_event_bus", "StockAdjusted", b"{}").await.is_ok());
        assert_eq!(broker.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_drop_connections_fires_fault_callbacks() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        connection.on_fault(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        broker.drop_connections();

        assert!(fired.load(Ordering::SeqCst));
        assert!(!connection.is_open());
        assert!(matches!(
            connection.create_channel().await,
            Err(EventBusError::Connection(_))
        ));
    }
}
