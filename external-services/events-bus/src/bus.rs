//! The event bus: publishing, subscriptions and the consume loop.

use futures::FutureExt;
use futures::StreamExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::brokers::{
    AmqpConnector, BrokerChannel, BrokerConnector, DeliveryStream, InMemoryBroker,
    InboundDelivery,
};
use crate::config::EventBusConfig;
use crate::connection::PersistentConnection;
use crate::error::{EventBusError, Result};
use crate::event::IntegrationEvent;
use crate::handlers::{HandlerDescriptor, HandlerScope, IntegrationEventHandler};
use crate::retry::RetryPolicy;
use crate::subscriptions::SubscriptionRegistry;

enum ConsumerState {
    Idle,
    Consuming {
        channel: Arc<dyn BrokerChannel>,
        task: JoinHandle<()>,
        generation: u64,
    },
}

struct BusInner {
    connection: Arc<PersistentConnection>,
    registry: Arc<SubscriptionRegistry>,
    config: EventBusConfig,
    retry: RetryPolicy,
    consumer: Mutex<ConsumerState>,
    removals: Mutex<broadcast::Receiver<String>>,
    // Identifies the live consume task; bumped whenever consuming stops
    generation: AtomicU64,
}

/// Publishes integration events and dispatches inbound ones to handlers.
///
/// Cloning is cheap and every clone drives the same connection, registry
/// and consumer channel.
///
/// Consumer side state machine: no consumer until the first subscription,
/// then one consume task whose channel is rebuilt after broker faults,
/// and back to no consumer once the last subscription is removed.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Builds a bus whose broker binding is picked by the URI scheme of the
    /// connection string.
    pub fn from_config(config: EventBusConfig) -> Result<Self> {
        config.validate()?;
        let connector: Arc<dyn BrokerConnector> = match config.scheme().as_deref() {
            Some("amqp" | "amqps") => {
                Arc::new(AmqpConnector::new(config.connection_string.clone()))
            }
            Some("memory") => Arc::new(InMemoryBroker::new()),
            _ => {
                return Err(EventBusError::Config(format!(
                    "unsupported broker URI '{}'",
                    crate::brokers::redact_uri(&config.connection_string)
                )))
            }
        };
        Self::with_connector(connector, config)
    }

    /// Builds a bus over an explicit broker connector.
    pub fn with_connector(
        connector: Arc<dyn BrokerConnector>,
        config: EventBusConfig,
    ) -> Result<Self> {
        config.validate()?;
        let connection = Arc::new(PersistentConnection::new(
            connector,
            RetryPolicy::from_config(&config),
        ));
        Ok(Self::new(
            connection,
            Arc::new(SubscriptionRegistry::new()),
            config,
        ))
    }

    pub fn new(
        connection: Arc<PersistentConnection>,
        registry: Arc<SubscriptionRegistry>,
        config: EventBusConfig,
    ) -> Self {
        let removals = registry.subscribe_removals();
        Self {
            inner: Arc::new(BusInner {
                connection,
                registry,
                retry: RetryPolicy::from_config(&config),
                config,
                consumer: Mutex::new(ConsumerState::Idle),
                removals: Mutex::new(removals),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.inner.connection
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// True while a consume task owns an open consumer channel.
    pub async fn is_consuming(&self) -> bool {
        matches!(
            &*self.inner.consumer.lock().await,
            ConsumerState::Consuming { channel, .. } if channel.is_open()
        )
    }

    /// Publishes `event` with its kind as routing key.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Serialization`] when the event cannot be encoded,
    /// [`EventBusError::Connection`] once the retry budget is spent.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        let body = serde_json::to_vec(event)?;
        trace!(event_id = %event.id(), event_kind = E::KIND, "Publishing event");
        self.publish_raw(E::KIND, &body).await
    }

    /// Publishes an already serialised event body.
    pub async fn publish_raw(&self, event_kind: &str, body: &[u8]) -> Result<()> {
        let inner = &self.inner;
        if !inner.connection.is_connected() {
            inner.connection.try_connect().await?;
        }

        inner
            .retry
            .execute("publish", |attempt| inner.publish_once(event_kind, body, attempt))
            .await?;

        debug!(event_kind, bytes = body.len(), "Published event");
        Ok(())
    }

    /// Registers handler `H` for events of type `E`.
    pub async fn subscribe<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        self.subscribe_descriptor(E::KIND, HandlerDescriptor::typed::<E, H, F>(factory))
            .await
    }

    /// Registers `descriptor` for `event_kind` and makes sure the queue
    /// receives that kind.
    ///
    /// # Errors
    ///
    /// [`EventBusError::DuplicateSubscription`] when the pair is already
    /// registered. Broker errors while starting the consumer or binding the
    /// kind are returned as well; the registration is then rolled back so the
    /// same subscription can be retried.
    pub async fn subscribe_descriptor(
        &self,
        event_kind: &str,
        descriptor: HandlerDescriptor,
    ) -> Result<()> {
        let handler = descriptor.name().to_string();
        self.inner.registry.add_subscription(event_kind, descriptor)?;
        info!(event_kind, handler = %handler, "Subscribing to event");

        if let Err(e) = self.inner.ensure_consuming(event_kind).await {
            warn!(event_kind, handler = %handler, error = %e, "Subscription failed, rolling back");
            self.inner.registry.remove_handler(event_kind, &handler);
            self.inner.process_removals().await;
            return Err(e);
        }
        Ok(())
    }

    /// Removes handler `H` from events of type `E`.
    pub async fn unsubscribe<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.unsubscribe_handler(E::KIND, &HandlerDescriptor::name_of::<H>())
            .await
    }

    pub async fn unsubscribe_descriptor(
        &self,
        event_kind: &str,
        descriptor: &HandlerDescriptor,
    ) -> bool {
        self.unsubscribe_handler(event_kind, descriptor.name()).await
    }

    /// Removes the handler named `handler`. When it was the last one of the
    /// kind the queue is unbound from it, and when nothing is left the bus
    /// stops consuming. Returns `false` if nothing was registered.
    pub async fn unsubscribe_handler(&self, event_kind: &str, handler: &str) -> bool {
        let removed = self.inner.registry.remove_handler(event_kind, handler);
        if removed {
            info!(event_kind, handler, "Unsubscribed from event");
        }
        self.inner.process_removals().await;
        removed
    }

    /// Stops consuming, forgets all subscriptions and closes the connection.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut consumer = self.inner.consumer.lock().await;
            self.inner.stop_consuming(&mut consumer).await;
        }
        self.inner.registry.clear();
        self.inner.connection.close().await?;
        info!("Event bus shut down");
        Ok(())
    }
}

impl BusInner {
    async fn publish_once(&self, event_kind: &str, body: &[u8], attempt: u32) -> Result<()> {
        if !self.connection.is_connected() {
            self.connection.try_connect_once().await?;
        }

        let channel = self.connection.create_channel().await?;
        let exchange = self.config.exchange_name.as_str();
        let result = async {
            channel.declare_exchange(exchange).await?;
            channel.publish(exchange, event_kind, body).await
        }
        .await;

        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close publish channel");
        }
        if result.is_ok() {
            trace!(event_kind, attempt, "Publish attempt succeeded");
        }
        result
    }

    /// Opens a consumer channel with the exchange, queue and one binding per
    /// registered kind in place.
    async fn open_consumer(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        if !self.connection.is_connected() {
            self.connection.try_connect_once().await?;
        }

        let channel = self.connection.create_channel().await?;
        let exchange = self.config.exchange_name.as_str();
        let queue = self.config.queue_name.as_str();

        let opened = async {
            channel.declare_exchange(exchange).await?;
            channel.declare_queue(queue).await?;
            for kind in self.registry.event_kinds() {
                channel.bind_queue(queue, exchange, &kind).await?;
            }
            channel.consume(queue, &self.config.consumer_tag()).await
        }
        .await;

        match opened {
            Ok(deliveries) => {
                debug!(queue, "Opened consumer channel");
                Ok((channel, deliveries))
            }
            Err(e) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Failed to close consumer channel");
                }
                Err(e)
            }
        }
    }

    async fn ensure_consuming(self: &Arc<Self>, event_kind: &str) -> Result<()> {
        let mut consumer = self.consumer.lock().await;

        if let ConsumerState::Consuming { channel, .. } = &*consumer {
            if !channel.is_open() {
                // The consume task is rebuilding the channel and binds every
                // registered kind, this one included.
                return Ok(());
            }
            return channel
                .bind_queue(&self.config.queue_name, &self.config.exchange_name, event_kind)
                .await;
        }

        let (channel, deliveries) = self
            .retry
            .execute("start consumer", |_| self.open_consumer())
            .await?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let task = tokio::spawn(run_consumer(
            Arc::downgrade(self),
            channel.clone(),
            deliveries,
            generation,
        ));
        *consumer = ConsumerState::Consuming {
            channel,
            task,
            generation,
        };

        info!(
            queue = %self.config.queue_name,
            exchange = %self.config.exchange_name,
            "Started consuming"
        );
        Ok(())
    }

    /// Replaces a faulted consumer channel. Returns `None` when the consume
    /// task should exit.
    async fn recover_consumer(
        &self,
        generation: u64,
    ) -> Option<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let mut consumer = self.consumer.lock().await;

        let old = match &*consumer {
            ConsumerState::Consuming {
                channel,
                generation: current,
                ..
            } if *current == generation => channel.clone(),
            _ => return None,
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }

        if let Err(e) = old.close().await {
            debug!(error = %e, "Failed to close faulted consumer channel");
        }

        if self.registry.is_empty() {
            self.stop_consuming(&mut consumer).await;
            return None;
        }

        warn!(queue = %self.config.queue_name, "Consumer channel faulted, recreating it");
        match self
            .retry
            .execute("recreate consumer", |_| self.open_consumer())
            .await
        {
            Ok((channel, deliveries)) => {
                if let ConsumerState::Consuming { channel: slot, .. } = &mut *consumer {
                    *slot = channel.clone();
                }
                info!(
                    queue = %self.config.queue_name,
                    kinds = ?self.registry.event_kinds(),
                    "Consumer channel recreated"
                );
                Some((channel, deliveries))
            }
            Err(e) => {
                error!(
                    queue = %self.config.queue_name,
                    error = %e,
                    "Could not recreate consumer channel, consuming stopped"
                );
                self.generation.fetch_add(1, Ordering::SeqCst);
                *consumer = ConsumerState::Idle;
                None
            }
        }
    }

    /// Closes the consumer channel. The consume task notices the closed
    /// stream and exits on its own, so a handler calling back into the bus
    /// is never cancelled midway.
    async fn stop_consuming(&self, consumer: &mut ConsumerState) {
        if let ConsumerState::Consuming { channel, .. } =
            std::mem::replace(consumer, ConsumerState::Idle)
        {
            self.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Failed to close consumer channel");
            }
            info!(queue = %self.config.queue_name, "Stopped consuming");
        }
    }

    async fn process_removals(&self) {
        let kinds = {
            let mut removals = self.removals.lock().await;
            let mut kinds = Vec::new();
            loop {
                match removals.try_recv() {
                    Ok(kind) => kinds.push(kind),
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!(missed, "Missed subscription removal notifications");
                    }
                    Err(_) => break,
                }
            }
            kinds
        };
        if kinds.is_empty() {
            return;
        }

        let mut consumer = self.consumer.lock().await;
        for kind in &kinds {
            // Subscribing again binds under the same lock, so a kind that is
            // registered now must stay bound.
            if self.registry.has_subscriptions(kind) {
                debug!(event_kind = %kind, "Event kind subscribed again, keeping binding");
                continue;
            }
            match self.unbind(kind).await {
                Ok(()) => debug!(event_kind = %kind, "Unbound queue from event kind"),
                Err(e) => warn!(event_kind = %kind, error = %e, "Failed to unbind event kind"),
            }
        }
        if self.registry.is_empty() {
            self.stop_consuming(&mut consumer).await;
        }
    }

    async fn unbind(&self, event_kind: &str) -> Result<()> {
        if !self.connection.is_connected() {
            self.connection.try_connect_once().await?;
        }
        let channel = self.connection.create_channel().await?;
        let result = channel
            .unbind_queue(&self.config.queue_name, &self.config.exchange_name, event_kind)
            .await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Failed to close unbind channel");
        }
        result
    }

    /// Dispatches one delivery to its handlers, then acknowledges it.
    async fn handle_delivery(&self, channel: &dyn BrokerChannel, delivery: InboundDelivery) {
        let span = info_span!(
            "integration_event",
            event_kind = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
        );

        async {
            self.dispatch(&delivery).await;

            // Acknowledged whatever the handlers did; failed messages are not
            // redelivered.
            if let Err(e) = channel.ack(delivery.delivery_tag).await {
                warn!(error = %e, "Failed to acknowledge message");
            }
        }
        .instrument(span)
        .await;
    }

    async fn dispatch(&self, delivery: &InboundDelivery) {
        let event_kind = delivery.routing_key.as_str();

        let shape = match self.registry.shape_for(event_kind) {
            Some(shape) if self.registry.has_subscriptions(event_kind) => shape,
            _ => {
                let err = EventBusError::UnknownEventKind(event_kind.to_string());
                warn!(error = %err, "No subscription for event, dropping message");
                return;
            }
        };

        let event = match shape.decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Could not deserialize event, dropping message");
                return;
            }
        };

        let scope = HandlerScope::new(event_kind, delivery.delivery_tag);
        for descriptor in self.registry.handlers_for(event_kind) {
            let handler = descriptor.resolve(&scope);
            let outcome = AssertUnwindSafe(handler.process_event(&*event))
                .catch_unwind()
                .await;

            let message = match outcome {
                Ok(Ok(())) => {
                    trace!(handler = descriptor.name(), "Handler completed");
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            let err = EventBusError::HandlerExecution {
                event_kind: event_kind.to_string(),
                handler: descriptor.name().to_string(),
                message,
            };
            warn!(error = %err, "Error processing integration event");
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if let ConsumerState::Consuming { task, .. } = self.consumer.get_mut() {
            task.abort();
        }
    }
}

/// Body of the consume task: dispatches deliveries until the channel
/// faults, then rebuilds it in place.
async fn run_consumer(
    bus: Weak<BusInner>,
    mut channel: Arc<dyn BrokerChannel>,
    mut deliveries: DeliveryStream,
    generation: u64,
) {
    loop {
        while let Some(item) = deliveries.next().await {
            let Some(inner) = bus.upgrade() else {
                return;
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match item {
                Ok(delivery) => inner.handle_delivery(channel.as_ref(), delivery).await,
                Err(e) => {
                    warn!(error = %e, "Consumer channel reported a fault");
                    break;
                }
            }
        }

        let Some(inner) = bus.upgrade() else {
            return;
        };
        match inner.recover_consumer(generation).await {
            Some((rebuilt, stream)) => {
                channel = rebuilt;
                deliveries = stream;
            }
            None => {
                debug!("Consume task finished");
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
