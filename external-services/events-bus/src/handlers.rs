//! Handler capability, per-message handler scope and event shapes.
//!
//! A service registers a [`HandlerDescriptor`] per (event kind, handler)
//! pair. The descriptor carries the handler identity, the [`EventShape`]
//! used to decode inbound bodies, and a factory that builds a fresh handler
//! inside the [`HandlerScope`] of every message.

use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

use crate::error::Result;
use crate::event::IntegrationEvent;

/// Processes one kind of integration event.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// Decoded event value as produced by an [`EventShape`].
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

/// Type-erased handler invoked by the bus.
#[async_trait]
pub trait DynEventHandler: Send + Sync {
    async fn process_event(&self, event: &(dyn Any + Send + Sync)) -> anyhow::Result<()>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> DynEventHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn process_event(&self, event: &(dyn Any + Send + Sync)) -> anyhow::Result<()> {
        let event = event
            .downcast_ref::<E>()
            .ok_or_else(|| anyhow::anyhow!("decoded event is not a {}", type_name::<E>()))?;
        self.handler.handle(event).await
    }
}

/// Deserialization shape of an event kind.
#[derive(Clone, Copy)]
pub struct EventShape {
    kind: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: fn(&[u8]) -> Result<DecodedEvent>,
}

impl EventShape {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            kind: E::KIND,
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Kind the event type publishes under.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn same_type(&self, other: &EventShape) -> bool {
        self.type_id == other.type_id
    }

    pub fn decode(&self, body: &[u8]) -> Result<DecodedEvent> {
        (self.decode)(body)
    }
}

impl fmt::Debug for EventShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventShape")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_as<E: IntegrationEvent>(body: &[u8]) -> Result<DecodedEvent> {
    let event: E = serde_json::from_slice(body)?;
    Ok(Box::new(event))
}

/// Resolution context created for a single inbound message.
///
/// Every handler of the message is built from the same scope; the scope is
/// dropped once all of them have run, whether they succeeded or not.
pub struct HandlerScope {
    id: Uuid,
    event_kind: String,
    delivery_tag: u64,
}

impl HandlerScope {
    pub fn new(event_kind: impl Into<String>, delivery_tag: u64) -> Self {
        let scope = Self {
            id: Uuid::new_v4(),
            event_kind: event_kind.into(),
            delivery_tag,
        };
        trace!(scope_id = %scope.id, event_kind = %scope.event_kind, "Opened handler scope");
        scope
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_kind(&self) -> &str {
        &self.event_kind
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        trace!(scope_id = %self.id, event_kind = %self.event_kind, "Released handler scope");
    }
}

type HandlerFactory = Arc<dyn Fn(&HandlerScope) -> Arc<dyn DynEventHandler> + Send + Sync>;

/// Identity, shape and factory of a registered handler.
///
/// Descriptors compare equal by name: one name means one handler.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    shape: EventShape,
    factory: HandlerFactory,
}

impl HandlerDescriptor {
    pub fn new<E, H, F>(name: impl Into<String>, factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            shape: EventShape::of::<E>(),
            factory: Arc::new(move |scope: &HandlerScope| {
                Arc::new(TypedHandler {
                    handler: factory(scope),
                    _event: PhantomData::<fn() -> E>,
                }) as Arc<dyn DynEventHandler>
            }),
        }
    }

    /// Descriptor named after the handler type.
    pub fn typed<E, H, F>(factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn(&HandlerScope) -> H + Send + Sync + 'static,
    {
        Self::new::<E, H, F>(Self::name_of::<H>(), factory)
    }

    /// Name a `typed` descriptor gets for handler type `H`.
    pub fn name_of<H: 'static>() -> String {
        type_name::<H>().to_string()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &EventShape {
        &self.shape
    }

    /// Builds the handler instance for one message.
    pub fn resolve(&self, scope: &HandlerScope) -> Arc<dyn DynEventHandler> {
        (self.factory)(scope)
    }
}

impl PartialEq for HandlerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for HandlerDescriptor {}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}
