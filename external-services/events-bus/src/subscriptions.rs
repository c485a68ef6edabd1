//! In-process registry of which handlers want which event kinds.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{EventBusError, Result};
use crate::event::IntegrationEvent;
use crate::handlers::{EventShape, HandlerDescriptor};

const REMOVAL_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<HandlerDescriptor>>,
    shapes: HashMap<String, EventShape>,
}

/// Maps event kinds to their handlers and deserialization shapes.
///
/// When the last handler of a kind goes away the kind is dropped and its
/// name is broadcast to every receiver from [`subscribe_removals`].
///
/// [`subscribe_removals`]: SubscriptionRegistry::subscribe_removals
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
    removed: broadcast::Sender<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (removed, _) = broadcast::channel(REMOVAL_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(RegistryState::default()),
            removed,
        }
    }

    /// Kind used for `E` when publishing and subscribing.
    pub fn event_kind_for<E: IntegrationEvent>() -> &'static str {
        E::KIND
    }

    /// Registers `descriptor` for `event_kind`.
    ///
    /// Returns `true` when this is the first handler of the kind.
    pub fn add_subscription(&self, event_kind: &str, descriptor: HandlerDescriptor) -> Result<bool> {
        let mut state = self.state.write();

        if let Some(shape) = state.shapes.get(event_kind) {
            if !shape.same_type(descriptor.shape()) {
                return Err(EventBusError::ShapeMismatch {
                    event_kind: event_kind.to_string(),
                    registered: shape.type_name(),
                    requested: descriptor.shape().type_name(),
                });
            }
        }

        let first = !state.handlers.contains_key(event_kind);
        let shape = *descriptor.shape();
        let handlers = state.handlers.entry(event_kind.to_string()).or_default();
        if handlers.contains(&descriptor) {
            return Err(EventBusError::DuplicateSubscription {
                event_kind: event_kind.to_string(),
                handler: descriptor.name().to_string(),
            });
        }
        handlers.push(descriptor);
        state.shapes.entry(event_kind.to_string()).or_insert(shape);

        Ok(first)
    }

    pub fn remove_subscription(&self, event_kind: &str, descriptor: &HandlerDescriptor) -> bool {
        self.remove_handler(event_kind, descriptor.name())
    }

    /// Removes the handler named `handler` from `event_kind`.
    ///
    /// Returns `false` when no such registration existed.
    pub fn remove_handler(&self, event_kind: &str, handler: &str) -> bool {
        let kind_removed = {
            let mut state = self.state.write();
            let Some(handlers) = state.handlers.get_mut(event_kind) else {
                return false;
            };
            let Some(position) = handlers.iter().position(|d| d.name() == handler) else {
                return false;
            };
            handlers.remove(position);

            if handlers.is_empty() {
                state.handlers.remove(event_kind);
                state.shapes.remove(event_kind);
                true
            } else {
                false
            }
        };

        if kind_removed {
            debug!(event_kind, "Last handler removed, dropping event kind");
            // No receivers is fine
            let _ = self.removed.send(event_kind.to_string());
        }
        true
    }

    pub fn has_subscriptions(&self, event_kind: &str) -> bool {
        self.state.read().handlers.contains_key(event_kind)
    }

    /// Handlers of `event_kind` in registration order; empty when unknown.
    pub fn handlers_for(&self, event_kind: &str) -> Vec<HandlerDescriptor> {
        self.state
            .read()
            .handlers
            .get(event_kind)
            .cloned()
            .unwrap_or_default()
    }

    pub fn shape_for(&self, event_kind: &str) -> Option<EventShape> {
        self.state.read().shapes.get(event_kind).copied()
    }

    /// Registered kinds, sorted.
    pub fn event_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.state.read().handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().handlers.is_empty()
    }

    /// Drops every registration without emitting removal notifications.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.handlers.clear();
        state.shapes.clear();
    }

    pub fn subscribe_removals(&self) -> broadcast::Receiver<String> {
        self.removed.subscribe()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
