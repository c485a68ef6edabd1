use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    /// Broker unreachable or transport failure.
    #[error("Event broker connection failed: {0}")]
    Connection(String),

    #[error("Handler {handler} already registered for '{event_kind}'")]
    DuplicateSubscription { event_kind: String, handler: String },

    #[error("No subscription for event kind '{0}'")]
    UnknownEventKind(String),

    #[error("Handler {handler} failed while processing '{event_kind}': {message}")]
    HandlerExecution {
        event_kind: String,
        handler: String,
        message: String,
    },

    #[error("Event kind '{event_kind}' is bound to {registered}, not {requested}")]
    ShapeMismatch {
        event_kind: String,
        registered: &'static str,
        requested: &'static str,
    },

    /// Channel-level fault reported by the broker.
    #[error("Broker channel error: {0}")]
    Channel(String),

    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event bus configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl EventBusError {
    /// Errors worth another attempt under a retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EventBusError::Connection("refused".into()).is_transient());
        assert!(EventBusError::Channel("closed".into()).is_transient());
        assert!(!EventBusError::UnknownEventKind("OrderPacked".into()).is_transient());
        assert!(!EventBusError::DuplicateSubscription {
            event_kind: "StockAdjusted".into(),
            handler: "AuditHandler".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_duplicate_message_names_both_sides() {
        let err = EventBusError::DuplicateSubscription {
            event_kind: "StockAdjusted".into(),
            handler: "AuditHandler".into(),
        };
        assert_eq!(
            err.to_string(),
            "Handler AuditHandler already registered for 'StockAdjusted'"
        );
    }
}
