// Integration event envelope
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by every integration event.
///
/// Concrete events embed it with `#[serde(flatten)]`, so on the wire `id` and
/// `createdAtUtc` sit next to the kind-specific fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    pub id: Uuid,
    pub created_at_utc: DateTime<Utc>,
}

impl EventHeader {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at_utc: Utc::now(),
        }
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A cross-service notification published on the bus.
///
/// `KIND` is the event's stable name. It is the broker routing key and the
/// subscription registry key, so two event types must never share one.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn header(&self) -> &EventHeader;

    fn id(&self) -> Uuid {
        self.header().id
    }

    fn created_at_utc(&self) -> DateTime<Utc> {
        self.header().created_at_utc
    }

    fn kind(&self) -> &'static str {
        Self::KIND
    }
}

/// Event kind for an event type.
pub fn event_kind_for<E: IntegrationEvent>() -> &'static str {
    E::KIND
}

/// Implements [`IntegrationEvent`] for a struct with a `header: EventHeader`
/// field, using the struct name as the event kind.
#[macro_export]
macro_rules! integration_event {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $crate::IntegrationEvent for $ty {
                const KIND: &'static str = stringify!($ty);

                fn header(&self) -> &$crate::EventHeader {
                    &self.header
                }
            }
        )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration_event;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct StockAdjusted {
        #[serde(flatten)]
        header: EventHeader,
        item_id: String,
        delta: i32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct OrderPacked {
        #[serde(flatten)]
        header: EventHeader,
        order_number: String,
    }

    integration_event!(StockAdjusted, OrderPacked);

    #[test]
    fn test_kind_is_type_name() {
        assert_eq!(event_kind_for::<StockAdjusted>(), "StockAdjusted");
        assert_eq!(event_kind_for::<StockAdjusted>(), event_kind_for::<StockAdjusted>());
        assert_ne!(event_kind_for::<StockAdjusted>(), event_kind_for::<OrderPacked>());
    }

    #[test]
    fn test_wire_shape_is_flat_camel_case() {
        let event = StockAdjusted {
            header: EventHeader::new(),
            item_id: "SKU-1".to_string(),
            delta: 5,
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["itemId"], "SKU-1");
        assert_eq!(value["delta"], 5);
        assert_eq!(value["id"], event.id().to_string());
        assert!(value.get("createdAtUtc").is_some());
        assert!(value.get("header").is_none());

        let back: StockAdjusted = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
