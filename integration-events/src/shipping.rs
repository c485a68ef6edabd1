// Shipping service events
use events_bus::{integration_event, EventHeader};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPacked {
    #[serde(flatten)]
    pub header: EventHeader,
    pub order_number: String,
    pub package_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentDispatched {
    #[serde(flatten)]
    pub header: EventHeader,
    pub shipment_id: Uuid,
    pub order_number: String,
    pub carrier: String,
    pub tracking_number: String,
}

integration_event!(OrderPacked, ShipmentDispatched);

impl OrderPacked {
    pub fn new(order_number: impl Into<String>, package_count: u32) -> Self {
        Self {
            header: EventHeader::new(),
            order_number: order_number.into(),
            package_count,
        }
    }
}
