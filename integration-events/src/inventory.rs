// Inventory service events
use events_bus::{integration_event, EventHeader};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A new item was added to the inventory master data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryItemCreated {
    #[serde(flatten)]
    pub header: EventHeader,
    pub item_id: Uuid,
    pub sku: String,
    pub name: String,
}

/// On-hand or available quantity of an item changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryStockUpdated {
    #[serde(flatten)]
    pub header: EventHeader,
    pub item_id: Uuid,
    pub sku: String,
    pub quantity_on_hand: i32,
    pub quantity_available: i32,
}

/// Manual stock correction, positive or negative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockAdjusted {
    #[serde(flatten)]
    pub header: EventHeader,
    pub item_id: String,
    pub delta: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

integration_event!(InventoryItemCreated, InventoryStockUpdated, StockAdjusted);

impl InventoryItemCreated {
    pub fn new(item_id: Uuid, sku: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            header: EventHeader::new(),
            item_id,
            sku: sku.into(),
            name: name.into(),
        }
    }
}

impl InventoryStockUpdated {
    pub fn new(item_id: Uuid, sku: impl Into<String>, quantity_on_hand: i32, quantity_available: i32) -> Self {
        Self {
            header: EventHeader::new(),
            item_id,
            sku: sku.into(),
            quantity_on_hand,
            quantity_available,
        }
    }
}

impl StockAdjusted {
    pub fn new(item_id: impl Into<String>, delta: i32) -> Self {
        Self {
            header: EventHeader::new(),
            item_id: item_id.into(),
            delta,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
