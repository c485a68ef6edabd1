//! Registry of every event kind the WMS services exchange.

use chrono::Utc;
use events_bus::IntegrationEvent;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::inventory::{InventoryItemCreated, InventoryStockUpdated, StockAdjusted};
use crate::picking::{
    InventoryPicked, PickingItemShort, PickingListAssigned, PickingListCancelled,
    PickingListCompleted, PickingListReleased, PickingListUnassigned,
};
use crate::receiving::{
    PurchaseOrderCancelled, PurchaseOrderConfirmed, ReceiptCancelled, ReceiptCompleted,
};
use crate::shipping::{OrderPacked, ShipmentDispatched};

/// Every event kind, grouped by publishing service.
pub const ALL_KINDS: &[&str] = &[
    InventoryItemCreated::KIND,
    InventoryStockUpdated::KIND,
    StockAdjusted::KIND,
    PickingListReleased::KIND,
    PickingListAssigned::KIND,
    PickingListUnassigned::KIND,
    PickingListCompleted::KIND,
    PickingListCancelled::KIND,
    InventoryPicked::KIND,
    PickingItemShort::KIND,
    PurchaseOrderConfirmed::KIND,
    PurchaseOrderCancelled::KIND,
    ReceiptCompleted::KIND,
    ReceiptCancelled::KIND,
    OrderPacked::KIND,
    ShipmentDispatched::KIND,
];

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Event fields must be a JSON object")]
    NotAnObject,

    #[error("Invalid fields for {kind}: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

pub fn is_known_kind(kind: &str) -> bool {
    ALL_KINDS.contains(&kind)
}

/// Builds the wire body of a `kind` event from its kind-specific fields.
///
/// A fresh `id` and `createdAtUtc` are stamped unless `fields` carries
/// them already. The result is validated against the event type, so the
/// body is exactly what a typed publisher would send.
pub fn build_payload(kind: &str, fields: Value) -> Result<Vec<u8>, CatalogError> {
    let Value::Object(mut object) = fields else {
        return Err(CatalogError::NotAnObject);
    };
    stamp_header(&mut object);
    let value = Value::Object(object);

    match kind {
        "InventoryItemCreated" => encode::<InventoryItemCreated>(kind, value),
        "InventoryStockUpdated" => encode::<InventoryStockUpdated>(kind, value),
        "StockAdjusted" => encode::<StockAdjusted>(kind, value),
        "PickingListReleased" => encode::<PickingListReleased>(kind, value),
        "PickingListAssigned" => encode::<PickingListAssigned>(kind, value),
        "PickingListUnassigned" => encode::<PickingListUnassigned>(kind, value),
        "PickingListCompleted" => encode::<PickingListCompleted>(kind, value),
        "PickingListCancelled" => encode::<PickingListCancelled>(kind, value),
        "InventoryPicked" => encode::<InventoryPicked>(kind, value),
        "PickingItemShort" => encode::<PickingItemShort>(kind, value),
        "PurchaseOrderConfirmed" => encode::<PurchaseOrderConfirmed>(kind, value),
        "PurchaseOrderCancelled" => encode::<PurchaseOrderCancelled>(kind, value),
        "ReceiptCompleted" => encode::<ReceiptCompleted>(kind, value),
        "ReceiptCancelled" => encode::<ReceiptCancelled>(kind, value),
        "OrderPacked" => encode::<OrderPacked>(kind, value),
        "ShipmentDispatched" => encode::<ShipmentDispatched>(kind, value),
        other => Err(CatalogError::UnknownKind(other.to_string())),
    }
}

fn stamp_header(object: &mut Map<String, Value>) {
    object
        .entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    object
        .entry("createdAtUtc")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
}

fn encode<E: IntegrationEvent>(kind: &str, value: Value) -> Result<Vec<u8>, CatalogError> {
    let invalid = |source| CatalogError::InvalidFields {
        kind: kind.to_string(),
        source,
    };
    let event: E = serde_json::from_value(value).map_err(invalid)?;
    serde_json::to_vec(&event).map_err(invalid)
}
