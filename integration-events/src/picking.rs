// Picking service events
use events_bus::{integration_event, EventHeader};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingListReleased {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub picking_list_number: String,
    pub order_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingListAssigned {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub picking_list_number: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingListUnassigned {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub picking_list_number: String,
    pub previous_user_id: String,
}

/// All lines of a picking list were picked; shipping may start packing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingListCompleted {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub picking_list_number: String,
    pub order_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingListCancelled {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub picking_list_number: String,
    pub reason: String,
}

/// Stock left a location; inventory decrements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryPicked {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub sku: String,
    pub location_code: String,
    pub quantity_picked: i32,
    pub is_item_fully_picked: bool,
}

/// Fewer units were found at the location than the list required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PickingItemShort {
    #[serde(flatten)]
    pub header: EventHeader,
    pub picking_list_id: Uuid,
    pub sku: String,
    pub quantity_required: i32,
    pub quantity_picked: i32,
    pub reason: String,
}

integration_event!(
    PickingListReleased,
    PickingListAssigned,
    PickingListUnassigned,
    PickingListCompleted,
    PickingListCancelled,
    InventoryPicked,
    PickingItemShort,
);

impl PickingListCompleted {
    pub fn new(
        picking_list_id: Uuid,
        picking_list_number: impl Into<String>,
        order_number: impl Into<String>,
    ) -> Self {
        Self {
            header: EventHeader::new(),
            picking_list_id,
            picking_list_number: picking_list_number.into(),
            order_number: order_number.into(),
        }
    }
}

impl InventoryPicked {
    pub fn new(
        picking_list_id: Uuid,
        sku: impl Into<String>,
        location_code: impl Into<String>,
        quantity_picked: i32,
        is_item_fully_picked: bool,
    ) -> Self {
        Self {
            header: EventHeader::new(),
            picking_list_id,
            sku: sku.into(),
            location_code: location_code.into(),
            quantity_picked,
            is_item_fully_picked,
        }
    }
}

impl PickingItemShort {
    /// Units missing to fulfil the line.
    pub fn shortfall(&self) -> i32 {
        self.quantity_required.saturating_sub(self.quantity_picked).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inventory_picked_wire_shape() {
        let event = InventoryPicked::new(Uuid::new_v4(), "SKU-1", "A-01-02", 3, true);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["locationCode"], "A-01-02");
        assert_eq!(value["isItemFullyPicked"], true);
        assert_eq!(value["id"], json!(event.header.id));
    }

    #[test]
    fn test_shortfall() {
        let short: PickingItemShort = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "createdAtUtc": "2024-03-01T10:00:00Z",
            "pickingListId": Uuid::new_v4(),
            "sku": "SKU-4",
            "quantityRequired": 10,
            "quantityPicked": 7,
            "reason": "location empty"
        }))
        .unwrap();

        assert_eq!(short.shortfall(), 3);
    }
}
