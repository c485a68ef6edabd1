// Receiving service events
use events_bus::{integration_event, EventHeader};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOrderConfirmed {
    #[serde(flatten)]
    pub header: EventHeader,
    pub purchase_order_id: Uuid,
    pub purchase_order_number: String,
    pub vendor_id: String,
    pub vendor_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOrderCancelled {
    #[serde(flatten)]
    pub header: EventHeader,
    pub purchase_order_id: Uuid,
    pub purchase_order_number: String,
    pub reason: String,
}

/// One received line of a goods receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptLine {
    pub sku: String,
    pub quantity_received: i32,
    pub location_code: String,
}

/// Goods were put away; inventory books the received quantities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptCompleted {
    #[serde(flatten)]
    pub header: EventHeader,
    pub receipt_id: Uuid,
    pub receipt_number: String,
    pub purchase_order_id: Uuid,
    #[serde(default)]
    pub receipt_lines: Vec<ReceiptLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptCancelled {
    #[serde(flatten)]
    pub header: EventHeader,
    pub receipt_id: Uuid,
    pub receipt_number: String,
    pub purchase_order_id: Uuid,
    pub reason: String,
}

integration_event!(
    PurchaseOrderConfirmed,
    PurchaseOrderCancelled,
    ReceiptCompleted,
    ReceiptCancelled,
);

impl ReceiptCompleted {
    pub fn new(
        receipt_id: Uuid,
        receipt_number: impl Into<String>,
        purchase_order_id: Uuid,
        receipt_lines: Vec<ReceiptLine>,
    ) -> Self {
        Self {
            header: EventHeader::new(),
            receipt_id,
            receipt_number: receipt_number.into(),
            purchase_order_id,
            receipt_lines,
        }
    }

    pub fn total_quantity(&self) -> i64 {
        self.receipt_lines
            .iter()
            .map(|line| i64::from(line.quantity_received))
            .sum()
    }
}
