//! Handlers each WMS service registers when listening.
//!
//! They log what the owning service would act upon. The inventory handlers
//! also keep a running stock ledger so picks and receipts can be followed
//! from the command line.

use async_trait::async_trait;
use events_bus::{EventBus, HandlerScope, IntegrationEventHandler};
use integration_events::{
    InventoryItemCreated, InventoryPicked, InventoryStockUpdated, PickingListCompleted,
    ReceiptCompleted,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::Service;

/// On-hand quantities per SKU as seen through inventory events.
#[derive(Debug, Default)]
pub struct StockLedger {
    on_hand: Mutex<BTreeMap<String, i64>>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `delta` to `sku` and returns the new quantity.
    pub fn apply(&self, sku: &str, delta: i64) -> i64 {
        let mut on_hand = self.on_hand.lock();
        let quantity = on_hand.entry(sku.to_string()).or_insert(0);
        *quantity = quantity.saturating_add(delta);
        *quantity
    }

    pub fn quantity(&self, sku: &str) -> i64 {
        self.on_hand.lock().get(sku).copied().unwrap_or(0)
    }
}

/// Picking re-evaluates draft allocations when stock changes.
pub struct StockAllocationHandler;

#[async_trait]
impl IntegrationEventHandler<InventoryStockUpdated> for StockAllocationHandler {
    async fn handle(&self, event: &InventoryStockUpdated) -> anyhow::Result<()> {
        info!(
            sku = %event.sku,
            quantity_on_hand = event.quantity_on_hand,
            quantity_available = event.quantity_available,
            "Re-evaluating draft picking allocations"
        );
        Ok(())
    }
}

/// Receiving caches item reference data.
pub struct ItemReferenceHandler;

#[async_trait]
impl IntegrationEventHandler<InventoryItemCreated> for ItemReferenceHandler {
    async fn handle(&self, event: &InventoryItemCreated) -> anyhow::Result<()> {
        info!(sku = %event.sku, name = %event.name, "Caching item reference data");
        Ok(())
    }
}

pub struct PickedStockHandler {
    ledger: Arc<StockLedger>,
}

#[async_trait]
impl IntegrationEventHandler<InventoryPicked> for PickedStockHandler {
    async fn handle(&self, event: &InventoryPicked) -> anyhow::Result<()> {
        let on_hand = self
            .ledger
            .apply(&event.sku, -i64::from(event.quantity_picked));
        if on_hand < 0 {
            warn!(sku = %event.sku, on_hand, "Picked more than the ledger holds");
        }
        info!(
            sku = %event.sku,
            location = %event.location_code,
            picked = event.quantity_picked,
            on_hand,
            "Booked picked stock"
        );
        Ok(())
    }
}

pub struct ReceivedStockHandler {
    ledger: Arc<StockLedger>,
}

#[async_trait]
impl IntegrationEventHandler<ReceiptCompleted> for ReceivedStockHandler {
    async fn handle(&self, event: &ReceiptCompleted) -> anyhow::Result<()> {
        for line in &event.receipt_lines {
            let on_hand = self
                .ledger
                .apply(&line.sku, i64::from(line.quantity_received));
            info!(
                receipt = %event.receipt_number,
                sku = %line.sku,
                received = line.quantity_received,
                on_hand,
                "Booked received stock"
            );
        }
        Ok(())
    }
}

/// Shipping queues completed picking lists for packing.
pub struct PackingQueueHandler;

#[async_trait]
impl IntegrationEventHandler<PickingListCompleted> for PackingQueueHandler {
    async fn handle(&self, event: &PickingListCompleted) -> anyhow::Result<()> {
        info!(
            picking_list = %event.picking_list_number,
            order_number = %event.order_number,
            "Queued order for packing"
        );
        Ok(())
    }
}

/// Registers the handlers `service` consumes.
pub async fn register_service_handlers(
    bus: &EventBus,
    service: Service,
    ledger: Arc<StockLedger>,
) -> events_bus::Result<()> {
    match service {
        Service::Picking => {
            bus.subscribe::<InventoryStockUpdated, _, _>(|_: &HandlerScope| StockAllocationHandler)
                .await
        }
        Service::Receiving => {
            bus.subscribe::<InventoryItemCreated, _, _>(|_: &HandlerScope| ItemReferenceHandler)
                .await
        }
        Service::Inventory => {
            let picked = ledger.clone();
            bus.subscribe::<InventoryPicked, _, _>(move |_: &HandlerScope| PickedStockHandler {
                ledger: picked.clone(),
            })
            .await?;
            bus.subscribe::<ReceiptCompleted, _, _>(move |_: &HandlerScope| ReceivedStockHandler {
                ledger: ledger.clone(),
            })
            .await
        }
        Service::Shipping => {
            bus.subscribe::<PickingListCompleted, _, _>(|_: &HandlerScope| PackingQueueHandler)
                .await
        }
    }
}
