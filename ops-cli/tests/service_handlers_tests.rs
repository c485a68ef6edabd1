//! Service handler wiring over the in-memory broker

use events_bus::{EventBus, EventBusConfig};
use ops_cli::commands;
use ops_cli::handlers::{register_service_handlers, StockLedger};
use ops_cli::Service;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

fn memory_bus(service: Service) -> EventBus {
    let config = EventBusConfig::new("memory://local", "wms_event_bus", service.queue_name())
        .with_retry_count(2)
        .with_backoff(0, 1);
    EventBus::from_config(config).unwrap()
}

async fn wait_for_quantity(ledger: &StockLedger, sku: &str, expected: i64) -> bool {
    for _ in 0..200 {
        if ledger.quantity(sku) == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_each_service_subscribes_to_its_kinds() {
    let cases = [
        (Service::Picking, vec!["InventoryStockUpdated"]),
        (Service::Receiving, vec!["InventoryItemCreated"]),
        (Service::Inventory, vec!["InventoryPicked", "ReceiptCompleted"]),
        (Service::Shipping, vec!["PickingListCompleted"]),
    ];

    for (service, kinds) in cases {
        let bus = memory_bus(service);
        register_service_handlers(&bus, service, Arc::new(StockLedger::new()))
            .await
            .unwrap();

        assert_eq!(bus.registry().event_kinds(), kinds, "{service:?}");
        assert!(bus.is_consuming().await);
        bus.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_inventory_ledger_follows_receipts_and_picks() {
    let bus = memory_bus(Service::Inventory);
    let ledger = Arc::new(StockLedger::new());
    register_service_handlers(&bus, Service::Inventory, ledger.clone())
        .await
        .unwrap();

    let receipt = json!({
        "receiptId": Uuid::new_v4(),
        "receiptNumber": "RCV-1",
        "purchaseOrderId": Uuid::new_v4(),
        "receiptLines": [
            {"sku": "SKU-1", "quantityReceived": 10, "locationCode": "R-01"}
        ]
    });
    commands::publish(&bus, "ReceiptCompleted", &receipt.to_string())
        .await
        .unwrap();
    assert!(wait_for_quantity(&ledger, "SKU-1", 10).await);

    let picked = json!({
        "pickingListId": Uuid::new_v4(),
        "sku": "SKU-1",
        "locationCode": "A-01",
        "quantityPicked": 4,
        "isItemFullyPicked": true
    });
    commands::publish(&bus, "InventoryPicked", &picked.to_string())
        .await
        .unwrap();
    assert!(wait_for_quantity(&ledger, "SKU-1", 6).await);
}

#[tokio::test]
async fn test_publish_rejects_bad_input() {
    let bus = memory_bus(Service::Shipping);

    assert!(commands::publish(&bus, "OrderPacked", "not json").await.is_err());
    assert!(commands::publish(&bus, "NoSuchEvent", "{}").await.is_err());
    assert!(commands::publish(&bus, "OrderPacked", r#"{"orderNumber":"SO-1"}"#)
        .await
        .is_err());
    assert!(
        commands::publish(&bus, "OrderPacked", r#"{"orderNumber":"SO-1","packageCount":3}"#)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_listen_shuts_down_when_signalled() {
    let bus = memory_bus(Service::Shipping);

    commands::listen(&bus, Service::Shipping, async {}).await.unwrap();

    assert!(bus.registry().is_empty());
    assert!(!bus.is_consuming().await);
    assert!(!bus.connection().is_connected());
}
