// publish and listen subcommands
use anyhow::Context;
use events_bus::EventBus;
use integration_events::catalog;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::cli::Service;
use crate::handlers::{register_service_handlers, StockLedger};

/// Publishes a `kind` event built from the JSON object in `data`.
pub async fn publish(bus: &EventBus, kind: &str, data: &str) -> anyhow::Result<()> {
    let fields: serde_json::Value =
        serde_json::from_str(data).context("--data is not valid JSON")?;
    let body = catalog::build_payload(kind, fields)?;

    bus.publish_raw(kind, &body)
        .await
        .with_context(|| format!("failed to publish {kind}"))?;

    info!(event_kind = kind, exchange = %bus.config().exchange_name, "Event published");
    Ok(())
}

/// Consumes the events of `service` until `shutdown` resolves, then shuts
/// the bus down.
pub async fn listen<S>(bus: &EventBus, service: Service, shutdown: S) -> anyhow::Result<()>
where
    S: Future<Output = ()>,
{
    let ledger = Arc::new(StockLedger::new());
    register_service_handlers(bus, service, ledger)
        .await
        .context("failed to subscribe")?;

    info!(
        service = ?service,
        queue = %bus.config().queue_name,
        kinds = ?bus.registry().event_kinds(),
        "Listening for integration events"
    );

    shutdown.await;

    info!("Shutting down");
    bus.shutdown().await?;
    Ok(())
}
