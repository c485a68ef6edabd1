use clap::Parser;
use events_bus::EventBus;
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use ops_cli::{commands, Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    if let Ok(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Command::Publish { kind, data } => {
            let bus = EventBus::from_config(cli.event_bus_config(None))?;
            let result = commands::publish(&bus, kind, data).await;
            if let Err(e) = bus.shutdown().await {
                warn!(error = %e, "Failed to close broker connection");
            }
            result
        }
        Command::Listen { service } => {
            let bus = EventBus::from_config(cli.event_bus_config(Some(*service)))?;
            commands::listen(&bus, *service, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                }
            })
            .await
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("ops_cli={level},wms_events={level},events_bus={level},lapin=warn").into()
    });

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .init();
    }
}
