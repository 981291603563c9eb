use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use fleetwatch::alerts::AlertEngine;
use fleetwatch::api::spawn_api_server;
use fleetwatch::config::ServerConfig;
use fleetwatch::notify::{ConsoleNotifier, Notifier, WebhookNotifier};
use fleetwatch::state::StateStore;

/// Central telemetry collector and alerting server
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the JSON server config
    #[arg(short, long, default_value = "server.json")]
    config: PathBuf,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter::LevelFilter::INFO)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;

    let store = Arc::new(StateStore::new());
    let cancel = CancellationToken::new();

    let notifier: Arc<dyn Notifier> = if config.webhook.enabled {
        info!("using webhook notifier");
        Arc::new(WebhookNotifier::new(
            config.webhook.url.clone(),
            config.webhook.dashboard_url.clone(),
        )?)
    } else {
        info!("no webhook configured, alerts go to the log");
        Arc::new(ConsoleNotifier)
    };

    let engine = AlertEngine::new(store.clone(), config.alerting.clone(), notifier);
    let engine_task = tokio::spawn(engine.run(cancel.clone()));

    spawn_api_server(&config, store, cancel.clone()).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    engine_task.await?;
    Ok(())
}
