use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

use fleetwatch::agent::Agent;
use fleetwatch::config::AgentConfig;

/// Host metrics agent: collects and pushes to the fleetwatch server
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the JSON agent config
    #[arg(short, long, default_value = "agent.json")]
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
    let config = AgentConfig::load(&args.config)?;

    let cancel = CancellationToken::new();
    let agent = Agent::new(config)?;
    let agent_task = tokio::spawn(agent.run(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    agent_task.await?;
    Ok(())
}
