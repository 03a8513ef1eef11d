#![forbid(unsafe_code)]

//! **aam-node** binary – starts one shard-group process from a
//! configuration file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use aam_node::{Node, NodeConfig};

#[derive(Parser)]
#[command(name = "aam-node")]
#[command(about = "ApplicationAccess shard-group node")]
#[command(version)]
struct Cli {
    /// Path to the node's TOML configuration file.
    #[arg(long, default_value = "config/node.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(log_level: &str) {
    let filter = format!("aam_node={log_level},aam_router={log_level},aam_redistribution={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = NodeConfig::load(&cli.config).with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    tracing::info!(endpoint = %config.node_endpoint, shards = config.shard_configuration.len(), "starting node");

    let node = Node::build(&config).await.context("assembling node")?;
    tracing::info!("node assembled, awaiting shutdown signal");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received, draining write buffer");
    node.shutdown().await;

    Ok(())
}
