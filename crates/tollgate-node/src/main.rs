#![warn(missing_docs)]

//! `tollgated`: runs one tollgate node.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tollgate_limits::throttle::ProcLoadSampler;
use tollgate_limits::LoadSampler;
use tollgate_node::cli::{Cli, Command};
use tollgate_node::config::LoggingConfig;
use tollgate_node::{BackgroundJobs, Node, NodeConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.command.config_path().clone();
    let (config, found) = NodeConfig::load_or_default(&path)?;
    init_tracing(&config.logging);
    if !found {
        tracing::warn!("Config file not found, using defaults: {}", path.display());
    }

    match cli.command {
        Command::Validate { .. } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Serve { .. } => serve(config).await,
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    tracing::info!(node = %config.node.node_id, "tollgate node starting");
    let node = Arc::new(Node::from_config(config)?);
    let sampler: Arc<dyn LoadSampler> = Arc::new(ProcLoadSampler::new(node.in_flight().clone()));
    let jobs = BackgroundJobs::start(node.clone(), Some(sampler)).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    jobs.shutdown().await;
    Ok(())
}
