//! CLI argument definitions and commands.

use crate::core::config::Config;
use crate::core::runtime::Runtime;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Photon - subject-based pub/sub server with an embedded MQTT adapter.
#[derive(Parser)]
#[command(name = "photon")]
#[command(version)]
#[command(about = "Photon messaging server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the Photon server
    Start(StartArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/photon.toml")]
    pub config: PathBuf,
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    init_tracing(&config.telemetry.log_level);
    let handle = Runtime::start(config).await?;
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
