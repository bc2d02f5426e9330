//! Photon - unified CLI entrypoint.
//!
//! Usage:
//!   photon start --config config/photon.toml

use anyhow::Result;
use clap::Parser;
use photon::cli::{run_start, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
    }
}
