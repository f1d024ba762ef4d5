//! Burrow CLI
//!
//! Command-line interface for the Burrow reverse-tunnel client.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run { config } => {
            cli::run::run(cli::config_path(config)).await?;
        }
        Commands::Verify { config } => {
            cli::verify::run(cli::config_path(config))?;
        }
        Commands::Info { config } => {
            cli::info::run(config).await?;
        }
    }

    Ok(())
}
