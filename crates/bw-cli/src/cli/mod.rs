//! CLI Command Definitions
//!
//! Defines the command-line interface using clap.

pub mod info;
pub mod run;
pub mod verify;

use bw_core::ClientConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Burrow - Reverse-Tunnel Client
///
/// Expose local services to peers and reach theirs, directly when hole
/// punching works and through the relay when it does not.
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the client
    ///
    /// Starts every configured proxy and visitor and runs until ctrl-c.
    #[command(visible_alias = "r")]
    Run {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Check a configuration file without starting anything
    #[command(visible_alias = "v")]
    Verify {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show node information
    ///
    /// Displays the local peer ID and Burrow link.
    #[command(visible_alias = "i")]
    Info {
        /// Configuration file
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Configuration path given on the command line, or the default one
pub fn config_path(config: Option<PathBuf>) -> PathBuf {
    config.unwrap_or_else(ClientConfig::default_config_path)
}
