/// Command Line Interface Module
///
/// Clap-based argument parsing for the billmesh binary. The binary is a
/// thin wrapper around the engine: it runs the scheduler loops, and can
/// generate or display the configuration file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Main CLI structure for the billmesh billing engine
#[derive(Parser, Debug, Clone)]
#[command(name = "billmesh", about = "Usage-based subscription billing engine")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, help = "Path to config.toml (defaults to the user config dir)")]
    pub config: Option<PathBuf>,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the billing engine with its scheduler loops
    Serve {
        /// Development cadence: tick every 5 minutes instead of every 12
        /// hours
        #[arg(long)]
        dev: bool,
        /// Override the database file path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config {
        /// Write a default config file instead of printing
        #[arg(long)]
        init: bool,
    },
}
