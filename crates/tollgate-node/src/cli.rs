//! Command-line interface of `tollgated`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default configuration path.
pub const DEFAULT_CONFIG: &str = "/etc/tollgate/tollgate.toml";

/// `tollgated` arguments.
#[derive(Debug, Parser)]
#[command(name = "tollgated")]
#[command(about = "Tollgate admission-control node", long_about = None)]
pub struct Cli {
    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the node until interrupted.
    Serve {
        /// Configuration file (.toml or .json).
        #[arg(short, long, env = "TOLLGATE_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Parse the configuration and print the effective settings.
    Validate {
        /// Configuration file (.toml or .json).
        #[arg(short, long, env = "TOLLGATE_CONFIG", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

impl Command {
    /// Configuration path of either subcommand.
    pub fn config_path(&self) -> &PathBuf {
        match self {
            Command::Serve { config } | Command::Validate { config } => config,
        }
    }
}
