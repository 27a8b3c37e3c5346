//! Command-line argument parsing with clap.

use std::net::IpAddr;
use std::path::PathBuf;

use claw_shield::DEFAULT_MANUAL_BLOCK_MINUTES;
use clap::{Parser, Subcommand, ValueEnum};

/// Default configuration path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/claw-shield/config.toml";

/// claw-shield - adaptive intrusion prevention.
#[derive(Parser, Debug, Clone)]
#[command(name = "claw-shieldd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, env = "CLAW_SHIELD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Follow the journal and enforce blocks until stopped.
    Run,

    /// Show active blocks, filter members and recent attempts.
    Status {
        /// Number of recent attempts to show.
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// Block an address manually.
    Block {
        /// Address to block.
        address: IpAddr,

        /// Block duration in minutes.
        #[arg(short, long, default_value_t = DEFAULT_MANUAL_BLOCK_MINUTES)]
        minutes: u64,
    },

    /// Lift any block on an address.
    Unblock {
        /// Address to unblock.
        address: IpAddr,
    },

    /// Show block history.
    History {
        /// Only show blocks for this address.
        #[arg(short, long)]
        address: Option<IpAddr>,

        /// Maximum number of records.
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },

    /// Show aggregate statistics.
    Stats,

    /// Write a sample configuration file.
    InitConfig {
        /// Path to write the configuration to.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}
