// ABOUTME: CLI argument parsing and command routing for mcp-resilience
//
// Provides command-line interface for:
// - Printing the default settings as a starting point (defaults)
// - Validating a settings file and summarizing it (check)

pub mod check;
pub mod defaults;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Resilience layer for MCP upstream servers
#[derive(Parser)]
#[command(name = "mcp-resilience")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "mcp_resilience=warn")]
    pub log_level: String,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Print the default settings
    Defaults(DefaultsArgs),

    /// Load and validate a settings file
    Check(CheckArgs),
}

/// Serialization used by `defaults`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SettingsFormat {
    #[default]
    Toml,
    Json,
}

/// Output format for `check`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Arguments for the defaults command
#[derive(clap::Args)]
pub struct DefaultsArgs {
    /// Settings file syntax
    #[arg(long, default_value = "toml")]
    pub format: SettingsFormat,
}

/// Arguments for the check command
#[derive(clap::Args)]
pub struct CheckArgs {
    /// Settings file (.toml or .json)
    pub file: PathBuf,

    /// Output format
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}
