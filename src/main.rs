// ABOUTME: Main entry point for the mcp-resilience command line tool
//
// Binary: mcp-resilience
// Usage: mcp-resilience <COMMAND>
// - defaults: print the default settings (TOML or JSON)
// - check: validate a settings file and summarize it

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;

use mcp_resilience::cli::{self, Commands};
use mcp_resilience::config::{LogFormat, LoggingConfig};
use mcp_resilience::logging::init_logging;

fn main() -> Result<()> {
    let args = cli::Cli::parse();

    init_logging(&LoggingConfig {
        level: args.log_level.clone(),
        format: LogFormat::Pretty,
        file: None,
    })
    .context("Failed to initialize logging")?;
    setup_panic_handler();

    match &args.command {
        Commands::Defaults(defaults_args) => cli::defaults::execute(defaults_args),
        Commands::Check(check_args) => cli::check::execute(check_args),
    }
}

fn setup_panic_handler() {
    use tracing::error;

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        error!("Application panicked: {}", panic_info);
        default_hook(panic_info);
    }));
}
