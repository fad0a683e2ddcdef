// ABOUTME: CLI check command - validate a settings file and summarize it
//
// Loads the file through the same path the library uses, so every validation
// error is reported at once. Prints the effective pool settings and servers.

use super::{CheckArgs, OutputFormat};
use crate::config::{load_from_path, Settings};
use anyhow::{Context, Result};
use std::fmt::Write as _;

/// Execute the check command
pub fn execute(args: &CheckArgs) -> Result<()> {
    let settings = load_from_path(&args.file)
        .with_context(|| format!("Invalid settings file {}", args.file.display()))?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&settings)?),
        OutputFormat::Text => print!("{}", summarize(&settings)),
    }
    Ok(())
}

/// Human-readable summary of loaded settings
pub fn summarize(settings: &Settings) -> String {
    let pool = &settings.pool;
    let resilience = &pool.resilience;
    let mut out = String::new();

    // Writing to a String cannot fail
    let _ = writeln!(out, "Settings OK ({} servers)", settings.servers.len());
    let _ = writeln!(
        out,
        "  routing: {:?}, failover: {:?}, health threshold {}",
        pool.load_balancing, pool.failover, pool.health_threshold
    );
    let _ = writeln!(
        out,
        "  requests: {} concurrent, {} queued, timeout {}ms",
        pool.max_concurrent_requests,
        pool.max_queue_size,
        pool.request_timeout.as_millis()
    );
    let _ = writeln!(
        out,
        "  breaker: {} failures, recovery {}ms; retry: {} attempts",
        resilience.circuit_breaker.failure_threshold,
        resilience.circuit_breaker.recovery_timeout.as_millis(),
        resilience.retry.max_retry_attempts
    );
    let _ = writeln!(
        out,
        "  health: {:?} every {}ms; degraded mode {}",
        resilience.health_check.strategy,
        resilience.health_check.interval.as_millis(),
        if resilience.degraded_mode.enabled { "on" } else { "off" }
    );

    for server in &settings.servers {
        let overrides = if server.resilience.is_some() { " (overrides)" } else { "" };
        let _ = writeln!(
            out,
            "  - {}: {} {}{overrides}",
            server.name,
            server.command,
            server.args.join(" ")
        );
    }
    out
}
