// ABOUTME: Tracing subscriber setup for the binary and embedding applications
//
// JSON lines by default (one object per event, target included) or human-readable
// output. `RUST_LOG` wins over the configured level. Output goes to stderr unless
// a log file is configured, in which case lines are appended to it.

use std::fs::{self, OpenOptions};
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log file or its directory could not be opened
    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    /// The configured level is not a valid filter directive
    #[error("Invalid log filter '{0}'")]
    Filter(String),

    /// A global subscriber is already installed
    #[error("Logging already initialized")]
    AlreadyInitialized,
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|_| LoggingError::Filter(config.level.clone()))
}

/// Install the global tracing subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;

    let writer = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(Arc::new(file))
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = config.file.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}
