// ABOUTME: Settings file loading (TOML or JSON) followed by semantic validation

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use super::validation::{validate_settings, ValidationError};
use super::Settings;

/// Supported settings file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Infer the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Errors that can occur while loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or type error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON syntax or type error
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Extension is neither `.toml` nor `.json`
    #[error("Unsupported settings format: {0}")]
    UnsupportedFormat(String),

    /// The settings parsed but are not usable
    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate settings from a `.toml` or `.json` file
pub fn load_from_path(path: &Path) -> Result<Settings, ConfigError> {
    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| ConfigError::UnsupportedFormat(path.display().to_string()))?;
    let content = fs::read_to_string(path)?;
    debug!(path = %path.display(), ?format, "Loading settings");
    load_from_str(&content, format)
}

/// Parse and validate settings from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Settings, ConfigError> {
    let settings: Settings = match format {
        ConfigFormat::Toml => toml::from_str(content)?,
        ConfigFormat::Json => serde_json::from_str(content)?,
    };

    validate_settings(&settings).map_err(ConfigError::Validation)?;
    Ok(settings)
}
