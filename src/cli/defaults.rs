// ABOUTME: CLI defaults command - print the default settings file

use super::{DefaultsArgs, SettingsFormat};
use crate::config::Settings;
use anyhow::{Context, Result};

/// Execute the defaults command
pub fn execute(args: &DefaultsArgs) -> Result<()> {
    let rendered = render(&Settings::default(), args.format)?;
    println!("{rendered}");
    Ok(())
}

/// Serialize settings in the requested syntax
pub fn render(settings: &Settings, format: SettingsFormat) -> Result<String> {
    match format {
        SettingsFormat::Toml => {
            toml::to_string_pretty(settings).context("Failed to serialize settings as TOML")
        }
        SettingsFormat::Json => {
            serde_json::to_string_pretty(settings).context("Failed to serialize settings as JSON")
        }
    }
}
