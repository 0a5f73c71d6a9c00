//! Configuration management subcommands

use kensa_core::{KensaConfiguration, KensaError, Result};
use std::path::PathBuf;
use tracing::{debug, error};

use super::load_config;
use crate::ConfigFormat;

/// Config init command implementation
pub fn init_command(format: ConfigFormat, force: bool) -> Result<()> {
    debug!("Initializing configuration file with format: {:?}", format);

    let filename = match format {
        ConfigFormat::Json => ".kensarc.json",
        ConfigFormat::Toml => ".kensarc.toml",
        ConfigFormat::Yaml => "kensa.yaml",
    };
    let config_path = PathBuf::from(filename);

    if config_path.exists() && !force {
        error!(
            "Configuration file '{}' already exists. Use --force to overwrite.",
            filename
        );
        return Err(KensaError::config_error(format!(
            "Configuration file '{filename}' already exists"
        )));
    }

    let content = render(&KensaConfiguration::example(), format)?;
    std::fs::write(&config_path, content).map_err(|e| KensaError::io_error(&config_path, e))?;

    println!("Created {filename}");
    Ok(())
}

fn render(config: &KensaConfiguration, format: ConfigFormat) -> Result<String> {
    match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)
            .map_err(|e| KensaError::config_error(format!("Failed to serialize JSON: {e}"))),
        ConfigFormat::Toml => toml::to_string_pretty(config)
            .map_err(|e| KensaError::config_error(format!("Failed to serialize TOML: {e}"))),
        ConfigFormat::Yaml => serde_yaml::to_string(config)
            .map_err(|e| KensaError::config_error(format!("Failed to serialize YAML: {e}"))),
    }
}

/// Config show command implementation
pub fn show_command(schema: bool, config_path: Option<PathBuf>) -> Result<()> {
    let value = if schema {
        KensaConfiguration::json_schema()
    } else {
        serde_json::to_value(load_config(config_path.as_deref())?)?
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
