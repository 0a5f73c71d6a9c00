//! Configuration file discovery and loading

use super::KensaConfiguration;
use crate::error::KensaError;
use crate::result::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// File names searched for in each directory, in priority order
pub const CONFIG_FILE_NAMES: [&str; 5] = [
    ".kensarc.json",
    ".kensarc.toml",
    "kensa.yaml",
    "kensa.yml",
    "kensa.json",
];

/// Configuration loader for discovering and loading config files
pub struct ConfigLoader;

impl ConfigLoader {
    /// Auto-discover a config file by traversing upward from `start_path`
    ///
    /// Each directory is checked for [`CONFIG_FILE_NAMES`] in order until a
    /// config is found or the filesystem root is reached.
    pub fn auto_discover(start_path: &Path) -> Result<Option<PathBuf>> {
        let mut current = start_path
            .canonicalize()
            .map_err(|e| KensaError::config_error(format!("Invalid path: {e}")))?;

        loop {
            for filename in &CONFIG_FILE_NAMES {
                let config_path = current.join(filename);
                if config_path.is_file() {
                    tracing::debug!("Found config: {}", config_path.display());
                    return Ok(Some(config_path));
                }
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }

    /// Load configuration from a specific file
    ///
    /// Supports JSON, TOML and YAML. Relative paths inside the file are
    /// resolved against the file's directory.
    pub fn load_from_file(path: &Path) -> Result<KensaConfiguration> {
        let content = fs::read_to_string(path).map_err(|e| KensaError::io_error(path, e))?;
        let parse_error = |e: &dyn std::fmt::Display| {
            KensaError::config_error(format!(
                "Failed to load config from '{}': {}",
                path.display(),
                e
            ))
        };

        let mut config: KensaConfiguration = match extension(path).as_deref() {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| parse_error(&e))?
            }
            Some("toml") => toml::from_str(&content).map_err(|e| parse_error(&e))?,
            Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(&e))?,
            _ => {
                return Err(parse_error(
                    &"unsupported file extension (expected .json, .toml, .yaml or .yml)",
                ));
            }
        };

        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Load config from `custom_path`, or auto-discover from `start_dir`
    pub fn load(
        custom_path: Option<&Path>,
        start_dir: Option<&Path>,
    ) -> Result<KensaConfiguration> {
        let config_path = match custom_path {
            Some(path) => {
                if !path.exists() {
                    return Err(KensaError::config_error(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => {
                let search_dir = start_dir.unwrap_or_else(|| Path::new("."));
                Self::auto_discover(search_dir)?.ok_or_else(|| {
                    KensaError::config_error(format!(
                        "No config file found ({}). Run 'kensa config init' to create one",
                        CONFIG_FILE_NAMES.join(", ")
                    ))
                })?
            }
        };

        Self::load_from_file(&config_path)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}
