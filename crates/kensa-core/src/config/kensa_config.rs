//! Configuration types for kensa

use crate::error::KensaError;
use crate::harness::RunOptions;
use crate::result::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Request timeout used when none is configured
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KensaConfiguration {
    /// JSON schema reference for editor support
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminology: Option<TerminologyConfiguration>,
}

/// Server under test
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    #[schemars(description = "FHIR base URL of the server under test")]
    pub base_url: Option<String>,

    #[schemars(description = "Static bearer token sent with every request")]
    pub bearer_token: Option<String>,

    #[schemars(description = "Request timeout in seconds")]
    pub timeout_seconds: Option<u64>,
}

/// Test run settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfiguration {
    #[schemars(description = "Ids of the patients whose data is searched")]
    pub patient_ids: Option<Vec<String>>,

    #[schemars(description = "Maximum number of references read by reference resolution tests")]
    pub max_references: Option<usize>,

    #[schemars(description = "Repeat first searches with POST and compare results")]
    pub post_search: Option<bool>,
}

/// Where profile metadata is loaded from
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataConfiguration {
    #[schemars(description = "Metadata files or directories (JSON or YAML)")]
    pub paths: Option<Vec<String>>,
}

/// Local terminology used for binding checks
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminologyConfiguration {
    #[schemars(description = "Directories of ValueSet and Bundle JSON files")]
    pub value_set_directories: Option<Vec<String>>,
}

impl KensaConfiguration {
    /// Configuration written by `kensa config init`
    pub fn example() -> Self {
        Self {
            schema: None,
            server: Some(ServerConfiguration {
                base_url: Some("http://localhost:8080/fhir".to_string()),
                bearer_token: None,
                timeout_seconds: Some(DEFAULT_TIMEOUT_SECONDS),
            }),
            run: Some(RunConfiguration {
                patient_ids: Some(vec!["85".to_string(), "355".to_string()]),
                max_references: None,
                post_search: Some(true),
            }),
            metadata: Some(MetadataConfiguration {
                paths: Some(vec!["metadata".to_string()]),
            }),
            terminology: Some(TerminologyConfiguration {
                value_set_directories: Some(vec!["terminology".to_string()]),
            }),
        }
    }

    /// JSON schema of the configuration file
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(KensaConfiguration)).unwrap_or_default()
    }

    /// Merge another config into this one (current takes precedence)
    pub fn merge_with(&mut self, other: KensaConfiguration) {
        if self.schema.is_none() {
            self.schema = other.schema;
        }

        if let Some(other_server) = other.server {
            let server = self.server.get_or_insert_with(Default::default);
            server.base_url = server.base_url.take().or(other_server.base_url);
            server.bearer_token = server.bearer_token.take().or(other_server.bearer_token);
            server.timeout_seconds = server.timeout_seconds.or(other_server.timeout_seconds);
        }

        if let Some(other_run) = other.run {
            let run = self.run.get_or_insert_with(Default::default);
            run.patient_ids = run.patient_ids.take().or(other_run.patient_ids);
            run.max_references = run.max_references.or(other_run.max_references);
            run.post_search = run.post_search.or(other_run.post_search);
        }

        if let Some(other_metadata) = other.metadata {
            let metadata = self.metadata.get_or_insert_with(Default::default);
            metadata.paths = metadata.paths.take().or(other_metadata.paths);
        }

        if let Some(other_terminology) = other.terminology {
            let terminology = self.terminology.get_or_insert_with(Default::default);
            terminology.value_set_directories = terminology
                .value_set_directories
                .take()
                .or(other_terminology.value_set_directories);
        }
    }

    /// Resolve relative metadata and terminology paths against `base_dir`
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let resolve = |paths: &mut Option<Vec<String>>| {
            if let Some(paths) = paths {
                for path in paths.iter_mut() {
                    if Path::new(path.as_str()).is_relative() {
                        *path = base_dir.join(path.as_str()).to_string_lossy().into_owned();
                    }
                }
            }
        };
        if let Some(metadata) = &mut self.metadata {
            resolve(&mut metadata.paths);
        }
        if let Some(terminology) = &mut self.terminology {
            resolve(&mut terminology.value_set_directories);
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        self.server.as_ref()?.base_url.as_deref()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.server.as_ref()?.bearer_token.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        let seconds = self
            .server
            .as_ref()
            .and_then(|s| s.timeout_seconds)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        Duration::from_secs(seconds)
    }

    pub fn metadata_paths(&self) -> Vec<PathBuf> {
        self.metadata
            .as_ref()
            .and_then(|m| m.paths.as_ref())
            .map(|paths| paths.iter().map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    pub fn value_set_directories(&self) -> Vec<PathBuf> {
        self.terminology
            .as_ref()
            .and_then(|t| t.value_set_directories.as_ref())
            .map(|dirs| dirs.iter().map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    /// Run options with defaults applied
    pub fn run_options(&self) -> RunOptions {
        let run = self.run.clone().unwrap_or_default();
        RunOptions {
            patient_ids: run.patient_ids.unwrap_or_default(),
            max_references: run.max_references,
            post_search: run.post_search.unwrap_or(true),
        }
    }

    /// Check the settings a test run cannot do without
    pub fn validate_for_run(&self) -> Result<()> {
        if self.base_url().is_none_or(|url| url.trim().is_empty()) {
            return Err(KensaError::config_error("server.baseUrl is required"));
        }
        if self.metadata_paths().is_empty() {
            return Err(KensaError::config_error(
                "metadata.paths must name at least one file or directory",
            ));
        }
        if self.run_options().patient_ids.is_empty() {
            return Err(KensaError::config_error("run.patientIds must name at least one patient"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_camel_case() {
        let config: KensaConfiguration = serde_json::from_str(
            r#"{
                "server": { "baseUrl": "http://fhir.test/r4", "timeoutSeconds": 5 },
                "run": { "patientIds": ["85"], "postSearch": false },
                "metadata": { "paths": ["meta"] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.base_url(), Some("http://fhir.test/r4"));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        let options = config.run_options();
        assert_eq!(options.patient_ids, vec!["85"]);
        assert!(!options.post_search);
        assert!(config.validate_for_run().is_ok());
    }

    #[test]
    fn test_merge_current_takes_precedence() {
        let mut overrides = KensaConfiguration {
            server: Some(ServerConfiguration {
                base_url: Some("http://override".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        overrides.merge_with(KensaConfiguration::example());

        assert_eq!(overrides.base_url(), Some("http://override"));
        assert_eq!(overrides.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));
        assert_eq!(overrides.run_options().patient_ids, vec!["85", "355"]);
    }

    #[test]
    fn test_validate_for_run_requires_base_url() {
        let config = KensaConfiguration::default();
        let err = config.validate_for_run().unwrap_err();
        assert!(err.to_string().contains("baseUrl"));
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = KensaConfiguration::example();
        config.resolve_paths(Path::new("/project"));
        assert_eq!(config.metadata_paths(), vec![PathBuf::from("/project/metadata")]);
    }

    #[test]
    fn test_json_schema_names_sections() {
        let schema = KensaConfiguration::json_schema();
        let properties = &schema["properties"];
        assert!(properties.get("server").is_some());
        assert!(properties.get("run").is_some());
    }
}
