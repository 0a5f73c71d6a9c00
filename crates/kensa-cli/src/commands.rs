//! CLI command implementations
//!
//! `plan` and `run` live here; configuration subcommands are in
//! `commands/config.rs`.

pub mod config;

use kensa_core::config::{
    MetadataConfiguration, RunConfiguration, ServerConfiguration, TerminologyConfiguration,
};
use kensa_core::terminology::registry;
use kensa_core::{
    ConfigLoader, HttpFhirClient, InMemoryTerminology, KensaConfiguration, KensaError,
    MetadataSet, Result, SuiteRunner, classify, compile_all,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::output::{OutputFormatter, PlanSummary};
use crate::{OutputFormat, RunOverrides};

/// Load the configuration file, or an empty configuration when none is found
pub fn load_config(config_path: Option<&Path>) -> Result<KensaConfiguration> {
    if let Some(path) = config_path {
        return ConfigLoader::load_from_file(path);
    }
    let cwd = std::env::current_dir().map_err(|e| KensaError::io_error(".", e))?;
    match ConfigLoader::auto_discover(&cwd)? {
        Some(path) => {
            debug!("Using config {}", path.display());
            ConfigLoader::load_from_file(&path)
        }
        None => {
            debug!("No config file found, using command-line values only");
            Ok(KensaConfiguration::default())
        }
    }
}

fn path_strings(paths: &[PathBuf]) -> Option<Vec<String>> {
    if paths.is_empty() {
        None
    } else {
        Some(paths.iter().map(|p| p.to_string_lossy().into_owned()).collect())
    }
}

impl RunOverrides {
    /// Command-line values as a configuration layered over `file`
    fn apply(self, file: KensaConfiguration) -> KensaConfiguration {
        let mut config = KensaConfiguration {
            schema: None,
            server: Some(ServerConfiguration {
                base_url: self.base_url,
                bearer_token: self.bearer_token,
                timeout_seconds: self.timeout,
            }),
            run: Some(RunConfiguration {
                patient_ids: (!self.patient_ids.is_empty()).then_some(self.patient_ids),
                max_references: self.max_references,
                post_search: self.no_post_search.then_some(false),
            }),
            metadata: Some(MetadataConfiguration {
                paths: path_strings(&self.metadata),
            }),
            terminology: Some(TerminologyConfiguration {
                value_set_directories: path_strings(&self.value_set_directories),
            }),
        };
        config.merge_with(file);
        config
    }
}

/// Keep only the named profiles, or all of them when `names` is empty
fn select_profiles(metadata: MetadataSet, names: &[String]) -> Result<MetadataSet> {
    if names.is_empty() {
        return Ok(metadata);
    }
    for name in names {
        if metadata.by_canonical_name(name).is_none() {
            return Err(KensaError::config_error(format!("Unknown profile '{name}'")));
        }
    }
    let profiles = metadata
        .profiles()
        .iter()
        .filter(|p| names.contains(&p.canonical_name))
        .cloned()
        .collect();
    Ok(MetadataSet::new(profiles))
}

/// Plan command implementation
pub fn plan_command(
    metadata_paths: Vec<PathBuf>,
    profiles: Vec<String>,
    format: OutputFormat,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let paths = if metadata_paths.is_empty() {
        load_config(config_path.as_deref())?.metadata_paths()
    } else {
        metadata_paths
    };
    if paths.is_empty() {
        return Err(KensaError::config_error(
            "No metadata given; pass --metadata or set metadata.paths in the config",
        ));
    }

    let metadata = MetadataSet::load_paths(&paths)?;
    info!("Loaded {} profiles", metadata.len());

    let delayed: Vec<bool> = classify(&metadata).iter().map(|c| c.delayed).collect();
    let mut summaries = Vec::new();
    let mut failures = Vec::new();
    for ((profile, (name, compiled)), delayed) in metadata
        .profiles()
        .iter()
        .zip(compile_all(&metadata))
        .zip(delayed)
    {
        if !profiles.is_empty() && !profiles.contains(&name) {
            continue;
        }
        match compiled {
            Ok(tests) => summaries.push(PlanSummary {
                profile: name,
                title: profile.display_title().to_string(),
                delayed,
                tests,
            }),
            Err(e) => failures.push((name, e.to_string())),
        }
    }

    OutputFormatter::new(format).print_plans(&summaries, &failures)?;

    if failures.is_empty() {
        Ok(())
    } else {
        Err(KensaError::construction(
            failures.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", "),
            "test plan could not be compiled",
        ))
    }
}

/// Run command implementation
pub async fn run_command(
    overrides: RunOverrides,
    profiles: Vec<String>,
    format: OutputFormat,
    output: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = overrides.apply(load_config(config_path.as_deref())?);
    config.validate_for_run()?;

    let metadata = select_profiles(MetadataSet::load_paths(&config.metadata_paths())?, &profiles)?;
    info!("Loaded {} profiles", metadata.len());

    let value_set_directories = config.value_set_directories();
    if !value_set_directories.is_empty() {
        let terminology = InMemoryTerminology::load_directories(&value_set_directories)?;
        info!("Loaded {} ValueSets", terminology.len());
        registry::init(Arc::new(terminology));
    }

    let base_url = config.base_url().unwrap_or_default();
    let client = HttpFhirClient::new(base_url, config.bearer_token(), config.timeout())?;

    let start = Instant::now();
    let report = SuiteRunner::new(&metadata, &client, config.run_options())
        .run()
        .await;
    debug!("Suite finished in {:?}", start.elapsed());

    OutputFormatter::new(format).print_report(&report, start.elapsed())?;

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json).map_err(|e| KensaError::io_error(&path, e))?;
        info!("Report written to {}", path.display());
    }

    if report.failed() {
        return Err(KensaError::execution_error(format!(
            "conformance run against {base_url} failed"
        )));
    }
    Ok(())
}
