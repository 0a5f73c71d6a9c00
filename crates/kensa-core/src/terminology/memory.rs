//! ValueSet validator backed by ValueSet resources loaded from disk

use super::{TerminologyError, TerminologyValidator};
use crate::error::KensaError;
use crate::result::Result;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone)]
struct ValueSetContents {
    /// `(system, code)` pairs from the expansion and explicit concepts
    codes: HashSet<(String, String)>,
    /// Systems included without a concept list
    whole_systems: HashSet<String>,
    /// Every system the ValueSet draws on
    systems: HashSet<String>,
}

impl ValueSetContents {
    fn contains(&self, code: &str, system: Option<&str>) -> bool {
        match system {
            Some(system) => {
                self.whole_systems.contains(system)
                    || self.codes.contains(&(system.to_string(), code.to_string()))
            }
            None => self.codes.iter().any(|(_, c)| c == code),
        }
    }
}

/// Terminology validator over an in-memory ValueSet index
#[derive(Debug, Default)]
pub struct InMemoryTerminology {
    value_sets: DashMap<String, ValueSetContents>,
    known_systems: DashSet<String>,
}

impl InMemoryTerminology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every ValueSet JSON file under the given directories
    pub fn load_directories(directories: &[PathBuf]) -> Result<Self> {
        let terminology = Self::new();
        for directory in directories {
            for entry in WalkDir::new(directory)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                terminology.load_file(path)?;
            }
        }
        debug!("Loaded {} ValueSets", terminology.len());
        Ok(terminology)
    }

    fn load_file(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| KensaError::io_error(path, e))?;
        let resource: Value = serde_json::from_str(&content)
            .map_err(|e| KensaError::terminology_error(format!("{}: {e}", path.display())))?;
        match resource.get("resourceType").and_then(Value::as_str) {
            Some("ValueSet") => self.add_value_set(&resource),
            Some("Bundle") => {
                for entry in resource
                    .get("entry")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|e| e.get("resource"))
                    .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some("ValueSet"))
                {
                    self.add_value_set(entry)?;
                }
                Ok(())
            }
            _ => {
                warn!("Skipping {}: not a ValueSet", path.display());
                Ok(())
            }
        }
    }

    /// Index one ValueSet resource
    pub fn add_value_set(&self, value_set: &Value) -> Result<()> {
        let url = value_set
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| KensaError::terminology_error("ValueSet has no url"))?;

        let mut contents = ValueSetContents::default();
        if let Some(contains) = value_set.pointer("/expansion/contains") {
            collect_expansion(contains, &mut contents);
        }
        for include in value_set
            .pointer("/compose/include")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(system) = include.get("system").and_then(Value::as_str) else {
                continue;
            };
            contents.systems.insert(system.to_string());
            match include.get("concept").and_then(Value::as_array) {
                Some(concepts) => {
                    let codes = concepts
                        .iter()
                        .filter_map(|c| c.get("code").and_then(Value::as_str));
                    for code in codes {
                        contents.codes.insert((system.to_string(), code.to_string()));
                    }
                }
                None if include.get("filter").is_none() => {
                    contents.whole_systems.insert(system.to_string());
                }
                None => {}
            }
        }

        for system in &contents.systems {
            self.known_systems.insert(system.clone());
        }
        self.value_sets.insert(url.to_string(), contents);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.value_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value_sets.is_empty()
    }
}

fn collect_expansion(contains: &Value, contents: &mut ValueSetContents) {
    for item in contains.as_array().into_iter().flatten() {
        if let (Some(system), Some(code)) = (
            item.get("system").and_then(Value::as_str),
            item.get("code").and_then(Value::as_str),
        ) {
            contents.systems.insert(system.to_string());
            contents.codes.insert((system.to_string(), code.to_string()));
        }
        if let Some(nested) = item.get("contains") {
            collect_expansion(nested, contents);
        }
    }
}

impl TerminologyValidator for InMemoryTerminology {
    fn validate_code(
        &self,
        value_set: &str,
        code: Option<&str>,
        system: Option<&str>,
    ) -> std::result::Result<bool, TerminologyError> {
        // Canonical references may carry a `|version` suffix
        let url = value_set.split('|').next().unwrap_or(value_set);
        let contents = self
            .value_sets
            .get(url)
            .ok_or_else(|| TerminologyError::UnknownValueSet(url.to_string()))?;

        if let Some(system) = system
            && !self.known_systems.contains(system)
        {
            return Err(TerminologyError::UnknownCodeSystem(system.to_string()));
        }

        Ok(match (code, system) {
            (Some(code), system) => contents.contains(code, system),
            (None, Some(system)) => contents.systems.contains(system),
            (None, None) => false,
        })
    }
}
