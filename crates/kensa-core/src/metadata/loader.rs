//! Loading profile metadata documents from disk

use super::ProfileMetadata;
use crate::error::KensaError;
use crate::result::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Accepted document shapes: a single profile, a bare list, or `{profiles: [...]}`
#[derive(Deserialize)]
#[serde(untagged)]
enum MetadataDocument {
    Set { profiles: Vec<ProfileMetadata> },
    Many(Vec<ProfileMetadata>),
    One(Box<ProfileMetadata>),
}

impl MetadataDocument {
    fn into_profiles(self) -> Vec<ProfileMetadata> {
        match self {
            MetadataDocument::Set { profiles } | MetadataDocument::Many(profiles) => profiles,
            MetadataDocument::One(profile) => vec![*profile],
        }
    }
}

/// The full collection of profiles from one Implementation Guide
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSet {
    profiles: Vec<ProfileMetadata>,
}

impl MetadataSet {
    pub fn new(profiles: Vec<ProfileMetadata>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &[ProfileMetadata] {
        &self.profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn by_url(&self, url: &str) -> Option<&ProfileMetadata> {
        self.profiles.iter().find(|p| p.profile_url == url)
    }

    pub fn by_canonical_name(&self, name: &str) -> Option<&ProfileMetadata> {
        self.profiles.iter().find(|p| p.canonical_name == name)
    }

    /// First profile constraining the given resource type
    pub fn by_resource_type(&self, resource_type: &str) -> Option<&ProfileMetadata> {
        self.profiles
            .iter()
            .find(|p| p.resource_type == resource_type)
    }

    /// Parse a single document (JSON or YAML, chosen by extension)
    pub fn parse_document(path: &Path, content: &str) -> Result<Vec<ProfileMetadata>> {
        let document: MetadataDocument = match extension(path).as_deref() {
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)
                .map_err(|e| KensaError::metadata_error(path, e.to_string()))?,
            _ => serde_json::from_str(content)
                .map_err(|e| KensaError::metadata_error(path, e.to_string()))?,
        };
        Ok(document.into_profiles())
    }

    /// Load every metadata document under the given files or directories
    ///
    /// Directories are walked recursively in sorted order so that the
    /// resulting profile order (and therefore compiled plans) is stable.
    pub fn load_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut profiles = Vec::new();

        for path in paths {
            if path.is_dir() {
                let mut files: Vec<PathBuf> = WalkDir::new(path)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_file())
                    .map(|entry| entry.into_path())
                    .filter(|p| is_metadata_file(p))
                    .collect();
                files.sort();
                for file in files {
                    profiles.extend(Self::load_file(&file)?);
                }
            } else {
                profiles.extend(Self::load_file(path)?);
            }
        }

        let mut set = Self::new(Vec::new());
        for profile in profiles {
            if set.by_canonical_name(&profile.canonical_name).is_some() {
                warn!(
                    "Duplicate profile '{}' ignored",
                    profile.canonical_name
                );
                continue;
            }
            set.profiles.push(profile);
        }

        debug!("Loaded {} profile metadata documents", set.len());
        Ok(set)
    }

    fn load_file(path: &Path) -> Result<Vec<ProfileMetadata>> {
        let content =
            std::fs::read_to_string(path).map_err(|e| KensaError::io_error(path, e))?;
        let profiles = Self::parse_document(path, &content)?;
        debug!(
            "Read {} profile(s) from {}",
            profiles.len(),
            path.display()
        );
        Ok(profiles)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn is_metadata_file(path: &Path) -> bool {
    matches!(
        extension(path).as_deref(),
        Some("json") | Some("yaml") | Some("yml")
    )
}
