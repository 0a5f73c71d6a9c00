//! Delayed-sequence and delayed-reference classification
//!
//! A profile is *delayed* when its resources cannot be found by a direct
//! patient-scoped search. Delayed profiles are tested by reading resources
//! whose references were discovered while testing the other profiles, so
//! every non-delayed profile needs to know which of its reference elements
//! point at delayed profiles.
//!
//! Both functions are total and pure over the metadata collection.

use crate::metadata::{MetadataSet, ProfileMetadata, relative_path};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Resource types that are always tested through references
static ALWAYS_DELAYED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "Encounter",
        "Location",
        "Organization",
        "Practitioner",
        "PractitionerRole",
        "Provenance",
    ])
});

/// A reference element pointing at one or more delayed resource types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelayedReference {
    /// Element path relative to the referencing resource
    pub path: String,
    pub resources: Vec<String>,
}

/// A profile together with its derived classification
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedProfile<'a> {
    pub profile: &'a ProfileMetadata,
    pub delayed: bool,
    pub delayed_references: Vec<DelayedReference>,
}

/// Whether the profile has no direct patient search
pub fn is_delayed(profile: &ProfileMetadata, _all: &MetadataSet) -> bool {
    if profile.resource_type == "Patient" {
        return false;
    }
    ALWAYS_DELAYED.contains(profile.resource_type.as_str()) || !profile.has_patient_search()
}

/// Reference elements of `profile` that target delayed profiles in `all`
pub fn delayed_references(profile: &ProfileMetadata, all: &MetadataSet) -> Vec<DelayedReference> {
    let delayed_urls: HashSet<&str> = all
        .profiles()
        .iter()
        .filter(|p| is_delayed(p, all))
        .map(|p| p.profile_url.as_str())
        .collect();

    profile
        .references
        .iter()
        .filter_map(|reference| {
            let mut resources: Vec<String> = Vec::new();
            for url in &reference.profiles {
                if !delayed_urls.contains(url.as_str()) {
                    continue;
                }
                if let Some(target) = all.by_url(url)
                    && !resources.contains(&target.resource_type)
                {
                    resources.push(target.resource_type.clone());
                }
            }
            (!resources.is_empty()).then(|| DelayedReference {
                path: relative_path(&reference.path).to_string(),
                resources,
            })
        })
        .collect()
}

/// Classify every profile in the collection
pub fn classify(all: &MetadataSet) -> Vec<ClassifiedProfile<'_>> {
    all.profiles()
        .iter()
        .map(|profile| ClassifiedProfile {
            profile,
            delayed: is_delayed(profile, all),
            delayed_references: delayed_references(profile, all),
        })
        .collect()
}
