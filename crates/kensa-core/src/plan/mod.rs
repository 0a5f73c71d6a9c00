//! Test plans
//!
//! A [`TestSpecification`] is data: an ordered [`Procedure`] of [`Step`]s
//! that the execution harness interprets. Plans are produced by
//! [`compile`] and never modified afterwards.

mod compiler;

pub use compiler::{compile, compile_all};

use crate::classifier::DelayedReference;
use crate::metadata::{
    BindingDescriptor, Comparator, InteractionCode, MustSupportSet, SearchValueType,
};
use crate::resolver::SearchStrategy;
use serde::{Deserialize, Serialize};

/// One test of a profile's plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpecification {
    /// `<canonicalName>_<suffix>_test`
    pub key: String,
    /// 1-based position within the profile's plan
    pub index: usize,
    pub title: String,
    pub description: String,
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub procedure: Procedure,
}

/// Ordered steps of one test
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub steps: Vec<Step>,
}

impl Procedure {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn searches(&self) -> impl Iterator<Item = &SearchStep> {
        self.steps.iter().filter_map(|step| match step {
            Step::Search(search) => Some(search),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "with", rename_all = "camelCase")]
pub enum Step {
    /// Skip the rest of the test when the guard holds
    SkipIf(Guard),
    /// Omit the rest of the test when the guard holds
    OmitIf(Guard),
    Search(SearchStep),
    Read(ReadStep),
    Validate(Validation),
    Capture(Capture),
    Assert(Assertion),
    /// Not exercised; the test ends as `todo`
    Todo(String),
}

/// Preconditions checked against sequence state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Guard {
    /// Always holds; the message says why
    Always { message: String },
    /// The first search captured no resources
    NoResourcesFound,
    /// No other profile referenced a resource of this type
    NoDiscoveredReferences,
    /// No captured resource has a non-contained reference at `path`
    NoExternalReferences { path: String },
    /// No resource of `resource_type` was returned through `_include`
    #[serde(rename_all = "camelCase")]
    NoIncludedResources { resource_type: String },
}

/// Searches, each issued once per patient unless stated otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SearchStep {
    /// The search under test; later steps of the test reuse its parameters
    #[serde(rename_all = "camelCase")]
    Primary {
        names: Vec<String>,
        strategy: SearchStrategy,
        /// Retry 400 responses with status values
        status_retry: bool,
        /// Seeds the sequence: an empty result skips instead of failing
        first: bool,
    },
    /// Repeat the primary searches with POST and compare results
    PostEquivalence,
    /// Repeat with `param=Patient/<id>` instead of the bare id
    ReferenceVariant { param: String },
    /// Repeat with `param=system|code` and check every entry matches
    SystemQualified { param: String },
    /// Repeat with a comparator-prefixed date for `param`
    Comparator { param: String, comparator: Comparator },
    /// Search `param` with two comma-joined values found in captured resources
    #[serde(rename_all = "camelCase")]
    MultipleOr { names: Vec<String>, param: String },
    /// Search by a property of a referenced resource
    #[serde(rename_all = "camelCase")]
    Chained {
        param: String,
        chain: String,
        target: String,
        target_path: String,
        value_type: SearchValueType,
    },
    /// First-search parameters plus `_include`
    #[serde(rename_all = "camelCase")]
    Include { include: String, target: String },
    /// First-search parameters plus `_revinclude`
    #[serde(rename_all = "camelCase")]
    Revinclude { revinclude: String, source: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReadStep {
    /// Read every reference to this resource type discovered by other profiles
    DiscoveredReferences,
    /// Perform an interaction on a captured resource
    Interaction { code: InteractionCode },
    /// Read up to `limit` distinct references found in captured resources
    References { limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Validation {
    /// Every returned entry matches the parameters it was searched with
    SearchResults,
    /// Required and extensible bindings of captured resources
    #[serde(rename_all = "camelCase")]
    Bindings {
        bindings: Vec<BindingDescriptor>,
        required_concepts: Vec<String>,
    },
    /// Bindings of included and contained Medications
    MedicationBindings { bindings: Vec<BindingDescriptor> },
    MustSupport { elements: MustSupportSet },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Capture {
    /// Store the test's resources as the sequence's captured resources
    Resources,
    /// Record references to delayed profiles found in captured resources
    DelayedReferences { references: Vec<DelayedReference> },
    /// Record resources of `resource_type` returned by `_revinclude`
    #[serde(rename_all = "camelCase")]
    Revincluded { resource_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Assertion {
    /// At least one `target` resource was included, across all patients
    IncludedFound { target: String },
    /// At least one `source` resource was returned by `_revinclude`
    RevincludedFound { source: String },
}
