//! Profile metadata model
//!
//! A [`ProfileMetadata`] document is the canonical, extractor-produced
//! description of one clinical profile: which searches and interactions a
//! server must support, which elements are must-support, which elements are
//! bound to value sets and which other profiles its references point at.
//! Everything the test plan compiler decides is derived from these documents.
//!
//! Documents are loaded once per Implementation Guide and never mutated.

mod binding;
mod loader;

pub use binding::{BindingDescriptor, BindingStrength};
pub use loader::MetadataSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// RFC 2119 conformance level
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Expectation {
    #[serde(rename = "SHALL", alias = "shall")]
    Shall,
    #[serde(rename = "SHOULD", alias = "should")]
    Should,
    #[serde(rename = "MAY", alias = "may")]
    May,
}

impl Expectation {
    /// SHALL and SHOULD are tested, MAY is not
    pub fn is_tested(&self) -> bool {
        matches!(self, Expectation::Shall | Expectation::Should)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Expectation::Shall => "SHALL",
            Expectation::Should => "SHOULD",
            Expectation::May => "MAY",
        }
    }
}

/// Element type of a search parameter's target, as far as value resolution
/// and response validation care
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SearchValueType {
    CodeableConcept,
    Reference,
    Period,
    Identifier,
    Coding,
    HumanName,
    Address,
    Date,
    Token,
    Other(String),
}

impl SearchValueType {
    pub fn as_str(&self) -> &str {
        match self {
            SearchValueType::CodeableConcept => "CodeableConcept",
            SearchValueType::Reference => "Reference",
            SearchValueType::Period => "Period",
            SearchValueType::Identifier => "Identifier",
            SearchValueType::Coding => "Coding",
            SearchValueType::HumanName => "HumanName",
            SearchValueType::Address => "Address",
            SearchValueType::Date => "date",
            SearchValueType::Token => "token",
            SearchValueType::Other(name) => name,
        }
    }

    /// Types whose values can be qualified as `system|code`
    pub fn is_token(&self) -> bool {
        matches!(
            self,
            SearchValueType::CodeableConcept
                | SearchValueType::Coding
                | SearchValueType::Identifier
        )
    }

    /// Types compared with date-range semantics
    pub fn is_date(&self) -> bool {
        matches!(self, SearchValueType::Date | SearchValueType::Period)
    }
}

impl From<String> for SearchValueType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CodeableConcept" => SearchValueType::CodeableConcept,
            "Reference" => SearchValueType::Reference,
            "Period" => SearchValueType::Period,
            "Identifier" => SearchValueType::Identifier,
            "Coding" => SearchValueType::Coding,
            "HumanName" => SearchValueType::HumanName,
            "Address" => SearchValueType::Address,
            "date" | "dateTime" | "instant" => SearchValueType::Date,
            "token" | "code" => SearchValueType::Token,
            _ => SearchValueType::Other(value),
        }
    }
}

impl From<SearchValueType> for String {
    fn from(value: SearchValueType) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for SearchValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search prefix comparators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Sa,
    Eb,
    Ap,
}

impl Comparator {
    pub const ALL: [Comparator; 9] = [
        Comparator::Eq,
        Comparator::Ne,
        Comparator::Gt,
        Comparator::Lt,
        Comparator::Ge,
        Comparator::Le,
        Comparator::Sa,
        Comparator::Eb,
        Comparator::Ap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::Eq => "eq",
            Comparator::Ne => "ne",
            Comparator::Gt => "gt",
            Comparator::Lt => "lt",
            Comparator::Ge => "ge",
            Comparator::Le => "le",
            Comparator::Sa => "sa",
            Comparator::Eb => "eb",
            Comparator::Ap => "ap",
        }
    }

    /// Split a leading comparator prefix off a search value
    pub fn split_prefix(value: &str) -> (Comparator, &str) {
        if value.len() > 2 && value.is_char_boundary(2) {
            let (prefix, rest) = value.split_at(2);
            if let Some(comparator) = Self::ALL.iter().find(|c| c.as_str() == prefix)
                && rest.starts_with(|c: char| c.is_ascii_digit())
            {
                return (*comparator, rest);
            }
        }
        (Comparator::Eq, value)
    }
}

/// One supported search: the set of parameter names used together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParameterDescriptor {
    pub names: Vec<String>,
    pub expectation: Expectation,
}

impl SearchParameterDescriptor {
    pub fn includes(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Exactly `["patient"]`
    pub fn is_patient_only(&self) -> bool {
        self.names.len() == 1 && self.names[0] == "patient"
    }

    pub fn joined_names(&self, separator: &str) -> String {
        self.names.join(separator)
    }
}

/// A chained parameter (e.g. `practitioner.name`) hanging off a reference
/// search parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDescriptor {
    /// Parameter on the target resource (`name`, `identifier`)
    pub chain: String,
    /// Target resource type
    pub target: String,
    /// Element path on the target resource
    pub path: String,
    #[serde(rename = "type")]
    pub value_type: SearchValueType,
    pub expectation: Expectation,
}

/// Per-parameter search details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParamDefinition {
    /// FHIR element path, including the resource type prefix
    pub path: String,
    #[serde(rename = "type")]
    pub value_type: SearchValueType,
    #[serde(default)]
    pub comparators: IndexMap<Comparator, Expectation>,
    #[serde(default)]
    pub chain: Vec<ChainDescriptor>,
    #[serde(default)]
    pub multiple_or: Option<Expectation>,
    /// Declared acceptable values (fixed-value searches, status retries)
    #[serde(default)]
    pub values: Vec<String>,
}

impl SearchParamDefinition {
    /// Comparators declared at SHALL or SHOULD, in declaration order
    pub fn tested_comparators(&self) -> Vec<Comparator> {
        self.comparators
            .iter()
            .filter(|(_, expectation)| expectation.is_tested())
            .map(|(comparator, _)| *comparator)
            .collect()
    }

    pub fn requires_multiple_or(&self) -> bool {
        self.multiple_or == Some(Expectation::Shall)
    }
}

/// Interaction codes from the CapabilityStatement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InteractionCode {
    Read,
    Vread,
    Update,
    Patch,
    Delete,
    HistoryInstance,
    HistoryType,
    Create,
    SearchType,
}

impl InteractionCode {
    /// Name used in test keys and titles; `history-instance` reads as `history`
    pub fn display_name(&self) -> &'static str {
        match self {
            InteractionCode::Read => "read",
            InteractionCode::Vread => "vread",
            InteractionCode::Update => "update",
            InteractionCode::Patch => "patch",
            InteractionCode::Delete => "delete",
            InteractionCode::HistoryInstance => "history",
            InteractionCode::HistoryType => "history-type",
            InteractionCode::Create => "create",
            InteractionCode::SearchType => "search-type",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionDescriptor {
    pub code: InteractionCode,
    pub expectation: Expectation,
}

/// A must-support element, optionally required to carry a fixed value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MustSupportElement {
    pub path: String,
    #[serde(default)]
    pub fixed_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MustSupportExtension {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodingValue {
    #[serde(default)]
    pub system: Option<String>,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscriminatorValue {
    pub path: String,
    pub value: String,
}

/// How the members of a slice are recognised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Discriminator {
    #[serde(rename_all = "camelCase")]
    PatternCodeableConcept {
        path: String,
        code: String,
        system: String,
    },
    #[serde(rename_all = "camelCase")]
    PatternCoding {
        path: String,
        code: String,
        system: String,
    },
    #[serde(rename_all = "camelCase")]
    PatternIdentifier { path: String, system: String },
    /// Choice-type slice, e.g. `value[x]` restricted to `Quantity`
    #[serde(rename_all = "camelCase")]
    Type { code: String },
    #[serde(rename_all = "camelCase")]
    RequiredBinding {
        path: String,
        values: Vec<CodingValue>,
    },
    #[serde(rename_all = "camelCase")]
    Value { values: Vec<DiscriminatorValue> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MustSupportSlice {
    pub slice_id: String,
    pub slice_name: String,
    pub path: String,
    pub discriminator: Discriminator,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MustSupportSet {
    #[serde(default)]
    pub elements: Vec<MustSupportElement>,
    #[serde(default)]
    pub extensions: Vec<MustSupportExtension>,
    #[serde(default)]
    pub slices: Vec<MustSupportSlice>,
}

impl MustSupportSet {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.extensions.is_empty() && self.slices.is_empty()
    }
}

/// A reference element and the profiles it may target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceDefinition {
    pub path: String,
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// Canonical metadata for one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMetadata {
    pub resource_type: String,
    pub profile_url: String,
    /// Snake-case identifier used to build test keys (`us_core_condition`)
    pub canonical_name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub searches: Vec<SearchParameterDescriptor>,
    #[serde(default)]
    pub search_definitions: IndexMap<String, SearchParamDefinition>,
    #[serde(default)]
    pub interactions: Vec<InteractionDescriptor>,
    #[serde(default)]
    pub must_support: MustSupportSet,
    #[serde(default)]
    pub bindings: Vec<BindingDescriptor>,
    #[serde(default)]
    pub references: Vec<ReferenceDefinition>,
    #[serde(default)]
    pub include_params: Vec<String>,
    #[serde(default)]
    pub revinclude_params: Vec<String>,
    #[serde(default)]
    pub required_concepts: Vec<String>,
}

impl ProfileMetadata {
    /// Human readable profile name
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.resource_type)
    }

    pub fn search_definition(&self, name: &str) -> Option<&SearchParamDefinition> {
        self.search_definitions.get(name)
    }

    /// First SHALL search, else first SHOULD search
    pub fn first_search(&self) -> Option<&SearchParameterDescriptor> {
        self.searches
            .iter()
            .find(|s| s.expectation == Expectation::Shall)
            .or_else(|| {
                self.searches
                    .iter()
                    .find(|s| s.expectation == Expectation::Should)
            })
    }

    pub fn is_first_search(&self, search: &SearchParameterDescriptor) -> bool {
        self.first_search().is_some_and(|first| first == search)
    }

    pub fn has_patient_search(&self) -> bool {
        self.searches.iter().any(|s| s.includes("patient"))
    }

    pub fn interaction(&self, code: InteractionCode) -> Option<&InteractionDescriptor> {
        self.interactions.iter().find(|i| i.code == code)
    }

    /// Interaction declared at SHALL or SHOULD
    pub fn supports(&self, code: InteractionCode) -> bool {
        self.interaction(code)
            .is_some_and(|i| i.expectation.is_tested())
    }

    /// Name of the first declared status-bearing search parameter
    pub fn status_param(&self) -> Option<&str> {
        self.search_definitions
            .keys()
            .find(|name| name.contains("status"))
            .map(String::as_str)
    }

    /// Names used by any declared search, in first-seen order
    pub fn searched_param_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for search in &self.searches {
            for name in &search.names {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

/// Drop the leading resource-type segment of a dotted FHIR path
pub fn relative_path(path: &str) -> &str {
    match path.split_once('.') {
        Some((head, rest)) if head.starts_with(|c: char| c.is_ascii_uppercase()) => rest,
        _ => path,
    }
}
