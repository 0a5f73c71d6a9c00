//! Terminology binding descriptors

use serde::{Deserialize, Serialize};

/// FHIR binding strength hierarchy (from strongest to weakest)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BindingStrength {
    /// Example: Example ValueSet for guidance only
    Example = 1,
    /// Preferred: Suggested ValueSet, but not enforced
    Preferred = 2,
    /// Extensible: Should use a code from the ValueSet if applicable
    Extensible = 3,
    /// Required: Must use a code from the ValueSet
    Required = 4,
}

impl BindingStrength {
    /// Parse binding strength from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "required" => Some(BindingStrength::Required),
            "extensible" => Some(BindingStrength::Extensible),
            "preferred" => Some(BindingStrength::Preferred),
            "example" => Some(BindingStrength::Example),
            _ => None,
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingStrength::Required => "required",
            BindingStrength::Extensible => "extensible",
            BindingStrength::Preferred => "preferred",
            BindingStrength::Example => "example",
        }
    }

    /// Whether conformance tests check codes bound with this strength
    pub fn is_checked(&self) -> bool {
        *self >= BindingStrength::Extensible
    }
}

impl std::str::FromStr for BindingStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid binding strength: '{}'", s))
    }
}

impl std::fmt::Display for BindingStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value set binding on one element of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingDescriptor {
    /// Element type (CodeableConcept, Coding, code, Quantity, ...)
    #[serde(rename = "type")]
    pub element_type: String,
    pub strength: BindingStrength,
    /// ValueSet canonical URL
    pub system: String,
    /// Element path relative to the resource (e.g. `clinicalStatus`)
    pub path: String,
}
