//! Sequence-local and test-local run state

use crate::client::SearchParams;
use indexmap::IndexMap;
use serde_json::Value;

/// References found while testing, keyed by target resource type
pub type DiscoveredReferences = IndexMap<String, Vec<String>>;

/// Add `reference` under `resource_type` unless already present
pub fn record_reference(
    discovered: &mut DiscoveredReferences,
    resource_type: &str,
    reference: &str,
) {
    let references = discovered.entry(resource_type.to_string()).or_default();
    if !references.iter().any(|r| r == reference) {
        references.push(reference.to_string());
    }
}

/// Merge `other` into `into`, keeping first-seen order
pub fn merge_references(into: &mut DiscoveredReferences, other: &DiscoveredReferences) {
    for (resource_type, references) in other {
        for reference in references {
            record_reference(into, resource_type, reference);
        }
    }
}

/// One productive search for one patient
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientSearch {
    pub patient_id: String,
    pub params: SearchParams,
    /// Returned entries of the searched resource type
    pub resources: Vec<Value>,
}

/// State shared by the tests of one profile's sequence
///
/// Created fresh for every sequence run and never shared between profiles.
#[derive(Debug, Default)]
pub struct SequenceState {
    /// Resources captured by the first search or the read test
    pub resources: Vec<Value>,
    pub resources_found: bool,
    /// Productive first-search parameters, per patient
    pub first_searches: Vec<PatientSearch>,
    /// Resources returned through `_include`, by resource type
    pub included: IndexMap<String, Vec<Value>>,
    /// References to delayed profiles found in this sequence
    pub discovered: DiscoveredReferences,
}

impl SequenceState {
    /// Add resources, skipping ones already captured
    pub fn capture(&mut self, resources: impl IntoIterator<Item = Value>) {
        for resource in resources {
            let key = identity(&resource);
            if key.is_some() && self.resources.iter().any(|r| identity(r) == key) {
                continue;
            }
            self.resources.push(resource);
        }
        self.resources_found = !self.resources.is_empty();
    }

    pub fn include(&mut self, resource_type: &str, resource: Value) {
        let included = self.included.entry(resource_type.to_string()).or_default();
        if !included.iter().any(|r| identity(r) == identity(&resource)) {
            included.push(resource);
        }
    }

    pub fn included(&self, resource_type: &str) -> &[Value] {
        self.included
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resources found for `patient_id`, or every captured resource when
    /// the sequence was not seeded per patient
    pub fn resources_for(&self, patient_id: &str) -> Vec<Value> {
        if self.first_searches.is_empty() {
            return self.resources.clone();
        }
        self.first_searches
            .iter()
            .filter(|s| s.patient_id == patient_id)
            .flat_map(|s| s.resources.iter().cloned())
            .collect()
    }
}

/// `Type/id` of a resource
pub fn identity(resource: &Value) -> Option<String> {
    let resource_type = resource.get("resourceType").and_then(Value::as_str)?;
    let id = resource.get("id").and_then(Value::as_str)?;
    Some(format!("{resource_type}/{id}"))
}

/// State of one running test
#[derive(Debug, Default)]
pub struct TestContext {
    /// Productive primary searches of this test
    pub searches: Vec<PatientSearch>,
    /// Resources read by this test
    pub resources: Vec<Value>,
    /// Resources returned through `_revinclude`
    pub revincluded: Vec<Value>,
    pub warnings: Vec<String>,
}

impl TestContext {
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capture_dedupes_by_identity() {
        let mut state = SequenceState::default();
        assert!(!state.resources_found);
        state.capture(vec![
            json!({ "resourceType": "Condition", "id": "1" }),
            json!({ "resourceType": "Condition", "id": "1" }),
            json!({ "resourceType": "Condition", "id": "2" }),
        ]);
        assert_eq!(state.resources.len(), 2);
        assert!(state.resources_found);
    }

    #[test]
    fn test_resources_for_patient() {
        let mut state = SequenceState::default();
        state.first_searches.push(PatientSearch {
            patient_id: "85".to_string(),
            params: SearchParams::new(),
            resources: vec![json!({ "resourceType": "Condition", "id": "1" })],
        });
        assert_eq!(state.resources_for("85").len(), 1);
        assert!(state.resources_for("355").is_empty());
    }

    #[test]
    fn test_merge_references_keeps_order() {
        let mut into = DiscoveredReferences::new();
        record_reference(&mut into, "Encounter", "Encounter/1");
        let mut other = DiscoveredReferences::new();
        record_reference(&mut other, "Encounter", "Encounter/1");
        record_reference(&mut other, "Encounter", "Encounter/2");
        record_reference(&mut other, "Location", "Location/9");
        merge_references(&mut into, &other);
        assert_eq!(into["Encounter"], vec!["Encounter/1", "Encounter/2"]);
        assert_eq!(into["Location"], vec!["Location/9"]);
    }
}
