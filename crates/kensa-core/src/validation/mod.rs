//! Response validation rules
//!
//! Checks whether an element of a returned resource matches the value a
//! search was issued with. Dispatch is a closed [`MatchRule`] built from the
//! parameter's declared type and name.

pub mod date;

pub use date::validate_date_search;

use crate::fhir_path;
use crate::metadata::{ProfileMetadata, SearchValueType, relative_path};
use crate::resolver::escape_commas;
use indexmap::IndexMap;
use serde_json::Value;

/// Matching semantics for one search parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    Date,
    HumanName,
    Address,
    CodeableConcept,
    Coding,
    Identifier,
    /// `patient` / `subject` references, compared by patient id
    PatientReference { base_url: String },
    Reference,
    Default,
}

impl MatchRule {
    pub fn for_param(name: &str, value_type: &SearchValueType, base_url: &str) -> Self {
        if matches!(name, "patient" | "subject") {
            return MatchRule::PatientReference {
                base_url: base_url.trim_end_matches('/').to_string(),
            };
        }
        match value_type {
            SearchValueType::Date | SearchValueType::Period => MatchRule::Date,
            SearchValueType::HumanName => MatchRule::HumanName,
            SearchValueType::Address => MatchRule::Address,
            SearchValueType::CodeableConcept => MatchRule::CodeableConcept,
            SearchValueType::Coding => MatchRule::Coding,
            SearchValueType::Identifier => MatchRule::Identifier,
            SearchValueType::Reference => MatchRule::Reference,
            SearchValueType::Token | SearchValueType::Other(_) => MatchRule::Default,
        }
    }
}

/// Does any of `field_values` satisfy `requested` under `rule`?
pub fn matches(rule: &MatchRule, requested: &str, field_values: &[&Value]) -> bool {
    let raw = requested;
    let requested = unescape(raw);
    match rule {
        MatchRule::Date => field_values
            .iter()
            .any(|value| validate_date_search(&requested, value)),
        MatchRule::HumanName => {
            let needle = requested.to_lowercase();
            field_values.iter().any(|name| human_name_matches(name, &needle))
        }
        MatchRule::Address => {
            let needle = requested.to_lowercase();
            field_values.iter().any(|address| {
                ["text", "city", "state", "postalCode", "country"]
                    .iter()
                    .filter_map(|key| address.get(key).and_then(Value::as_str))
                    .any(|part| part.to_lowercase().starts_with(&needle))
            })
        }
        MatchRule::CodeableConcept => field_values
            .iter()
            .flat_map(|concept| fhir_path::evaluate(concept, "coding"))
            .any(|coding| coding_matches(coding, &requested)),
        MatchRule::Coding => field_values
            .iter()
            .any(|coding| coding_matches(coding, &requested)),
        MatchRule::Identifier => {
            let (system, value) = match requested.split_once('|') {
                Some((system, value)) => (Some(system), value),
                None => (None, requested.as_str()),
            };
            field_values.iter().any(|identifier| {
                identifier.get("value").and_then(Value::as_str) == Some(value)
                    && system.is_none_or(|s| {
                        s.is_empty() || identifier.get("system").and_then(Value::as_str) == Some(s)
                    })
            })
        }
        MatchRule::PatientReference { base_url } => {
            let id = requested.rsplit("Patient/").next().unwrap_or(&requested);
            let accepted = [
                id.to_string(),
                format!("Patient/{id}"),
                format!("{base_url}/Patient/{id}"),
            ];
            field_values
                .iter()
                .filter_map(|v| reference_string(v))
                .any(|reference| accepted.iter().any(|a| a == reference))
        }
        MatchRule::Reference => {
            let wanted = reference_tail(&requested);
            field_values
                .iter()
                .filter_map(|v| reference_string(v))
                .any(|reference| reference_tail(reference) == wanted)
        }
        MatchRule::Default => {
            let wanted = split_unescaped(raw);
            field_values
                .iter()
                .filter_map(|v| fhir_path::primitive_string(v))
                .any(|value| wanted.contains(&value))
        }
    }
}

fn human_name_matches(name: &Value, needle: &str) -> bool {
    let starts = |key: &str| {
        fhir_path::evaluate(name, key)
            .into_iter()
            .filter_map(Value::as_str)
            .any(|part| part.to_lowercase().starts_with(needle))
    };
    let family_contains = name
        .get("family")
        .and_then(Value::as_str)
        .is_some_and(|family| family.to_lowercase().contains(needle));

    family_contains || starts("text") || starts("given") || starts("prefix") || starts("suffix")
}

fn coding_matches(coding: &Value, requested: &str) -> bool {
    let code = coding.get("code").and_then(Value::as_str);
    match requested.split_once('|') {
        Some((system, wanted)) => {
            coding.get("system").and_then(Value::as_str) == Some(system)
                && code.is_some_and(|c| c.eq_ignore_ascii_case(wanted))
        }
        None => code.is_some_and(|c| c.eq_ignore_ascii_case(requested)),
    }
}

fn reference_string(value: &Value) -> Option<&str> {
    match value {
        Value::String(reference) => Some(reference),
        Value::Object(map) => map.get("reference").and_then(Value::as_str),
        _ => None,
    }
}

/// `Type/id` from a relative or absolute reference, ignoring `_history`
pub fn reference_tail(reference: &str) -> String {
    let reference = reference
        .split("/_history/")
        .next()
        .unwrap_or(reference);
    let segments: Vec<&str> = reference.rsplit('/').take(2).collect();
    match segments.as_slice() {
        [id, resource_type] => format!("{resource_type}/{id}"),
        _ => reference.to_string(),
    }
}

/// Split on commas not preceded by a backslash, unescaping `\,`
pub fn split_unescaped(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&',') => {
                current.push(',');
                chars.next();
            }
            ',' => parts.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    parts.push(current);
    parts
}

fn unescape(value: &str) -> String {
    value.replace("\\,", ",")
}

/// Check one returned resource against every parameter of a search
///
/// Returns the first parameter that did not match, formatted for a failure
/// message. Result-shaping parameters (`_include`, `_revinclude`, ...) are
/// not compared.
pub fn check_resource_against_params(
    resource: &Value,
    params: &IndexMap<String, String>,
    profile: &ProfileMetadata,
    base_url: &str,
) -> std::result::Result<(), String> {
    for (name, value) in params {
        let found = if name == "_id" {
            resource.get("id").and_then(Value::as_str) == Some(value.as_str())
        } else if name.contains('.') || name.starts_with('_') {
            // chained and result-shaping parameters
            true
        } else {
            let (path, value_type) = match profile.search_definition(name) {
                Some(definition) => (
                    relative_path(&definition.path).to_string(),
                    definition.value_type.clone(),
                ),
                None if name == "patient" => ("subject".to_string(), SearchValueType::Reference),
                None => continue,
            };
            let mut values = fhir_path::evaluate(resource, &path);
            if values.is_empty() && name == "patient" {
                values = fhir_path::evaluate(resource, "patient");
            }
            let rule = MatchRule::for_param(name, &value_type, base_url);
            // a comma-joined value is a multiple-or search
            split_unescaped(value)
                .iter()
                .any(|piece| matches(&rule, &escape_commas(piece), &values))
        };

        if !found {
            let id = resource.get("id").and_then(Value::as_str).unwrap_or("<no id>");
            return Err(format!("{name}={value} did not match resource {id}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_splits_unescaped_commas() {
        assert_eq!(split_unescaped("a,b\\,c"), vec!["a", "b,c"]);
        let values = [&json!("b,c")];
        assert!(matches(&MatchRule::Default, "a,b\\,c", &values));
        assert!(!matches(&MatchRule::Default, "b", &values));
    }

    #[test]
    fn test_human_name() {
        let name = json!({ "family": "Shaw", "given": ["Amy", "V."] });
        let values = [&name];
        assert!(matches(&MatchRule::HumanName, "am", &values));
        assert!(matches(&MatchRule::HumanName, "ha", &values));
        assert!(!matches(&MatchRule::HumanName, "my", &values));
    }

    #[test]
    fn test_address_prefix() {
        let address = json!({ "city": "Boston", "state": "MA", "postalCode": "02118" });
        assert!(matches(&MatchRule::Address, "bos", &[&address]));
        assert!(matches(&MatchRule::Address, "0211", &[&address]));
        assert!(!matches(&MatchRule::Address, "ston", &[&address]));
    }

    #[test]
    fn test_codeable_concept_with_and_without_system() {
        let concept = json!({ "coding": [{ "system": "http://loinc.org", "code": "8867-4" }] });
        let values = [&concept];
        assert!(matches(&MatchRule::CodeableConcept, "8867-4", &values));
        assert!(matches(&MatchRule::CodeableConcept, "http://loinc.org|8867-4", &values));
        assert!(!matches(&MatchRule::CodeableConcept, "http://snomed.info/sct|8867-4", &values));
    }

    #[test]
    fn test_identifier() {
        let identifier = json!({ "system": "urn:mrn", "value": "123" });
        let values = [&identifier];
        assert!(matches(&MatchRule::Identifier, "123", &values));
        assert!(matches(&MatchRule::Identifier, "urn:mrn|123", &values));
        assert!(!matches(&MatchRule::Identifier, "urn:other|123", &values));
    }

    #[test]
    fn test_patient_reference_normalization() {
        let rule =
            MatchRule::for_param("patient", &SearchValueType::Reference, "http://server/fhir/");
        assert!(matches(&rule, "85", &[&json!({ "reference": "Patient/85" })]));
        let absolute = json!({ "reference": "http://server/fhir/Patient/85" });
        assert!(matches(&rule, "Patient/85", &[&absolute]));
        assert!(!matches(&rule, "85", &[&json!({ "reference": "Patient/855" })]));
    }

    #[test]
    fn test_reference_tail() {
        assert_eq!(reference_tail("http://x/fhir/Practitioner/1/_history/2"), "Practitioner/1");
        let rule = MatchRule::Reference;
        assert!(matches(&rule, "Encounter/9", &[&json!({ "reference": "http://x/Encounter/9" })]));
    }

    #[test]
    fn test_date_rule_dispatch() {
        let rule = MatchRule::for_param("date", &SearchValueType::Date, "");
        assert_eq!(rule, MatchRule::Date);
        assert!(matches(&rule, "gt2020-01-01", &[&json!("2020-02-01")]));
    }

    #[test]
    fn test_check_resource_reports_mismatch() {
        let profile: ProfileMetadata = serde_json::from_value(json!({
            "resourceType": "Condition",
            "profileUrl": "http://example.org/condition",
            "canonicalName": "condition",
            "searchDefinitions": {
                "category": { "path": "Condition.category", "type": "CodeableConcept" }
            }
        }))
        .unwrap();
        let resource = json!({
            "resourceType": "Condition",
            "id": "c1",
            "subject": { "reference": "Patient/85" },
            "category": [{ "coding": [{ "code": "problem-list-item" }] }]
        });
        let mut params = IndexMap::new();
        params.insert("patient".to_string(), "85".to_string());
        params.insert("category".to_string(), "problem-list-item".to_string());
        assert!(check_resource_against_params(&resource, &params, &profile, "http://s").is_ok());

        params.insert("category".to_string(), "encounter-diagnosis,problem-list-item".to_string());
        assert!(check_resource_against_params(&resource, &params, &profile, "http://s").is_ok());

        params.insert("category".to_string(), "encounter-diagnosis".to_string());
        let err =
            check_resource_against_params(&resource, &params, &profile, "http://s").unwrap_err();
        assert!(err.contains("category=encounter-diagnosis"));
    }
}
