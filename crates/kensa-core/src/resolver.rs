//! Search-value resolution
//!
//! Search tests need concrete values to search with. The first search of a
//! profile uses either the patient id or a declared fixed value; every later
//! search takes its values from resources captured by the first one. This
//! module decides which of those strategies applies and extracts values from
//! captured resources.

use crate::fhir_path;
use crate::metadata::{
    Comparator, ProfileMetadata, SearchParameterDescriptor, SearchValueType, relative_path,
};
use crate::validation::date::shift_days;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a search's parameter values come from at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SearchStrategy {
    /// Every name is `patient`; the patient id is the only value
    PatientScoped,
    /// Iterate declared values of `param`, one search per value
    #[serde(rename_all = "camelCase")]
    FixedValue {
        param: String,
        values: Vec<ParamValue>,
        /// Number of productive values after which iteration stops
        stop_after: usize,
    },
    /// Resolve every non-patient value from previously captured resources
    ResolveFromResources,
}

/// A value for a fixed-value search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ParamValue {
    /// The id of the patient currently being tested
    PatientId,
    Literal(String),
}

impl ParamValue {
    pub fn render(&self, patient_id: &str) -> String {
        match self {
            ParamValue::PatientId => patient_id.to_string(),
            ParamValue::Literal(value) => value.clone(),
        }
    }
}

/// Path suffix appended to an element path to reach a searchable primitive
pub fn suffix_for(value_type: &SearchValueType) -> &'static str {
    match value_type {
        SearchValueType::CodeableConcept => ".coding.code",
        SearchValueType::Reference => ".reference",
        SearchValueType::Period | SearchValueType::Date => ".start",
        SearchValueType::Identifier => ".value",
        SearchValueType::Coding => ".code",
        SearchValueType::HumanName => ".family",
        SearchValueType::Address => ".city",
        SearchValueType::Token | SearchValueType::Other(_) => "",
    }
}

/// Pick the value strategy for `search`
///
/// Only the first search of a non-delayed profile uses declared values;
/// later searches resolve from what the first one captured.
pub fn select_strategy(
    profile: &ProfileMetadata,
    search: &SearchParameterDescriptor,
    first: bool,
    delayed: bool,
) -> SearchStrategy {
    if !search.names.is_empty() && search.names.iter().all(|n| n == "patient") {
        return SearchStrategy::PatientScoped;
    }
    if !first {
        return SearchStrategy::ResolveFromResources;
    }
    if profile.resource_type == "Patient" && search.includes("_id") {
        return SearchStrategy::FixedValue {
            param: "_id".to_string(),
            values: vec![ParamValue::PatientId],
            stop_after: 1,
        };
    }
    if delayed || search.is_patient_only() {
        return SearchStrategy::ResolveFromResources;
    }

    let Some(param) = search.names.iter().find(|n| n.as_str() != "patient") else {
        return SearchStrategy::ResolveFromResources;
    };
    let definition = profile.search_definition(param);
    let values = definition
        .map(|d| d.values.iter().cloned().map(ParamValue::Literal).collect())
        .unwrap_or_default();
    let stop_after = if definition.is_some_and(|d| d.requires_multiple_or()) {
        2
    } else {
        1
    };

    SearchStrategy::FixedValue {
        param: param.clone(),
        values,
        stop_after,
    }
}

/// Escape literal commas so a value is not read as a multiple-or list
pub fn escape_commas(value: &str) -> String {
    value.replace(',', "\\,")
}

/// Resolve a search value for the element at `path` from captured resources
///
/// The first non-blank value not rejected by `exclude` wins. Date elements
/// held as a Period become a `gt`/`lt` bound one day outside the period so
/// the search still matches the resource the value came from.
pub fn resolve_value<F>(
    path: &str,
    value_type: &SearchValueType,
    resources: &[Value],
    exclude: F,
) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    let element = relative_path(path);

    if value_type.is_date() {
        return resources
            .iter()
            .flat_map(|resource| fhir_path::evaluate(resource, element))
            .filter_map(date_value)
            .find(|value| !exclude(value));
    }

    let full_path = format!("{}{}", element, suffix_for(value_type));
    resources
        .iter()
        .flat_map(|resource| fhir_path::evaluate(resource, &full_path))
        .filter_map(fhir_path::primitive_string)
        .filter(|value| !value.trim().is_empty())
        .map(|value| escape_commas(&value))
        .find(|value| !exclude(value))
}

fn date_value(value: &Value) -> Option<String> {
    match value {
        Value::String(date) if !date.trim().is_empty() => Some(date.clone()),
        Value::Object(period) => {
            if let Some(start) = period.get("start").and_then(Value::as_str) {
                return shift_days(start, -1).map(|date| format!("gt{date}"));
            }
            period
                .get("end")
                .and_then(Value::as_str)
                .and_then(|end| shift_days(end, 1))
                .map(|date| format!("lt{date}"))
        }
        _ => None,
    }
}

/// Unshifted date held at `path`: a primitive date, or a Period's `start`
/// (else its `end`)
pub fn resolve_date_bound(path: &str, resources: &[Value]) -> Option<String> {
    let element = relative_path(path);
    resources
        .iter()
        .flat_map(|resource| fhir_path::evaluate(resource, element))
        .find_map(|value| match value {
            Value::String(date) if !date.trim().is_empty() => Some(date.clone()),
            Value::Object(period) => period
                .get("start")
                .or_else(|| period.get("end"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
}

/// Resolve the `system|code` form of a token value previously resolved by
/// [`resolve_value`]
///
/// Returns `None` when no coding (or identifier) carrying `code` also
/// declares a system.
pub fn resolve_system_value(
    path: &str,
    value_type: &SearchValueType,
    resources: &[Value],
    code: &str,
) -> Option<String> {
    let element = relative_path(path);
    let (container, code_key) = match value_type {
        SearchValueType::CodeableConcept => (format!("{element}.coding"), "code"),
        SearchValueType::Coding => (element.to_string(), "code"),
        SearchValueType::Identifier => (element.to_string(), "value"),
        _ => return None,
    };

    resources
        .iter()
        .flat_map(|resource| fhir_path::evaluate(resource, &container))
        .find_map(|item| {
            let candidate = item.get(code_key).and_then(Value::as_str)?;
            let system = item.get("system").and_then(Value::as_str)?;
            (escape_commas(candidate) == code).then(|| format!("{system}|{code}"))
        })
}

/// Derive a comparator search value from a resolved date value
///
/// `gt`/`ge` search one day before the date and `lt`/`le` one day after, so
/// the resource the date came from is inside the searched range.
pub fn comparator_value(comparator: Comparator, resolved: &str) -> Option<String> {
    let (_, date) = Comparator::split_prefix(resolved);
    let shifted = match comparator {
        Comparator::Gt | Comparator::Ge => shift_days(date, -1)?,
        Comparator::Lt | Comparator::Le => shift_days(date, 1)?,
        _ => date.to_string(),
    };
    Some(format!("{}{}", comparator.as_str(), shifted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Expectation, SearchParamDefinition};
    use indexmap::IndexMap;
    use serde_json::json;

    fn condition() -> Value {
        json!({
            "resourceType": "Condition",
            "id": "c1",
            "category": [{ "coding": [{
                "system": "http://hl7.org/cat",
                "code": "problem-list-item"
            }] }],
            "onsetPeriod": { "start": "2020-03-01" },
            "recordedDate": "2021-05-05",
            "note": [{ "text": "a, b" }],
            "identifier": [{ "system": "urn:ids", "value": "A-1" }]
        })
    }

    fn profile(resource_type: &str, searches: &[&[&str]]) -> ProfileMetadata {
        let mut definitions = IndexMap::new();
        definitions.insert(
            "category".to_string(),
            SearchParamDefinition {
                path: format!("{resource_type}.category"),
                value_type: SearchValueType::CodeableConcept,
                comparators: IndexMap::new(),
                chain: vec![],
                multiple_or: Some(Expectation::Shall),
                values: vec!["problem-list-item".to_string(), "health-concern".to_string()],
            },
        );
        let mut profile: ProfileMetadata = serde_json::from_value(json!({
            "resourceType": resource_type,
            "profileUrl": "http://example.org/p",
            "canonicalName": "p",
        }))
        .unwrap();
        profile.search_definitions = definitions;
        profile.searches = searches
            .iter()
            .map(|names| SearchParameterDescriptor {
                names: names.iter().map(|n| n.to_string()).collect(),
                expectation: Expectation::Shall,
            })
            .collect();
        profile
    }

    #[test]
    fn test_suffix_table_is_total() {
        assert_eq!(suffix_for(&SearchValueType::CodeableConcept), ".coding.code");
        assert_eq!(suffix_for(&SearchValueType::HumanName), ".family");
        assert_eq!(suffix_for(&SearchValueType::Other("uri".into())), "");
        assert_eq!(suffix_for(&SearchValueType::from("".to_string())), "");
    }

    #[test]
    fn test_resolve_codeable_concept() {
        let value = resolve_value(
            "Condition.category",
            &SearchValueType::CodeableConcept,
            &[condition()],
            |_| false,
        );
        assert_eq!(value.as_deref(), Some("problem-list-item"));
    }

    #[test]
    fn test_resolve_period_becomes_gt_bound() {
        let period = SearchValueType::Period;
        let value = resolve_value("Condition.onset[x]", &period, &[condition()], |_| false);
        assert_eq!(value.as_deref(), Some("gt2020-02-29"));
    }

    #[test]
    fn test_resolve_date_falls_back_to_primitive() {
        let date = SearchValueType::Date;
        let value = resolve_value("Condition.recordedDate", &date, &[condition()], |_| false);
        assert_eq!(value.as_deref(), Some("2021-05-05"));
    }

    #[test]
    fn test_resolve_escapes_commas_and_honors_exclusion() {
        let other = SearchValueType::Other("string".into());
        assert_eq!(
            resolve_value("Condition.note.text", &other, &[condition()], |_| false).as_deref(),
            Some("a\\, b")
        );
        let excluded = resolve_value("Condition.note.text", &other, &[condition()], |v| {
            v == "a\\, b"
        });
        assert!(excluded.is_none());
    }

    #[test]
    fn test_resolve_system_value() {
        let resources = [condition()];
        let category = resolve_system_value(
            "Condition.category",
            &SearchValueType::CodeableConcept,
            &resources,
            "problem-list-item",
        );
        assert_eq!(category.as_deref(), Some("http://hl7.org/cat|problem-list-item"));

        let identifier = resolve_system_value(
            "Condition.identifier",
            &SearchValueType::Identifier,
            &resources,
            "A-1",
        );
        assert_eq!(identifier.as_deref(), Some("urn:ids|A-1"));

        let token =
            resolve_system_value("Condition.code", &SearchValueType::Token, &resources, "x");
        assert!(token.is_none());
    }

    #[test]
    fn test_date_bound_is_unshifted() {
        let resources = [condition()];
        assert_eq!(
            resolve_date_bound("Condition.onset[x]", &resources).as_deref(),
            Some("2020-03-01")
        );
        let bound = resolve_date_bound("Condition.onset[x]", &resources).unwrap();
        assert_eq!(comparator_value(Comparator::Gt, &bound).unwrap(), "gt2020-02-29");
        assert_eq!(comparator_value(Comparator::Lt, &bound).unwrap(), "lt2020-03-02");

        let ended = [json!({
            "resourceType": "Condition",
            "onsetPeriod": { "end": "2020-04-10" }
        })];
        assert_eq!(
            resolve_date_bound("Condition.onset[x]", &ended).as_deref(),
            Some("2020-04-10")
        );
        assert_eq!(
            resolve_date_bound("Condition.recordedDate", &resources).as_deref(),
            Some("2021-05-05")
        );
    }

    #[test]
    fn test_comparator_values_shift_by_one_day() {
        assert_eq!(comparator_value(Comparator::Gt, "2020-03-01").unwrap(), "gt2020-02-29");
        assert_eq!(comparator_value(Comparator::Le, "gt2020-02-29").unwrap(), "le2020-03-01");
    }

    #[test]
    fn test_patient_id_search_uses_fixed_patient_value() {
        let patient = profile("Patient", &[&["_id"]]);
        let strategy = select_strategy(&patient, &patient.searches[0], true, false);
        assert_eq!(
            strategy,
            SearchStrategy::FixedValue {
                param: "_id".to_string(),
                values: vec![ParamValue::PatientId],
                stop_after: 1,
            }
        );
    }

    #[test]
    fn test_strategy_selection() {
        let condition = profile("Condition", &[&["patient", "category"], &["patient"]]);
        match select_strategy(&condition, &condition.searches[0], true, false) {
            SearchStrategy::FixedValue { param, values, stop_after } => {
                assert_eq!(param, "category");
                assert_eq!(values.len(), 2);
                assert_eq!(stop_after, 2);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        assert_eq!(
            select_strategy(&condition, &condition.searches[1], false, false),
            SearchStrategy::PatientScoped
        );
        assert_eq!(
            select_strategy(&condition, &condition.searches[0], false, false),
            SearchStrategy::ResolveFromResources
        );
        assert_eq!(
            select_strategy(&condition, &condition.searches[0], true, true),
            SearchStrategy::ResolveFromResources
        );
    }
}
