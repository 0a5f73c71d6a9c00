//! Must-support coverage over captured resources

use crate::fhir_path;
use crate::metadata::{Discriminator, MustSupportSet, MustSupportSlice, relative_path};
use serde_json::Value;

/// Labels of must-support items that no resource in `resources` provides
///
/// Elements are labelled by path (with `:fixed` when a fixed value is
/// required), extensions and slices by their id.
pub fn missing_must_support(resources: &[Value], set: &MustSupportSet) -> Vec<String> {
    let mut missing = Vec::new();

    for element in &set.elements {
        let path = relative_path(&element.path);
        let found = resources.iter().any(|resource| {
            fhir_path::evaluate(resource, path)
                .into_iter()
                .filter(|value| fhir_path::is_populated(value))
                .any(|value| match &element.fixed_value {
                    Some(fixed) => element_has_value(value, fixed),
                    None => true,
                })
        });
        if !found {
            missing.push(match &element.fixed_value {
                Some(fixed) => format!("{path}:{fixed}"),
                None => path.to_string(),
            });
        }
    }

    for extension in &set.extensions {
        if !resources.iter().any(|r| has_extension(r, &extension.url)) {
            missing.push(extension.id.clone());
        }
    }

    for slice in &set.slices {
        if !resources.iter().any(|r| slice_present(r, slice)) {
            missing.push(slice.slice_id.clone());
        }
    }

    missing
}

fn element_has_value(value: &Value, fixed: &str) -> bool {
    match value {
        Value::Object(map) => ["code", "value", "system"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_str))
            .any(|v| v == fixed),
        other => fhir_path::primitive_string(other).is_some_and(|v| v == fixed),
    }
}

fn has_extension(value: &Value, url: &str) -> bool {
    match value {
        Value::Object(map) => {
            let direct = ["extension", "modifierExtension"].iter().any(|key| {
                map.get(*key)
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .any(|ext| ext.get("url").and_then(Value::as_str) == Some(url))
            });
            direct || map.values().any(|child| has_extension(child, url))
        }
        Value::Array(items) => items.iter().any(|item| has_extension(item, url)),
        _ => false,
    }
}

fn slice_present(resource: &Value, slice: &MustSupportSlice) -> bool {
    let path = relative_path(&slice.path);

    if let Discriminator::Type { code } = &slice.discriminator {
        let parent = path.rsplit_once('.').map(|(parent, _)| parent).unwrap_or("");
        let key = fhir_path::choice_key(path, code);
        let parents = if parent.is_empty() {
            vec![resource]
        } else {
            fhir_path::evaluate(resource, parent)
        };
        return parents.iter().any(|p| p.get(&key).is_some_and(fhir_path::is_populated));
    }

    fhir_path::evaluate(resource, path)
        .into_iter()
        .any(|item| discriminator_matches(item, &slice.discriminator))
}

fn at<'a>(item: &'a Value, path: &str) -> Vec<&'a Value> {
    if path.is_empty() {
        vec![item]
    } else {
        fhir_path::evaluate(item, path)
    }
}

fn coding_is(coding: &Value, code: &str, system: Option<&str>) -> bool {
    coding.get("code").and_then(Value::as_str) == Some(code)
        && system.is_none_or(|s| coding.get("system").and_then(Value::as_str) == Some(s))
}

fn discriminator_matches(item: &Value, discriminator: &Discriminator) -> bool {
    match discriminator {
        Discriminator::PatternCodeableConcept { path, code, system } => at(item, path)
            .into_iter()
            .flat_map(|concept| fhir_path::evaluate(concept, "coding"))
            .any(|coding| coding_is(coding, code, Some(system))),
        Discriminator::PatternCoding { path, code, system } => at(item, path)
            .into_iter()
            .any(|coding| coding_is(coding, code, Some(system))),
        Discriminator::PatternIdentifier { path, system } => at(item, path)
            .into_iter()
            .any(|identifier| identifier.get("system").and_then(Value::as_str) == Some(system)),
        Discriminator::RequiredBinding { path, values } => at(item, path)
            .into_iter()
            .flat_map(|element| {
                let codings = fhir_path::evaluate(element, "coding");
                if codings.is_empty() { vec![element] } else { codings }
            })
            .any(|coding| {
                values
                    .iter()
                    .any(|v| coding_is(coding, &v.code, v.system.as_deref()))
            }),
        Discriminator::Value { values } => values.iter().all(|v| {
            at(item, &v.path)
                .into_iter()
                .filter_map(fhir_path::primitive_string)
                .any(|found| found == v.value)
        }),
        // handled on the parent element
        Discriminator::Type { .. } => false,
    }
}
