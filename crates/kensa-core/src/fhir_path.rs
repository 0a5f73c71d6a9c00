//! Element navigation over JSON resources
//!
//! A deliberately small subset of FHIRPath: dotted element paths with array
//! flattening, choice-type expansion (`effective[x]` or `effective` match
//! `effectiveDateTime`, `effectivePeriod`, ...) and slice-name stripping
//! (`category:us-core` navigates `category`). Evaluation never fails; a path
//! that does not exist yields an empty collection.

use serde_json::Value;

/// Evaluate `path` against `resource`, returning every reached value
///
/// A leading segment equal to the resource's `resourceType` is skipped so
/// both `Condition.code` and `code` work.
pub fn evaluate<'a>(resource: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current: Vec<&'a Value> = vec![resource];
    let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();

    let resource_type = resource.get("resourceType").and_then(Value::as_str);
    if resource_type.is_some() && segments.peek().copied() == resource_type {
        segments.next();
    }

    for segment in segments {
        let name = element_name(segment);
        let mut next = Vec::new();
        for value in current {
            collect_child(value, name, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }

    current
        .into_iter()
        .flat_map(|v| match v {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        })
        .collect()
}

/// First value at `path`, if any
pub fn first<'a>(resource: &'a Value, path: &str) -> Option<&'a Value> {
    evaluate(resource, path).into_iter().next()
}

/// Whether `path` reaches at least one populated value
pub fn has_value(resource: &Value, path: &str) -> bool {
    evaluate(resource, path).into_iter().any(is_populated)
}

/// Non-null, non-empty value
pub fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => items.iter().any(is_populated),
        Value::Object(map) => map.values().any(is_populated),
        _ => true,
    }
}

/// String form of primitive values; objects and arrays are skipped
pub fn primitive_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Every `reference` string found anywhere in the resource
///
/// Contained (`#id`) references are excluded; they are resolved inside the
/// resource, not against the server.
pub fn collect_references(resource: &Value) -> Vec<String> {
    let mut found = Vec::new();
    walk_references(resource, &mut found);
    found
}

fn walk_references(value: &Value, found: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key == "contained" {
                    continue;
                }
                if key == "reference"
                    && let Value::String(reference) = child
                {
                    if !reference.starts_with('#') && !found.contains(reference) {
                        found.push(reference.clone());
                    }
                    continue;
                }
                walk_references(child, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_references(item, found);
            }
        }
        _ => {}
    }
}

/// Strip `[x]` and slice names from a path segment
fn element_name(segment: &str) -> &str {
    let segment = segment.split(':').next().unwrap_or(segment);
    segment.strip_suffix("[x]").unwrap_or(segment)
}

fn collect_child<'a>(value: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_child(item, name, out);
            }
        }
        Value::Object(map) => {
            if let Some(child) = map.get(name) {
                push_flattened(child, out);
                return;
            }
            // Choice type: `value` matches `valueQuantity`, `valueString`, ...
            for (key, child) in map {
                if let Some(rest) = key.strip_prefix(name)
                    && rest.starts_with(|c: char| c.is_ascii_uppercase())
                {
                    push_flattened(child, out);
                }
            }
        }
        _ => {}
    }
}

fn push_flattened<'a>(value: &'a Value, out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => out.extend(items.iter()),
        Value::Null => {}
        other => out.push(other),
    }
}

/// The key a choice-type element is stored under (`value[x]` + `Quantity`)
pub fn choice_key(path: &str, type_code: &str) -> String {
    let base = path.rsplit('.').next().unwrap_or(path);
    let base = base.strip_suffix("[x]").unwrap_or(base);
    let mut chars = type_code.chars();
    match chars.next() {
        Some(first) => format!("{}{}{}", base, first.to_ascii_uppercase(), chars.as_str()),
        None => base.to_string(),
    }
}
