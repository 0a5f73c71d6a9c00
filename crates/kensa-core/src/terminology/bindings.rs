//! Required and extensible binding checks over captured resources

use super::{TerminologyError, TerminologyValidator};
use crate::fhir_path;
use crate::metadata::{BindingDescriptor, BindingStrength, relative_path};
use serde_json::Value;
use tracing::warn;

/// Result of checking bindings over a set of resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingReport {
    /// One message per invalid element
    pub invalid: Vec<String>,
    /// Unanswerable checks (unknown ValueSets or CodeSystems)
    pub warnings: Vec<String>,
}

impl BindingReport {
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }

    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            warn!("{}", message);
            self.warnings.push(message);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Member,
    NotMember,
}

struct Code<'a> {
    system: Option<&'a str>,
    code: &'a str,
}

impl std::fmt::Display for Code<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.system {
            Some(system) => write!(f, "{}|{}", system, self.code),
            None => f.write_str(self.code),
        }
    }
}

/// Check every required and extensible binding against `resources`
///
/// Elements listed in `required_concepts` must carry at least one coding;
/// other CodeableConcepts without codings are not checked.
pub fn check_bindings(
    validator: &dyn TerminologyValidator,
    resources: &[Value],
    bindings: &[BindingDescriptor],
    required_concepts: &[String],
) -> BindingReport {
    let mut report = BindingReport::default();

    for binding in bindings.iter().filter(|b| b.strength.is_checked()) {
        let path = relative_path(&binding.path);
        let required_concept = required_concepts
            .iter()
            .any(|concept| relative_path(concept) == path);

        for resource in resources {
            for element in fhir_path::evaluate(resource, path) {
                let codes = codes_of(&binding.element_type, element);
                if codes.is_empty() {
                    if required_concept {
                        report
                            .invalid
                            .push(format!("{} has no coding at {}", describe(resource), path));
                    }
                    continue;
                }

                let invalid: Vec<String> = match binding.strength {
                    BindingStrength::Required => check_required(
                        validator,
                        binding,
                        &binding.element_type,
                        &codes,
                        &mut report,
                    ),
                    _ => check_extensible(validator, binding, &codes, &mut report),
                };
                for code in invalid {
                    report.invalid.push(format!(
                        "{} at {}: {} is not in {} ({} binding)",
                        describe(resource),
                        path,
                        code,
                        binding.system,
                        binding.strength
                    ));
                }
            }
        }
    }

    report
}

fn check_required(
    validator: &dyn TerminologyValidator,
    binding: &BindingDescriptor,
    element_type: &str,
    codes: &[Code<'_>],
    report: &mut BindingReport,
) -> Vec<String> {
    let mut results = Vec::new();
    for code in codes {
        match validator.validate_code(&binding.system, Some(code.code), code.system) {
            Ok(true) => results.push((code, Membership::Member)),
            Ok(false) => results.push((code, Membership::NotMember)),
            // unanswerable: warn, never invalid
            Err(error) => report.warn(unanswerable(binding, &error)),
        }
    }

    // A CodeableConcept needs only one member coding
    if element_type == "CodeableConcept" {
        let any_member = results.iter().any(|(_, m)| *m == Membership::Member);
        if any_member || results.is_empty() {
            return Vec::new();
        }
    }

    results
        .into_iter()
        .filter(|(_, m)| *m == Membership::NotMember)
        .map(|(code, _)| code.to_string())
        .collect()
}

fn check_extensible(
    validator: &dyn TerminologyValidator,
    binding: &BindingDescriptor,
    codes: &[Code<'_>],
    report: &mut BindingReport,
) -> Vec<String> {
    let mut invalid = Vec::new();
    for code in codes {
        if let Ok(true) = validator.validate_code(&binding.system, Some(code.code), code.system) {
            continue;
        }
        // Codes outside the ValueSet are allowed unless they come from one
        // of the systems it draws on
        let Some(system) = code.system else {
            continue;
        };
        match validator.validate_code(&binding.system, None, Some(system)) {
            Ok(true) => invalid.push(code.to_string()),
            Ok(false) => {}
            Err(error) => report.warn(unanswerable(binding, &error)),
        }
    }
    invalid
}

fn unanswerable(binding: &BindingDescriptor, error: &TerminologyError) -> String {
    format!("Could not check binding at {}: {}", binding.path, error)
}

fn codes_of<'a>(element_type: &str, element: &'a Value) -> Vec<Code<'a>> {
    let coding = |value: &'a Value| {
        value.get("code").and_then(Value::as_str).map(|code| Code {
            system: value.get("system").and_then(Value::as_str),
            code,
        })
    };
    match element_type {
        "CodeableConcept" => fhir_path::evaluate(element, "coding")
            .into_iter()
            .filter_map(coding)
            .collect(),
        "Coding" | "Quantity" => coding(element).into_iter().collect(),
        _ => element
            .as_str()
            .map(|code| Code { system: None, code })
            .into_iter()
            .collect(),
    }
}

fn describe(resource: &Value) -> String {
    format!(
        "{}/{}",
        resource.get("resourceType").and_then(Value::as_str).unwrap_or("Resource"),
        resource.get("id").and_then(Value::as_str).unwrap_or("<no id>")
    )
}
