//! Read, validation, capture and assertion steps

use super::must_support::missing_must_support;
use super::state::{SequenceState, TestContext, identity, record_reference};
use super::{SequenceRunner, StepResult, StepSignal};
use crate::client::{FhirResponse, parse_reference};
use crate::fhir_path;
use crate::metadata::{BindingDescriptor, InteractionCode};
use crate::plan::{Assertion, Capture, ReadStep, Validation};
use crate::terminology::check_bindings;
use crate::validation::check_resource_against_params;
use serde_json::Value;
use tracing::debug;

pub(super) async fn read(
    runner: &SequenceRunner<'_>,
    step: &ReadStep,
    state: &SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    match step {
        ReadStep::DiscoveredReferences => {
            let resource_type = runner.resource_type();
            for reference in &runner.incoming {
                let Some((_, id)) = parse_reference(reference) else {
                    ctx.warn(format!("Could not read {reference}: unsupported reference format"));
                    continue;
                };
                let response = runner.client.read(resource_type, &id).await?;
                assert_resource(&response, resource_type, &id)?;
                ctx.resources.push(response.body);
            }
            Ok(())
        }
        ReadStep::Interaction { code } => interaction(runner, *code, state).await,
        ReadStep::References { limit } => {
            let limit = runner.options.max_references.unwrap_or(*limit);
            resolve_references(runner, &state.resources, limit, ctx).await
        }
    }
}

/// Fail unless `response` is a 200 holding `resource_type/id`
fn assert_resource(response: &FhirResponse, resource_type: &str, id: &str) -> StepResult {
    if response.status != 200 {
        return Err(StepSignal::Fail(format!(
            "Unexpected response status reading {resource_type}/{id}: expected 200, but \
             received {}",
            response.status
        )));
    }
    let actual_type = response.resource_type().unwrap_or_default();
    if actual_type != resource_type {
        return Err(StepSignal::Fail(format!(
            "Expected a {resource_type} resource, but received {actual_type}"
        )));
    }
    let actual_id = response.body.get("id").and_then(Value::as_str).unwrap_or_default();
    if actual_id != id {
        return Err(StepSignal::Fail(format!(
            "Requested {resource_type}/{id}, but received {resource_type}/{actual_id}"
        )));
    }
    Ok(())
}

fn assert_history(response: &FhirResponse, require_entries: bool) -> StepResult {
    if response.status != 200 {
        return Err(StepSignal::Fail(format!(
            "Unexpected response status: expected 200, but received {}",
            response.status
        )));
    }
    if !response.is_bundle() {
        return Err(StepSignal::Fail("History response is not a Bundle".to_string()));
    }
    if require_entries && response.entries().is_empty() {
        return Err(StepSignal::Fail("History Bundle has no entries".to_string()));
    }
    Ok(())
}

async fn interaction(
    runner: &SequenceRunner<'_>,
    code: InteractionCode,
    state: &SequenceState,
) -> StepResult {
    let resource_type = runner.resource_type();
    let Some(resource) = state
        .resources
        .iter()
        .find(|r| r.get("id").and_then(Value::as_str).is_some())
    else {
        return Err(StepSignal::Skip(format!(
            "No {resource_type} resource with an id was found"
        )));
    };
    let id = resource.get("id").and_then(Value::as_str).unwrap_or_default();

    match code {
        InteractionCode::Read => {
            let response = runner.client.read(resource_type, id).await?;
            assert_resource(&response, resource_type, id)
        }
        InteractionCode::Vread => {
            let Some(version) = resource
                .get("meta")
                .and_then(|meta| meta.get("versionId"))
                .and_then(Value::as_str)
            else {
                return Err(StepSignal::Skip(format!(
                    "{resource_type}/{id} has no meta.versionId"
                )));
            };
            let response = runner.client.vread(resource_type, id, version).await?;
            assert_resource(&response, resource_type, id)
        }
        InteractionCode::HistoryInstance => {
            let response = runner.client.history(resource_type, Some(id)).await?;
            assert_history(&response, true)
        }
        InteractionCode::HistoryType => {
            let response = runner.client.history(resource_type, None).await?;
            assert_history(&response, false)
        }
        other => Err(StepSignal::Todo(format!(
            "The {} interaction is not exercised",
            other.display_name()
        ))),
    }
}

async fn resolve_references(
    runner: &SequenceRunner<'_>,
    resources: &[Value],
    limit: usize,
    ctx: &mut TestContext,
) -> StepResult {
    let mut references: Vec<String> = Vec::new();
    for resource in resources {
        for reference in fhir_path::collect_references(resource) {
            if !references.contains(&reference) {
                references.push(reference);
            }
        }
    }
    if references.len() > limit {
        debug!("Reading {} of {} references", limit, references.len());
        references.truncate(limit);
    }

    let base_url = runner.client.base_url();
    let mut unresolved = Vec::new();
    for reference in references {
        let external = reference.starts_with("http") && !reference.starts_with(base_url);
        let Some((resource_type, id)) = parse_reference(&reference) else {
            ctx.warn(format!("Could not resolve {reference}: unsupported reference format"));
            continue;
        };
        let response = if external {
            runner.client.fetch(&reference).await?
        } else {
            runner.client.read(&resource_type, &id).await?
        };
        if !response.is_success() || response.resource_type() != Some(resource_type.as_str()) {
            unresolved.push(reference);
        }
    }

    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(StepSignal::Fail(format!(
            "Could not resolve references: {}",
            unresolved.join(", ")
        )))
    }
}

pub(super) fn validate(
    runner: &SequenceRunner<'_>,
    validation: &Validation,
    state: &SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    match validation {
        Validation::SearchResults => {
            let base_url = runner.client.base_url();
            for search in &ctx.searches {
                for resource in &search.resources {
                    check_resource_against_params(
                        resource,
                        &search.params,
                        runner.profile,
                        base_url,
                    )
                    .map_err(StepSignal::Fail)?;
                }
            }
            Ok(())
        }
        Validation::Bindings {
            bindings,
            required_concepts,
        } => validate_bindings(runner, &state.resources, bindings, required_concepts, ctx),
        Validation::MedicationBindings { bindings } => {
            let mut medications: Vec<Value> = state.included("Medication").to_vec();
            medications.extend(contained_medications(&state.resources));
            validate_bindings(runner, &medications, bindings, &[], ctx)
        }
        Validation::MustSupport { elements } => {
            let missing = missing_must_support(&state.resources, elements);
            if missing.is_empty() {
                return Ok(());
            }
            Err(StepSignal::Skip(format!(
                "Could not find {} in the {} provided {} resource(s)",
                missing.join(", "),
                state.resources.len(),
                runner.resource_type()
            )))
        }
    }
}

fn validate_bindings(
    runner: &SequenceRunner<'_>,
    resources: &[Value],
    bindings: &[BindingDescriptor],
    required_concepts: &[String],
    ctx: &mut TestContext,
) -> StepResult {
    let Some(validator) = runner.terminology() else {
        ctx.warn("No terminology is loaded; bindings were not checked");
        return Ok(());
    };
    let report = check_bindings(validator.as_ref(), resources, bindings, required_concepts);
    for warning in report.warnings {
        ctx.warn(warning);
    }
    if report.invalid.is_empty() {
        Ok(())
    } else {
        Err(StepSignal::Fail(report.invalid.join("; ")))
    }
}

fn contained_medications(resources: &[Value]) -> Vec<Value> {
    resources
        .iter()
        .flat_map(|r| r.get("contained").and_then(Value::as_array).into_iter().flatten())
        .filter(|c| c.get("resourceType").and_then(Value::as_str) == Some("Medication"))
        .cloned()
        .collect()
}

pub(super) fn capture(capture: &Capture, state: &mut SequenceState, ctx: &TestContext) {
    match capture {
        Capture::Resources => {
            if !ctx.searches.is_empty() {
                state.first_searches = ctx.searches.clone();
            }
            let searched = ctx.searches.iter().flat_map(|s| s.resources.iter().cloned());
            let read = ctx.resources.iter().cloned();
            state.capture(searched.chain(read).collect::<Vec<_>>());
        }
        Capture::DelayedReferences { references } => {
            let mut found = Vec::new();
            for resource in &state.resources {
                for delayed in references {
                    for reference in references_at(resource, &delayed.path) {
                        if let Some((resource_type, id)) = parse_reference(&reference)
                            && delayed.resources.contains(&resource_type)
                        {
                            let reference = format!("{resource_type}/{id}");
                            found.push((resource_type, reference));
                        }
                    }
                }
            }
            for (resource_type, reference) in found {
                record_reference(&mut state.discovered, &resource_type, &reference);
            }
        }
        Capture::Revincluded { resource_type } => {
            for resource in &ctx.revincluded {
                if let Some(reference) = identity(resource)
                    && reference.starts_with(&format!("{resource_type}/"))
                {
                    record_reference(&mut state.discovered, resource_type, &reference);
                }
            }
        }
    }
}

/// Reference strings held at `path` of `resource`
pub(super) fn references_at(resource: &Value, path: &str) -> Vec<String> {
    fhir_path::evaluate(resource, path)
        .into_iter()
        .filter_map(|value| match value {
            Value::String(reference) => Some(reference.clone()),
            Value::Object(map) => map.get("reference").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect()
}

pub(super) fn assert(
    assertion: &Assertion,
    state: &SequenceState,
    ctx: &TestContext,
) -> StepResult {
    match assertion {
        Assertion::IncludedFound { target } => {
            if state.included(target).is_empty() {
                return Err(StepSignal::Fail(format!(
                    "No {target} resources were included in the search results"
                )));
            }
            Ok(())
        }
        Assertion::RevincludedFound { source } => {
            let found = ctx
                .revincluded
                .iter()
                .any(|r| r.get("resourceType").and_then(Value::as_str) == Some(source.as_str()));
            if !found {
                return Err(StepSignal::Fail(format!(
                    "No {source} resources were returned by the _revinclude search"
                )));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assert_resource() {
        let ok = FhirResponse::new(200, json!({ "resourceType": "Encounter", "id": "e1" }));
        assert!(assert_resource(&ok, "Encounter", "e1").is_ok());
        assert!(assert_resource(&ok, "Encounter", "e2").is_err());
        assert!(assert_resource(&ok, "Location", "e1").is_err());
        let missing = FhirResponse::new(404, json!({ "resourceType": "OperationOutcome" }));
        assert!(matches!(
            assert_resource(&missing, "Encounter", "e1"),
            Err(StepSignal::Fail(_))
        ));
    }

    #[test]
    fn test_references_at() {
        let resource = json!({
            "resourceType": "Observation",
            "encounter": { "reference": "Encounter/e1" },
            "performer": [{ "reference": "Practitioner/p1" }, { "reference": "#contained" }]
        });
        assert_eq!(references_at(&resource, "encounter"), vec!["Encounter/e1"]);
        assert_eq!(references_at(&resource, "performer").len(), 2);
    }

    #[test]
    fn test_contained_medications() {
        let request = json!({
            "resourceType": "MedicationRequest",
            "contained": [
                { "resourceType": "Medication", "id": "m1" },
                { "resourceType": "Organization", "id": "o1" }
            ]
        });
        assert_eq!(contained_medications(&[request]).len(), 1);
    }
}
