//! Search steps

use super::state::{PatientSearch, SequenceState, TestContext};
use super::{SequenceRunner, StepResult, StepSignal};
use crate::client::{FhirClient, FhirResponse, SearchMethod, SearchParams, parse_reference};
use crate::fhir_path;
use crate::metadata::{Comparator, ProfileMetadata, SearchValueType, relative_path};
use crate::plan::SearchStep;
use crate::resolver::{
    SearchStrategy, comparator_value, resolve_date_bound, resolve_system_value, resolve_value,
};
use crate::retry::{Recovery, StatusRetry};
use crate::validation::{MatchRule, check_resource_against_params, matches};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Upper bound on result pages followed for one search
pub const MAX_PAGES: usize = 20;

pub(super) async fn run(
    runner: &SequenceRunner<'_>,
    step: &SearchStep,
    state: &mut SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    match step {
        SearchStep::Primary {
            names,
            strategy,
            status_retry,
            first,
        } => {
            let retry = status_retry
                .then(|| StatusRetry::for_search(runner.profile, names))
                .flatten();
            primary(runner, names, strategy, retry.as_ref(), *first, state, ctx).await
        }
        SearchStep::PostEquivalence => post_equivalence(runner, ctx).await,
        SearchStep::ReferenceVariant { param } => reference_variant(runner, param, ctx).await,
        SearchStep::SystemQualified { param } => system_qualified(runner, param, ctx).await,
        SearchStep::Comparator { param, comparator } => {
            comparator_search(runner, param, *comparator, ctx).await
        }
        SearchStep::MultipleOr { names, param } => {
            multiple_or(runner, names, param, state, ctx).await
        }
        SearchStep::Chained {
            param,
            chain,
            target,
            target_path,
            value_type,
        } => chained(runner, param, chain, target, target_path, value_type, state, ctx).await,
        SearchStep::Include { include, target } => {
            for params in shaped_bases(runner.resource_type(), state) {
                let found = shaped_search(runner, params, "_include", include, ctx).await?;
                for resource in of_type(found, target) {
                    state.include(target, resource);
                }
            }
            Ok(())
        }
        SearchStep::Revinclude { revinclude, source } => {
            for params in shaped_bases(runner.resource_type(), state) {
                let found = shaped_search(runner, params, "_revinclude", revinclude, ctx).await?;
                ctx.revincluded.extend(of_type(found, source));
            }
            Ok(())
        }
    }
}

/// Fail unless the response is a 200 Bundle
fn assert_bundle(response: &FhirResponse) -> StepResult {
    if response.status != 200 {
        return Err(StepSignal::Fail(format!(
            "Unexpected response status: expected 200, but received {}",
            response.status
        )));
    }
    if !response.is_bundle() {
        return Err(StepSignal::Fail(format!(
            "Expected a Bundle, but received {}",
            response.resource_type().unwrap_or("a body without resourceType")
        )));
    }
    Ok(())
}

/// Every entry of a search response, following `next` links
pub async fn fetch_all(
    client: &dyn FhirClient,
    first: FhirResponse,
) -> std::result::Result<Vec<Value>, StepSignal> {
    let mut entries: Vec<Value> = first.entries().into_iter().cloned().collect();
    let mut next = first.next_link().map(str::to_string);
    let mut pages = 1;

    while let Some(url) = next {
        if pages >= MAX_PAGES {
            warn!("Stopped paging after {} pages at {}", MAX_PAGES, url);
            break;
        }
        let page = client.fetch(&url).await?;
        assert_bundle(&page)?;
        entries.extend(page.entries().into_iter().cloned());
        next = page.next_link().map(str::to_string);
        pages += 1;
    }

    Ok(entries)
}

/// Issue one search and collect its entries
///
/// With a status retry, a 400 is retried with status values and `params`
/// picks up the status that worked.
async fn search_entries(
    runner: &SequenceRunner<'_>,
    params: &mut SearchParams,
    method: SearchMethod,
    retry: Option<&StatusRetry>,
    ctx: &mut TestContext,
) -> std::result::Result<Vec<Value>, StepSignal> {
    let resource_type = runner.resource_type();
    debug!("Searching {}?{}", resource_type, query_string(params));
    let mut response = runner.client.search(resource_type, params, method).await?;

    if let Some(retry) = retry {
        response = match retry
            .recover(
                runner.client,
                resource_type,
                params,
                response,
                runner.capabilities.as_ref(),
            )
            .await?
        {
            Recovery::Unchanged(response) => response,
            Recovery::Recovered {
                response,
                status,
                warnings,
            } => {
                debug!("Search recovered with {}={}", retry.param(), status);
                warnings.into_iter().for_each(|w| ctx.warn(w));
                response
            }
            Recovery::Exhausted { original, warnings } => {
                warnings.into_iter().for_each(|w| ctx.warn(w));
                original
            }
            Recovery::InvalidOutcome(message) => return Err(StepSignal::Fail(message)),
        };
    }

    assert_bundle(&response)?;
    fetch_all(runner.client, response).await
}

/// Repeat a first search with one extra result-shaping parameter
async fn shaped_search(
    runner: &SequenceRunner<'_>,
    mut params: SearchParams,
    name: &str,
    value: &str,
    ctx: &mut TestContext,
) -> std::result::Result<Vec<Value>, StepSignal> {
    params.insert(name.to_string(), value.to_string());
    search_entries(runner, &mut params, SearchMethod::Get, None, ctx).await
}

/// Searches repeated with `_include` or `_revinclude`
///
/// The first searches of the sequence, or for a sequence seeded by reads a
/// single `_id` search over the captured resources.
fn shaped_bases(resource_type: &str, state: &SequenceState) -> Vec<SearchParams> {
    if !state.first_searches.is_empty() {
        return state.first_searches.iter().map(|s| s.params.clone()).collect();
    }
    let ids: Vec<&str> = state
        .resources
        .iter()
        .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some(resource_type))
        .filter_map(|r| r.get("id").and_then(Value::as_str))
        .collect();
    if ids.is_empty() {
        return Vec::new();
    }
    let mut params = SearchParams::new();
    params.insert("_id".to_string(), ids.join(","));
    vec![params]
}

fn of_type(entries: Vec<Value>, resource_type: &str) -> Vec<Value> {
    entries
        .into_iter()
        .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some(resource_type))
        .collect()
}

fn ids(resources: &[Value]) -> BTreeSet<String> {
    resources
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

pub(super) fn query_string(params: &SearchParams) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parameters for `names`, or `None` when a value cannot be resolved
///
/// `patient` takes the patient id, `fixed` supplies one parameter directly,
/// and every other value is resolved from `resources`.
fn build_params(
    profile: &ProfileMetadata,
    names: &[String],
    patient_id: &str,
    fixed: Option<(&str, String)>,
    resources: &[Value],
) -> Option<SearchParams> {
    let mut params = SearchParams::new();
    for name in names {
        let value = match &fixed {
            Some((param, value)) if *param == name.as_str() => value.clone(),
            _ if name == "patient" => patient_id.to_string(),
            _ => {
                let definition = profile.search_definition(name)?;
                resolve_value(&definition.path, &definition.value_type, resources, |_| false)?
            }
        };
        params.insert(name.clone(), value);
    }
    Some(params)
}

fn validate_entries(
    runner: &SequenceRunner<'_>,
    resources: &[Value],
    params: &SearchParams,
) -> StepResult {
    for resource in resources {
        check_resource_against_params(resource, params, runner.profile, runner.client.base_url())
            .map_err(StepSignal::Fail)?;
    }
    Ok(())
}

fn no_resources(resource_type: &str) -> StepSignal {
    StepSignal::Skip(format!(
        "No {resource_type} resources appear to be available. \
         Please use patients with more information."
    ))
}

async fn primary(
    runner: &SequenceRunner<'_>,
    names: &[String],
    strategy: &SearchStrategy,
    retry: Option<&StatusRetry>,
    first: bool,
    state: &SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let mut attempted = false;

    for patient_id in &runner.options.patient_ids {
        match strategy {
            SearchStrategy::FixedValue {
                param,
                values,
                stop_after,
            } => {
                let mut productive = 0;
                for value in values {
                    let fixed = Some((param.as_str(), value.render(patient_id)));
                    let Some(mut params) =
                        build_params(runner.profile, names, patient_id, fixed, &[])
                    else {
                        continue;
                    };
                    attempted = true;
                    let found = of_type(
                        search_entries(runner, &mut params, SearchMethod::Get, retry, ctx).await?,
                        resource_type,
                    );
                    if found.is_empty() {
                        continue;
                    }
                    ctx.searches.push(PatientSearch {
                        patient_id: patient_id.clone(),
                        params,
                        resources: found,
                    });
                    productive += 1;
                    if productive >= *stop_after {
                        break;
                    }
                }
            }
            SearchStrategy::PatientScoped | SearchStrategy::ResolveFromResources => {
                let resources = state.resources_for(patient_id);
                if !first && resources.is_empty() {
                    continue;
                }
                let Some(mut params) =
                    build_params(runner.profile, names, patient_id, None, &resources)
                else {
                    continue;
                };
                attempted = true;
                let found = of_type(
                    search_entries(runner, &mut params, SearchMethod::Get, retry, ctx).await?,
                    resource_type,
                );
                if found.is_empty() {
                    if first {
                        continue;
                    }
                    return Err(StepSignal::Fail(format!(
                        "No {resource_type} resources returned for search by {}",
                        query_string(&params)
                    )));
                }
                ctx.searches.push(PatientSearch {
                    patient_id: patient_id.clone(),
                    params,
                    resources: found,
                });
            }
        }
    }

    if !ctx.searches.is_empty() {
        return Ok(());
    }
    if attempted {
        return Err(no_resources(resource_type));
    }
    if let SearchStrategy::FixedValue { param, values, .. } = strategy
        && values.is_empty()
    {
        return Err(StepSignal::Skip(format!("No values are declared for {param}")));
    }
    Err(StepSignal::Skip(format!(
        "Could not find values for all search params {}",
        names.join(", ")
    )))
}

async fn post_equivalence(runner: &SequenceRunner<'_>, ctx: &mut TestContext) -> StepResult {
    if !runner.options.post_search {
        return Ok(());
    }
    let resource_type = runner.resource_type();
    let searches = ctx.searches.clone();
    for search in searches {
        let mut params = search.params.clone();
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Post, None, ctx).await?,
            resource_type,
        );
        if ids(&found) != ids(&search.resources) {
            return Err(StepSignal::Fail(format!(
                "POST search returned {} {resource_type} resources for {}, GET returned {}",
                found.len(),
                query_string(&search.params),
                search.resources.len()
            )));
        }
    }
    Ok(())
}

async fn reference_variant(
    runner: &SequenceRunner<'_>,
    param: &str,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let searches = ctx.searches.clone();
    for search in searches {
        let Some(id) = search.params.get(param) else {
            continue;
        };
        let reference = format!("Patient/{id}");
        let mut params = search.params.clone();
        params.insert(param.to_string(), reference.clone());
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Get, None, ctx).await?,
            resource_type,
        );
        if found.len() != search.resources.len() {
            return Err(StepSignal::Fail(format!(
                "Expected {} {resource_type} resources when searching with {param}={reference}, \
                 received {}",
                search.resources.len(),
                found.len()
            )));
        }
    }
    Ok(())
}

async fn system_qualified(
    runner: &SequenceRunner<'_>,
    param: &str,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let Some(definition) = runner.profile.search_definition(param) else {
        return Ok(());
    };
    let searches = ctx.searches.clone();
    for search in searches {
        let Some(value) = search.params.get(param) else {
            continue;
        };
        let Some(qualified) =
            resolve_system_value(&definition.path, &definition.value_type, &search.resources, value)
        else {
            continue;
        };
        let mut params = search.params.clone();
        params.insert(param.to_string(), qualified);
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Get, None, ctx).await?,
            resource_type,
        );
        if found.is_empty() {
            return Err(StepSignal::Fail(format!(
                "No {resource_type} resources returned for search by {}",
                query_string(&params)
            )));
        }
        validate_entries(runner, &found, &params)?;
    }
    Ok(())
}

async fn comparator_search(
    runner: &SequenceRunner<'_>,
    param: &str,
    comparator: Comparator,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let Some(definition) = runner.profile.search_definition(param) else {
        return Ok(());
    };
    let searches = ctx.searches.clone();
    for search in searches {
        let bound = resolve_date_bound(&definition.path, &search.resources)
            .or_else(|| search.params.get(param).cloned());
        let Some(value) = bound.and_then(|v| comparator_value(comparator, &v)) else {
            continue;
        };
        let mut params = search.params.clone();
        params.insert(param.to_string(), value);
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Get, None, ctx).await?,
            resource_type,
        );
        validate_entries(runner, &found, &params)?;
    }
    Ok(())
}

async fn multiple_or(
    runner: &SequenceRunner<'_>,
    names: &[String],
    param: &str,
    state: &SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let Some(definition) = runner.profile.search_definition(param) else {
        return Err(StepSignal::Skip(format!("No search definition for {param}")));
    };
    let retry = StatusRetry::for_search(runner.profile, names);
    let rule = MatchRule::for_param(param, &definition.value_type, runner.client.base_url());
    let path = relative_path(&definition.path);
    let mut performed = false;

    for patient_id in &runner.options.patient_ids {
        let resources = state.resources_for(patient_id);
        if resources.is_empty() {
            continue;
        }
        let Some(first_value) =
            resolve_value(&definition.path, &definition.value_type, &resources, |_| false)
        else {
            continue;
        };
        let Some(second_value) = resolve_value(
            &definition.path,
            &definition.value_type,
            &resources,
            |value| value == first_value,
        ) else {
            continue;
        };

        let fixed = Some((param, format!("{first_value},{second_value}")));
        let Some(mut params) = build_params(runner.profile, names, patient_id, fixed, &resources)
        else {
            continue;
        };
        performed = true;
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Get, retry.as_ref(), ctx).await?,
            resource_type,
        );

        for value in [&first_value, &second_value] {
            let matched = found
                .iter()
                .any(|resource| matches(&rule, value, &fhir_path::evaluate(resource, path)));
            if !matched {
                return Err(StepSignal::Fail(format!(
                    "Could not find {resource_type} resources with {param}={value} in the \
                     multipleOr search results"
                )));
            }
        }
    }

    if performed {
        Ok(())
    } else {
        Err(StepSignal::Skip(format!(
            "Could not find two distinct values for {param} to perform a multipleOr search"
        )))
    }
}

#[allow(clippy::too_many_arguments)]
async fn chained(
    runner: &SequenceRunner<'_>,
    param: &str,
    chain: &str,
    target: &str,
    target_path: &str,
    value_type: &SearchValueType,
    state: &SequenceState,
    ctx: &mut TestContext,
) -> StepResult {
    let resource_type = runner.resource_type();
    let Some(definition) = runner.profile.search_definition(param) else {
        return Err(StepSignal::Skip(format!("No search definition for {param}")));
    };
    let reference_path = format!("{}.reference", relative_path(&definition.path));

    for resource in &state.resources {
        let Some(id) = resource.get("id").and_then(Value::as_str) else {
            continue;
        };
        let Some((target_type, target_id)) = fhir_path::evaluate(resource, &reference_path)
            .into_iter()
            .filter_map(Value::as_str)
            .filter_map(parse_reference)
            .find(|(t, _)| t == target)
        else {
            continue;
        };

        let response = runner.client.read(&target_type, &target_id).await?;
        if !response.is_success() {
            debug!("Could not read {}/{} for chained search", target_type, target_id);
            continue;
        }
        let Some(value) =
            resolve_value(target_path, value_type, std::slice::from_ref(&response.body), |_| false)
        else {
            continue;
        };

        let mut params = SearchParams::new();
        params.insert(format!("{param}.{chain}"), value);
        let found = of_type(
            search_entries(runner, &mut params, SearchMethod::Get, None, ctx).await?,
            resource_type,
        );
        if !ids(&found).contains(id) {
            return Err(StepSignal::Fail(format!(
                "{resource_type}/{id} was not returned by the chained search {}",
                query_string(&params)
            )));
        }
        return Ok(());
    }

    Err(StepSignal::Skip(format!(
        "Could not find a {target} with a {chain} value to perform the chained search"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ParamValue;
    use serde_json::json;

    fn profile() -> ProfileMetadata {
        serde_json::from_value(json!({
            "resourceType": "Condition",
            "profileUrl": "http://example.org/condition",
            "canonicalName": "condition",
            "searchDefinitions": {
                "patient": { "path": "Condition.subject", "type": "Reference" },
                "code": { "path": "Condition.code", "type": "CodeableConcept" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_build_params_resolves_from_resources() {
        let resources = [json!({
            "resourceType": "Condition",
            "id": "c1",
            "code": { "coding": [{ "system": "http://snomed.info/sct", "code": "44054006" }] }
        })];
        let names = vec!["patient".to_string(), "code".to_string()];
        let params = build_params(&profile(), &names, "85", None, &resources).unwrap();
        assert_eq!(query_string(&params), "patient=85&code=44054006");

        assert!(build_params(&profile(), &names, "85", None, &[]).is_none());
    }

    #[test]
    fn test_build_params_prefers_fixed_value() {
        let names = vec!["patient".to_string(), "code".to_string()];
        let fixed = Some(("code", ParamValue::Literal("x".into()).render("85")));
        let params = build_params(&profile(), &names, "85", fixed, &[]).unwrap();
        assert_eq!(params["code"], "x");
    }

    #[test]
    fn test_shaped_bases_fall_back_to_captured_ids() {
        let mut state = SequenceState::default();
        assert!(shaped_bases("Encounter", &state).is_empty());

        state.capture(vec![
            json!({ "resourceType": "Encounter", "id": "e1" }),
            json!({ "resourceType": "Encounter", "id": "e2" }),
            json!({ "resourceType": "Patient", "id": "85" }),
        ]);
        let bases = shaped_bases("Encounter", &state);
        assert_eq!(bases.len(), 1);
        assert_eq!(query_string(&bases[0]), "_id=e1,e2");

        let mut params = SearchParams::new();
        params.insert("patient".to_string(), "85".to_string());
        state.first_searches.push(PatientSearch {
            patient_id: "85".to_string(),
            params: params.clone(),
            resources: vec![],
        });
        assert_eq!(shaped_bases("Encounter", &state), vec![params]);
    }

    #[test]
    fn test_assert_bundle() {
        let bundle = FhirResponse::new(200, json!({ "resourceType": "Bundle" }));
        assert!(assert_bundle(&bundle).is_ok());
        assert!(matches!(
            assert_bundle(&FhirResponse::new(500, json!({}))),
            Err(StepSignal::Fail(_))
        ));
        assert!(matches!(
            assert_bundle(&FhirResponse::new(200, json!({ "resourceType": "Patient" }))),
            Err(StepSignal::Fail(_))
        ));
    }
}
