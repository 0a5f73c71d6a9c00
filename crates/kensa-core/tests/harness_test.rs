//! Execution harness tests against a scripted server

mod common;

use common::*;
use kensa_core::client::{FhirResponse, SearchMethod};
use kensa_core::{RunOptions, SequenceRunner, SuiteRunner, TestOutcome, compile};
use serde_json::{Value, json};

fn options() -> RunOptions {
    RunOptions {
        patient_ids: vec!["85".to_string()],
        ..Default::default()
    }
}

fn patient() -> Value {
    json!({ "resourceType": "Patient", "id": "85" })
}

fn condition() -> Value {
    json!({
        "resourceType": "Condition",
        "id": "c1",
        "meta": { "versionId": "1" },
        "subject": { "reference": "Patient/85" },
        "encounter": { "reference": "Encounter/e1" },
        "clinicalStatus": { "coding": [{
            "system": "http://terminology.hl7.org/CodeSystem/condition-clinical",
            "code": "recurrence"
        }] },
        "category": [{ "coding": [{
            "system": "http://terminology.hl7.org/CodeSystem/condition-category",
            "code": "problem-list-item"
        }] }],
        "onsetDateTime": "2020-03-01"
    })
}

fn encounter() -> Value {
    json!({
        "resourceType": "Encounter",
        "id": "e1",
        "subject": { "reference": "Patient/85" }
    })
}

fn medication_request() -> Value {
    json!({
        "resourceType": "MedicationRequest",
        "id": "mr1",
        "status": "active",
        "intent": "order",
        "subject": { "reference": "Patient/85" },
        "medicationReference": { "reference": "#med1" },
        "contained": [{
            "resourceType": "Medication",
            "id": "med1",
            "code": { "text": "aspirin" }
        }]
    })
}

fn medication() -> Value {
    json!({
        "resourceType": "Medication",
        "id": "med1",
        "code": { "coding": [{
            "system": "http://www.nlm.nih.gov/research/umls/rxnorm",
            "code": "1049502"
        }] }
    })
}

/// MedicationRequest pointing at a Medication on the server
fn external_medication_request() -> Value {
    let mut request = medication_request();
    request.as_object_mut().unwrap().remove("contained");
    request["medicationReference"] = json!({ "reference": "Medication/med1" });
    request
}

fn provenance() -> Value {
    json!({
        "resourceType": "Provenance",
        "id": "prov1",
        "target": [{ "reference": "Encounter/e1" }]
    })
}

/// Reads of the fixture resources by id
fn read(resource_type: &str, id: &str) -> FhirResponse {
    let resource = match (resource_type, id) {
        ("Patient", "85") => patient(),
        ("Condition", "c1") => condition(),
        ("Encounter", "e1") => encounter(),
        ("MedicationRequest", "mr1") => medication_request(),
        ("Medication", "med1") => medication(),
        ("Observation", id) => json!({ "resourceType": "Observation", "id": id }),
        _ => return not_found(),
    };
    FhirResponse::new(200, resource)
}

fn clinical_status(resource: &Value) -> Option<&str> {
    resource["clinicalStatus"]["coding"][0]["code"].as_str()
}

fn condition_with_status(id: &str, status: &str) -> Value {
    let mut resource = condition();
    resource["id"] = json!(id);
    resource["clinicalStatus"]["coding"][0]["code"] = json!(status);
    resource
}

/// Server holding `conditions`, filtering searches by clinical status
fn condition_server(conditions: Vec<Value>) -> ScriptedClient {
    ScriptedClient::new(move |request| match request {
        Request::Search {
            resource_type,
            params,
            ..
        } if resource_type == "Condition" => {
            let statuses: Option<Vec<&str>> = params
                .get("clinical-status")
                .map(|value| value.split(',').filter_map(|s| s.rsplit('|').next()).collect());
            bundle(
                conditions
                    .iter()
                    .filter(|c| {
                        statuses
                            .as_ref()
                            .is_none_or(|s| clinical_status(c).is_some_and(|cs| s.contains(&cs)))
                    })
                    .cloned()
                    .collect(),
            )
        }
        Request::Read { resource_type, id } | Request::Vread { resource_type, id, .. }
            if resource_type == "Condition" =>
        {
            conditions
                .iter()
                .find(|c| c["id"] == id.as_str())
                .map(|c| FhirResponse::new(200, c.clone()))
                .unwrap_or_else(not_found)
        }
        Request::Read { resource_type, id } => read(resource_type, id),
        _ => not_found(),
    })
}

/// Run the Condition sequence alone against `client`
async fn run_conditions(
    client: &ScriptedClient,
    options: &RunOptions,
) -> kensa_core::SequenceReport {
    let profile = condition_profile();
    let metadata = metadata_set(vec![profile.clone()]);
    let plan = compile(&profile, &metadata).unwrap();
    SequenceRunner::new(&profile, &plan, client, options)
        .with_capabilities(Some(capability_statement().body))
        .run()
        .await
}

fn param_values(client: &ScriptedClient, name: &str) -> Vec<String> {
    client
        .requests()
        .iter()
        .filter_map(|r| r.param(name).map(str::to_string))
        .collect()
}

/// Condition profile trying one status value per retry
fn condition_without_multiple_or() -> kensa_core::ProfileMetadata {
    let mut profile = condition_profile();
    if let Some(definition) = profile.search_definitions.get_mut("clinical-status") {
        definition.multiple_or = None;
    }
    profile
}

#[tokio::test]
async fn test_status_retry_recovers_first_search() {
    let profile = condition_without_multiple_or();
    let metadata = metadata_set(vec![profile.clone(), encounter_profile()]);
    let plan = compile(&profile, &metadata).unwrap();

    let client = ScriptedClient::new(|request| match request {
        Request::Search { params, .. } => match params.get("clinical-status").map(String::as_str) {
            None => outcome(400),
            Some("recurrence") => bundle(vec![condition()]),
            Some(_) => bundle(vec![]),
        },
        Request::Read { resource_type, id } => read(resource_type, id),
        _ => not_found(),
    });
    let options = options();
    let report = SequenceRunner::new(&profile, &plan, &client, &options)
        .with_capabilities(Some(capability_statement().body))
        .run()
        .await;

    let first = report
        .result("us_core_condition_search_by_patient_test")
        .unwrap();
    assert_eq!(first.outcome, TestOutcome::Pass, "{:?}", first.message);
    assert!(first.warnings.is_empty());

    let statuses: Vec<String> = client
        .requests()
        .iter()
        .take_while(|r| r.param("clinical-status") != Some("recurrence"))
        .filter_map(|r| r.param("clinical-status").map(str::to_string))
        .collect();
    assert_eq!(statuses, vec!["active"]);

    // the recovered status rides along on the POST repeat
    let post = client
        .requests()
        .into_iter()
        .find(|r| matches!(r, Request::Search { method: SearchMethod::Post, .. }))
        .unwrap();
    assert_eq!(post.param("patient"), Some("85"));
    assert_eq!(post.param("clinical-status"), Some("recurrence"));

    assert_eq!(
        report.discovered.get("Encounter"),
        Some(&vec!["Encounter/e1".to_string()])
    );
}

#[tokio::test]
async fn test_status_retry_exhausted_surfaces_original_failure() {
    let profile = condition_without_multiple_or();
    let metadata = metadata_set(vec![profile.clone()]);
    let plan = compile(&profile, &metadata).unwrap();

    let client = ScriptedClient::new(|request| match request {
        Request::Search { params, .. } if !params.contains_key("clinical-status") => outcome(400),
        Request::Search { .. } => bundle(vec![]),
        _ => not_found(),
    });
    let options = options();
    let report = SequenceRunner::new(&profile, &plan, &client, &options)
        .run()
        .await;

    let first = report
        .result("us_core_condition_search_by_patient_test")
        .unwrap();
    assert_eq!(first.outcome, TestOutcome::Fail);
    assert!(first.message.as_deref().unwrap_or_default().contains("400"));
    // no CapabilityStatement was supplied
    assert!(first.warnings.iter().any(|w| w.contains("CapabilityStatement")));

    let read = report.result("us_core_condition_read_test").unwrap();
    assert_eq!(read.outcome, TestOutcome::Skip);
    assert!(report.failed());
}

#[tokio::test]
async fn test_multiple_or_status_uses_single_joined_retry() {
    let profile = condition_profile();
    let metadata = metadata_set(vec![profile.clone()]);
    let plan = compile(&profile, &metadata).unwrap();

    let client = ScriptedClient::new(|request| match request {
        Request::Search { params, .. } if !params.contains_key("clinical-status") => outcome(400),
        Request::Search { .. } => bundle(vec![condition()]),
        Request::Read { resource_type, id } => read(resource_type, id),
        _ => not_found(),
    });
    let options = options();
    let report = SequenceRunner::new(&profile, &plan, &client, &options)
        .with_capabilities(Some(capability_statement().body))
        .run()
        .await;

    let first = report
        .result("us_core_condition_search_by_patient_test")
        .unwrap();
    assert_eq!(first.outcome, TestOutcome::Pass, "{:?}", first.message);
    assert_eq!(
        client.requests()[1].param("clinical-status"),
        Some("active,recurrence,relapse,inactive,remission,resolved")
    );
}

#[tokio::test]
async fn test_contained_medication_is_omitted_from_include_checks() {
    let metadata = metadata_set(vec![medication_request_profile(), medication_profile()]);

    let client = ScriptedClient::new(|request| match request {
        Request::Capabilities => capability_statement(),
        Request::Search { resource_type, .. } if resource_type == "MedicationRequest" => {
            bundle(vec![medication_request()])
        }
        Request::Read { resource_type, id } => read(resource_type, id),
        _ => not_found(),
    });
    let report = SuiteRunner::new(&metadata, &client, options()).run().await;

    let sequence = report.sequence("us_core_medicationrequest").unwrap();
    let outcome = |key: &str| sequence.result(key).map(|r| r.outcome);
    assert_eq!(
        outcome("us_core_medicationrequest_search_by_patient_intent_test"),
        Some(TestOutcome::Pass)
    );
    assert_eq!(
        outcome("us_core_medicationrequest_include_test"),
        Some(TestOutcome::Omit)
    );
    assert_eq!(
        outcome("us_core_medicationrequest_medication_validation_test"),
        Some(TestOutcome::Omit)
    );
    assert_eq!(
        outcome("us_core_medicationrequest_must_support_test"),
        Some(TestOutcome::Pass)
    );
    assert_eq!(
        outcome("us_core_medicationrequest_reference_resolution_test"),
        Some(TestOutcome::Pass)
    );

    // only the first declared intent is needed
    let intents: Vec<String> = client
        .requests()
        .iter()
        .filter_map(|r| r.param("intent").map(str::to_string))
        .collect();
    assert!(intents.iter().all(|intent| intent == "order"));

    // nothing referenced a Medication by id
    let medication = report.sequence("us_core_medication").unwrap();
    assert_eq!(
        medication.result("us_core_medication_read_test").map(|r| r.outcome),
        Some(TestOutcome::Skip)
    );
    assert!(!report.failed());
}

#[tokio::test]
async fn test_delayed_profile_reads_discovered_references() {
    let metadata = metadata_set(vec![condition_profile(), encounter_profile()]);

    let client = ScriptedClient::new(|request| match request {
        Request::Capabilities => capability_statement(),
        Request::Search { resource_type, .. } if resource_type == "Condition" => {
            bundle(vec![condition()])
        }
        Request::Read { resource_type, id } => read(resource_type, id),
        Request::Vread { resource_type, id, .. } => read(resource_type, id),
        _ => not_found(),
    });
    let report = SuiteRunner::new(&metadata, &client, options()).run().await;

    assert_eq!(
        report
            .sequences
            .iter()
            .map(|s| s.profile.as_str())
            .collect::<Vec<_>>(),
        vec!["us_core_condition", "us_core_encounter"]
    );

    let condition = report.sequence("us_core_condition").unwrap();
    assert!(!condition.failed(), "{:#?}", condition.results);
    assert_eq!(
        condition
            .result("us_core_condition_multiple_or_search_by_clinical_status_test")
            .map(|r| r.outcome),
        Some(TestOutcome::Skip)
    );

    let encounter = report.sequence("us_core_encounter").unwrap();
    let read_test = encounter.result("us_core_encounter_read_test").unwrap();
    assert_eq!(read_test.outcome, TestOutcome::Pass, "{:?}", read_test.message);
    assert!(client.requests().contains(&Request::Read {
        resource_type: "Encounter".to_string(),
        id: "e1".to_string(),
    }));
    assert!(!report.failed());
}

#[tokio::test]
async fn test_delayed_profile_without_references_skips() {
    let metadata = metadata_set(vec![encounter_profile()]);
    let client = ScriptedClient::new(|_| not_found());

    let report = SuiteRunner::new(&metadata, &client, options()).run().await;

    let encounter = report.sequence("us_core_encounter").unwrap();
    assert_eq!(encounter.count(TestOutcome::Skip), encounter.results.len());
    assert!(!report.failed());
}

#[tokio::test]
async fn test_comparator_searches_bound_period_start() {
    let mut resource = condition();
    let object = resource.as_object_mut().unwrap();
    object.remove("onsetDateTime");
    object.insert("onsetPeriod".to_string(), json!({ "start": "2020-03-01" }));

    let client = condition_server(vec![resource]);
    let report = run_conditions(&client, &options()).await;

    let onset = report
        .result("us_core_condition_search_by_patient_onset_date_test")
        .unwrap();
    assert_eq!(onset.outcome, TestOutcome::Pass, "{:?}", onset.message);

    let values = param_values(&client, "onset-date");
    assert!(values.contains(&"gt2020-02-29".to_string()), "{values:?}");
    assert!(values.contains(&"lt2020-03-02".to_string()), "{values:?}");
    assert!(!values.contains(&"gt2020-02-28".to_string()));
    // ge is only MAY
    assert!(!values.iter().any(|v| v.starts_with("ge")));
}

#[tokio::test]
async fn test_coded_searches_repeat_with_system() {
    let client = condition_server(vec![condition()]);
    let report = run_conditions(&client, &options()).await;

    for key in [
        "us_core_condition_search_by_patient_category_test",
        "us_core_condition_search_by_patient_clinical_status_test",
    ] {
        let result = report.result(key).unwrap();
        assert_eq!(result.outcome, TestOutcome::Pass, "{key}: {:?}", result.message);
    }
    assert!(param_values(&client, "category").contains(
        &"http://terminology.hl7.org/CodeSystem/condition-category|problem-list-item".to_string()
    ));
    assert!(param_values(&client, "clinical-status").contains(
        &"http://terminology.hl7.org/CodeSystem/condition-clinical|recurrence".to_string()
    ));
}

#[tokio::test]
async fn test_multiple_or_search_finds_both_values() {
    let client = condition_server(vec![condition(), condition_with_status("c2", "active")]);
    let report = run_conditions(&client, &options()).await;

    let result = report
        .result("us_core_condition_multiple_or_search_by_clinical_status_test")
        .unwrap();
    assert_eq!(result.outcome, TestOutcome::Pass, "{:?}", result.message);
    assert!(param_values(&client, "clinical-status").contains(&"recurrence,active".to_string()));
    assert!(!report.failed(), "{:#?}", report.results);
}

#[tokio::test]
async fn test_reference_resolution_reports_unreadable_references() {
    let client = ScriptedClient::new(|request| match request {
        Request::Search { .. } => bundle(vec![condition()]),
        Request::Read { resource_type, .. } if resource_type == "Encounter" => not_found(),
        Request::Read { resource_type, id } | Request::Vread { resource_type, id, .. } => {
            read(resource_type, id)
        }
        _ => not_found(),
    });
    let report = run_conditions(&client, &options()).await;

    let result = report
        .result("us_core_condition_reference_resolution_test")
        .unwrap();
    assert_eq!(result.outcome, TestOutcome::Fail);
    let message = result.message.as_deref().unwrap_or_default();
    assert!(message.contains("Encounter/e1"), "{message}");
    assert!(!message.contains("Patient/85"), "{message}");
}

#[tokio::test]
async fn test_reference_resolution_reads_at_most_the_limit() {
    let mut resource = condition();
    let details: Vec<Value> = (0..60)
        .map(|i| json!({ "reference": format!("Observation/o{i}") }))
        .collect();
    resource["evidence"] = json!([{ "detail": details }]);

    for (max_references, expected) in [(None, 50), (Some(3), 3)] {
        let client = condition_server(vec![resource.clone()]);
        let options = RunOptions {
            max_references,
            ..options()
        };
        let report = run_conditions(&client, &options).await;

        let result = report
            .result("us_core_condition_reference_resolution_test")
            .unwrap();
        assert_eq!(result.outcome, TestOutcome::Pass, "{:?}", result.message);
        let reads = client
            .requests()
            .iter()
            .filter(|r| {
                matches!(r, Request::Read { resource_type, .. } if resource_type != "Condition")
            })
            .count();
        assert_eq!(reads, expected);
    }
}

#[tokio::test]
async fn test_included_medication_is_validated() {
    let metadata = metadata_set(vec![medication_request_profile(), medication_profile()]);

    let client = ScriptedClient::new(|request| match request {
        Request::Capabilities => capability_statement(),
        Request::Search {
            resource_type,
            params,
            ..
        } if resource_type == "MedicationRequest" => {
            if params.contains_key("_include") {
                bundle(vec![external_medication_request(), medication()])
            } else {
                bundle(vec![external_medication_request()])
            }
        }
        Request::Read { resource_type, id } => read(resource_type, id),
        _ => not_found(),
    });
    let report = SuiteRunner::new(&metadata, &client, options()).run().await;

    let sequence = report.sequence("us_core_medicationrequest").unwrap();
    let outcome = |key: &str| sequence.result(key).map(|r| r.outcome);
    assert_eq!(
        outcome("us_core_medicationrequest_include_test"),
        Some(TestOutcome::Pass)
    );
    assert_eq!(
        outcome("us_core_medicationrequest_medication_validation_test"),
        Some(TestOutcome::Pass)
    );
    assert!(client.requests().iter().any(|r| {
        r.param("_include") == Some("MedicationRequest:medication")
            && r.param("intent") == Some("order")
    }));

    // the Medication reference seeds the delayed Medication sequence
    let medication = report.sequence("us_core_medication").unwrap();
    assert_eq!(
        medication.result("us_core_medication_read_test").map(|r| r.outcome),
        Some(TestOutcome::Pass)
    );
    assert!(!report.failed());
}

#[tokio::test]
async fn test_delayed_profile_revinclude_searches_read_ids() {
    let mut profile = encounter_profile();
    profile.revinclude_params = vec!["Provenance:target".to_string()];
    let metadata = metadata_set(vec![condition_profile(), profile]);

    let client = ScriptedClient::new(|request| match request {
        Request::Capabilities => capability_statement(),
        Request::Search { resource_type, .. } if resource_type == "Condition" => {
            bundle(vec![condition()])
        }
        Request::Search { resource_type, .. } if resource_type == "Encounter" => {
            bundle(vec![encounter(), provenance()])
        }
        Request::Read { resource_type, id } | Request::Vread { resource_type, id, .. } => {
            read(resource_type, id)
        }
        _ => not_found(),
    });
    let report = SuiteRunner::new(&metadata, &client, options()).run().await;

    let encounter = report.sequence("us_core_encounter").unwrap();
    let revinclude = encounter
        .result("us_core_encounter_provenance_revinclude_test")
        .unwrap();
    assert_eq!(revinclude.outcome, TestOutcome::Pass, "{:?}", revinclude.message);
    assert_eq!(
        encounter.discovered.get("Provenance"),
        Some(&vec!["Provenance/prov1".to_string()])
    );

    let search = client
        .requests()
        .into_iter()
        .find(|r| {
            matches!(r, Request::Search { resource_type, .. } if resource_type == "Encounter")
        })
        .unwrap();
    assert_eq!(search.param("_id"), Some("e1"));
    assert_eq!(search.param("_revinclude"), Some("Provenance:target"));
    assert!(!report.failed());
}
