//! Shared fixtures: profile metadata and a scripted in-memory FHIR server

#![allow(dead_code)]

use async_trait::async_trait;
use kensa_core::client::{FhirClient, FhirResponse, SearchMethod, SearchParams};
use kensa_core::metadata::{MetadataSet, ProfileMetadata};
use serde_json::{Value, json};
use std::sync::Mutex;

pub const BASE_URL: &str = "http://fhir.test/r4";

/// One request seen by [`ScriptedClient`]
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Search {
        resource_type: String,
        params: SearchParams,
        method: SearchMethod,
    },
    Read {
        resource_type: String,
        id: String,
    },
    Vread {
        resource_type: String,
        id: String,
        version: String,
    },
    History {
        resource_type: String,
        id: Option<String>,
    },
    Fetch(String),
    Capabilities,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        match self {
            Request::Search { params, .. } => params.get(name).map(String::as_str),
            _ => None,
        }
    }
}

type Handler = Box<dyn Fn(&Request) -> FhirResponse + Send + Sync>;

/// A FHIR client answering every request from a closure
pub struct ScriptedClient {
    handler: Handler,
    log: Mutex<Vec<Request>>,
}

impl ScriptedClient {
    pub fn new(handler: impl Fn(&Request) -> FhirResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.log.lock().unwrap().clone()
    }

    fn answer(&self, request: Request) -> kensa_core::Result<FhirResponse> {
        let response = (self.handler)(&request);
        self.log.lock().unwrap().push(request);
        Ok(response)
    }
}

#[async_trait]
impl FhirClient for ScriptedClient {
    fn base_url(&self) -> &str {
        BASE_URL
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
        method: SearchMethod,
    ) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::Search {
            resource_type: resource_type.to_string(),
            params: params.clone(),
            method,
        })
    }

    async fn read(&self, resource_type: &str, id: &str) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::Read {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        })
    }

    async fn vread(
        &self,
        resource_type: &str,
        id: &str,
        version: &str,
    ) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::Vread {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
            version: version.to_string(),
        })
    }

    async fn history(
        &self,
        resource_type: &str,
        id: Option<&str>,
    ) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::History {
            resource_type: resource_type.to_string(),
            id: id.map(str::to_string),
        })
    }

    async fn fetch(&self, url: &str) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::Fetch(url.to_string()))
    }

    async fn capabilities(&self) -> kensa_core::Result<FhirResponse> {
        self.answer(Request::Capabilities)
    }
}

pub fn bundle(resources: Vec<Value>) -> FhirResponse {
    let entry: Vec<Value> = resources
        .into_iter()
        .map(|resource| json!({ "resource": resource }))
        .collect();
    FhirResponse::new(200, json!({ "resourceType": "Bundle", "type": "searchset", "entry": entry }))
}

pub fn outcome(status: u16) -> FhirResponse {
    FhirResponse::new(
        status,
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{ "severity": "error", "code": "required" }]
        }),
    )
}

pub fn not_found() -> FhirResponse {
    outcome(404)
}

fn url(name: &str) -> String {
    format!("http://hl7.org/fhir/us/core/StructureDefinition/{name}")
}

fn profile(value: Value) -> ProfileMetadata {
    serde_json::from_value(value).unwrap()
}

pub fn patient_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "Patient",
        "profileUrl": url("us-core-patient"),
        "canonicalName": "us_core_patient",
        "title": "US Core Patient Profile",
        "searches": [
            { "names": ["_id"], "expectation": "SHALL" },
            { "names": ["identifier"], "expectation": "SHALL" },
            { "names": ["name"], "expectation": "SHALL" },
            { "names": ["birthdate", "name"], "expectation": "SHALL" },
            { "names": ["gender", "name"], "expectation": "SHOULD" }
        ],
        "searchDefinitions": {
            "_id": { "path": "Patient.id", "type": "token" },
            "identifier": { "path": "Patient.identifier", "type": "Identifier" },
            "name": { "path": "Patient.name", "type": "HumanName" },
            "birthdate": { "path": "Patient.birthDate", "type": "date" },
            "gender": { "path": "Patient.gender", "type": "token" }
        },
        "interactions": [
            { "code": "read", "expectation": "SHALL" },
            { "code": "search-type", "expectation": "SHALL" }
        ],
        "revincludeParams": ["Provenance:target"]
    }))
}

pub fn condition_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "Condition",
        "profileUrl": url("us-core-condition"),
        "canonicalName": "us_core_condition",
        "title": "US Core Condition Profile",
        "searches": [
            { "names": ["patient"], "expectation": "SHALL" },
            { "names": ["patient", "category"], "expectation": "SHOULD" },
            { "names": ["patient", "clinical-status"], "expectation": "SHOULD" },
            { "names": ["patient", "onset-date"], "expectation": "SHOULD" },
            { "names": ["patient", "code"], "expectation": "MAY" }
        ],
        "searchDefinitions": {
            "patient": { "path": "Condition.subject", "type": "Reference" },
            "category": {
                "path": "Condition.category",
                "type": "CodeableConcept",
                "values": ["problem-list-item", "health-concern"]
            },
            "clinical-status": {
                "path": "Condition.clinicalStatus",
                "type": "CodeableConcept",
                "multipleOr": "SHALL",
                "values": ["active", "recurrence", "relapse", "inactive", "remission", "resolved"]
            },
            "onset-date": {
                "path": "Condition.onset[x]",
                "type": "date",
                "comparators": { "gt": "SHALL", "lt": "SHALL", "ge": "MAY" }
            },
            "code": { "path": "Condition.code", "type": "CodeableConcept" }
        },
        "interactions": [
            { "code": "read", "expectation": "SHALL" },
            { "code": "search-type", "expectation": "SHALL" },
            { "code": "vread", "expectation": "SHOULD" },
            { "code": "create", "expectation": "MAY" },
            { "code": "update", "expectation": "MAY" }
        ],
        "mustSupport": {
            "elements": [
                { "path": "Condition.clinicalStatus" },
                { "path": "Condition.subject" }
            ]
        },
        "references": [
            { "path": "Condition.subject", "profiles": [url("us-core-patient")] },
            { "path": "Condition.encounter", "profiles": [url("us-core-encounter")] }
        ]
    }))
}

pub fn encounter_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "Encounter",
        "profileUrl": url("us-core-encounter"),
        "canonicalName": "us_core_encounter",
        "searches": [
            { "names": ["_id"], "expectation": "SHALL" },
            { "names": ["patient"], "expectation": "SHALL" }
        ],
        "searchDefinitions": {
            "_id": { "path": "Encounter.id", "type": "token" },
            "patient": { "path": "Encounter.subject", "type": "Reference" }
        },
        "interactions": [{ "code": "read", "expectation": "SHALL" }]
    }))
}

pub fn observation_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "Observation",
        "profileUrl": url("us-core-observation-lab"),
        "canonicalName": "us_core_observation_lab",
        "searches": [
            { "names": ["patient", "category"], "expectation": "SHALL" },
            { "names": ["patient", "category", "date"], "expectation": "SHALL" },
            { "names": ["patient", "code"], "expectation": "SHALL" }
        ],
        "searchDefinitions": {
            "patient": { "path": "Observation.subject", "type": "Reference" },
            "category": {
                "path": "Observation.category",
                "type": "CodeableConcept",
                "values": ["laboratory"]
            },
            "date": {
                "path": "Observation.effective[x]",
                "type": "date",
                "comparators": { "gt": "SHALL", "lt": "SHALL", "eq": "MAY" }
            },
            "code": { "path": "Observation.code", "type": "CodeableConcept" }
        }
    }))
}

pub fn medication_request_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "MedicationRequest",
        "profileUrl": url("us-core-medicationrequest"),
        "canonicalName": "us_core_medicationrequest",
        "searches": [{ "names": ["patient", "intent"], "expectation": "SHALL" }],
        "searchDefinitions": {
            "patient": { "path": "MedicationRequest.subject", "type": "Reference" },
            "intent": {
                "path": "MedicationRequest.intent",
                "type": "token",
                "values": ["order", "plan"]
            }
        },
        "mustSupport": {
            "elements": [{ "path": "MedicationRequest.medication[x]" }]
        },
        "references": [
            { "path": "MedicationRequest.medication[x]", "profiles": [url("us-core-medication")] }
        ],
        "includeParams": ["MedicationRequest:medication"]
    }))
}

pub fn medication_profile() -> ProfileMetadata {
    profile(json!({
        "resourceType": "Medication",
        "profileUrl": url("us-core-medication"),
        "canonicalName": "us_core_medication",
        "title": "US Core Medication Profile",
        "interactions": [{ "code": "read", "expectation": "SHALL" }],
        "bindings": [{
            "type": "CodeableConcept",
            "strength": "extensible",
            "system": "http://cts.nlm.nih.gov/fhir/ValueSet/2.16.840.1.113762.1.4.1010.4",
            "path": "Medication.code"
        }]
    }))
}

pub fn metadata_set(profiles: Vec<ProfileMetadata>) -> MetadataSet {
    MetadataSet::new(profiles)
}

pub fn capability_statement() -> FhirResponse {
    FhirResponse::new(
        200,
        json!({
            "resourceType": "CapabilityStatement",
            "rest": [{ "mode": "server", "resource": [
                { "type": "Condition", "interaction": [{ "code": "search-type" }] }
            ] }]
        }),
    )
}
