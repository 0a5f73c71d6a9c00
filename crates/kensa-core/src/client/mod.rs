//! FHIR server access
//!
//! The harness talks to the server under test only through [`FhirClient`],
//! so tests can substitute a scripted client.

mod http;

pub use http::HttpFhirClient;

use crate::result::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

/// Ordered search parameters, rendered as a query string or form body
pub type SearchParams = IndexMap<String, String>;

/// HTTP method used to issue a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    Get,
    Post,
}

/// Status code and parsed JSON body of one server response
#[derive(Debug, Clone, PartialEq)]
pub struct FhirResponse {
    pub status: u16,
    pub body: Value,
}

impl FhirResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn resource_type(&self) -> Option<&str> {
        self.body.get("resourceType").and_then(Value::as_str)
    }

    pub fn is_bundle(&self) -> bool {
        self.resource_type() == Some("Bundle")
    }

    /// `entry[].resource` of a Bundle body
    pub fn entries(&self) -> Vec<&Value> {
        self.body
            .get("entry")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(|e| e.get("resource")).collect())
            .unwrap_or_default()
    }

    /// Entries whose `resourceType` is `resource_type`
    pub fn entries_of_type(&self, resource_type: &str) -> Vec<&Value> {
        self.entries()
            .into_iter()
            .filter(|r| r.get("resourceType").and_then(Value::as_str) == Some(resource_type))
            .collect()
    }

    /// URL of the `next` page link, if any
    pub fn next_link(&self) -> Option<&str> {
        self.body
            .get("link")
            .and_then(Value::as_array)?
            .iter()
            .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
            .and_then(|link| link.get("url"))
            .and_then(Value::as_str)
    }
}

/// Operations the harness performs against a FHIR server
#[async_trait]
pub trait FhirClient: Send + Sync {
    /// Base URL of the server, without a trailing slash
    fn base_url(&self) -> &str;

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
        method: SearchMethod,
    ) -> Result<FhirResponse>;

    async fn read(&self, resource_type: &str, id: &str) -> Result<FhirResponse>;

    async fn vread(&self, resource_type: &str, id: &str, version: &str) -> Result<FhirResponse>;

    /// Instance history when `id` is given, type history otherwise
    async fn history(&self, resource_type: &str, id: Option<&str>) -> Result<FhirResponse>;

    /// GET an absolute URL (paging links, absolute references)
    async fn fetch(&self, url: &str) -> Result<FhirResponse>;

    /// The server's CapabilityStatement
    async fn capabilities(&self) -> Result<FhirResponse>;
}

/// Resource type and id of a reference, if it has that shape
///
/// Accepts `Type/id`, absolute URLs and versioned references. Contained
/// (`#id`) and `urn:` references yield `None`.
pub fn parse_reference(reference: &str) -> Option<(String, String)> {
    if reference.starts_with('#') || reference.starts_with("urn:") {
        return None;
    }
    let reference = reference.split("/_history/").next().unwrap_or(reference);
    let mut segments = reference.rsplit('/');
    let id = segments.next().filter(|id| !id.is_empty())?;
    let resource_type = segments
        .next()
        .filter(|t| t.starts_with(|c: char| c.is_ascii_uppercase()))?;
    Some((resource_type.to_string(), id.to_string()))
}
