//! Status-retry heuristic
//!
//! Some servers reject searches on status-bearing resources (Condition,
//! AllergyIntolerance, ...) unless a status is given, answering HTTP 400.
//! [`StatusRetry`] re-issues such a search with each declared status value
//! until one produces results, and records the winning status in the
//! caller's parameters so later searches reuse it.

use crate::client::{FhirClient, FhirResponse, SearchMethod, SearchParams};
use crate::metadata::ProfileMetadata;
use crate::result::Result;
use serde_json::Value;
use tracing::{debug, warn};

/// What happened to a search response passed through [`StatusRetry::recover`]
#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Not a 400; returned untouched
    Unchanged(FhirResponse),
    /// A status value produced results; `params` now carries it
    Recovered {
        response: FhirResponse,
        status: String,
        warnings: Vec<String>,
    },
    /// No status value produced results; the original 400 response
    Exhausted {
        original: FhirResponse,
        warnings: Vec<String>,
    },
    /// The 400 body was not an OperationOutcome
    InvalidOutcome(String),
}

/// Retry plan for one search of one profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRetry {
    param: String,
    values: Vec<String>,
    merged: bool,
}

impl StatusRetry {
    /// A retry plan when the profile has a status parameter the search lacks
    pub fn for_search(profile: &ProfileMetadata, names: &[String]) -> Option<Self> {
        if names.iter().any(|name| name.contains("status")) {
            return None;
        }
        let param = profile.status_param()?;
        let definition = profile.search_definition(param)?;
        if definition.values.is_empty() {
            return None;
        }
        Some(Self {
            param: param.to_string(),
            values: definition.values.clone(),
            merged: definition.requires_multiple_or(),
        })
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    /// Status values to try, in order
    ///
    /// A single comma-joined value when the server must support multiple-or
    /// on the status parameter, otherwise one attempt per value.
    pub fn attempts(&self) -> Vec<String> {
        if self.merged {
            vec![self.values.join(",")]
        } else {
            self.values.clone()
        }
    }

    /// Recover from a 400 by retrying with status values
    ///
    /// Transport errors propagate; failed or empty retries move on to the
    /// next status value.
    pub async fn recover(
        &self,
        client: &dyn FhirClient,
        resource_type: &str,
        params: &mut SearchParams,
        response: FhirResponse,
        capabilities: Option<&Value>,
    ) -> Result<Recovery> {
        if response.status != 400 {
            return Ok(Recovery::Unchanged(response));
        }
        if response.resource_type() != Some("OperationOutcome") {
            return Ok(Recovery::InvalidOutcome(
                "Server returned a status of 400 without an OperationOutcome".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        if !search_documented(capabilities, resource_type) {
            let message = format!(
                "Server returned a status of 400 with an OperationOutcome, but the search \
                 interaction for {resource_type} is not documented in the CapabilityStatement. \
                 If this response was due to the server requiring a status parameter, the server \
                 must document this requirement in its CapabilityStatement."
            );
            warn!("{}", message);
            warnings.push(message);
        }

        for status in self.attempts() {
            let mut retry_params = params.clone();
            retry_params.insert(self.param.clone(), status.clone());
            debug!("Retrying {} search with {}={}", resource_type, self.param, status);

            let retry = client
                .search(resource_type, &retry_params, SearchMethod::Get)
                .await?;
            if !retry.is_success() || retry.entries_of_type(resource_type).is_empty() {
                continue;
            }

            params.insert(self.param.clone(), status.clone());
            return Ok(Recovery::Recovered {
                response: retry,
                status,
                warnings,
            });
        }

        Ok(Recovery::Exhausted {
            original: response,
            warnings,
        })
    }
}

/// Whether the CapabilityStatement documents searching `resource_type`
fn search_documented(capabilities: Option<&Value>, resource_type: &str) -> bool {
    let Some(capabilities) = capabilities else {
        return false;
    };
    capabilities
        .get("rest")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|rest| rest.get("resource").and_then(Value::as_array).into_iter().flatten())
        .filter(|resource| resource.get("type").and_then(Value::as_str) == Some(resource_type))
        .any(|resource| {
            let has_params = resource
                .get("searchParam")
                .and_then(Value::as_array)
                .is_some_and(|params| !params.is_empty());
            let has_search = resource
                .get("interaction")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .any(|i| i.get("code").and_then(Value::as_str) == Some("search-type"));
            has_params || has_search
        })
}
