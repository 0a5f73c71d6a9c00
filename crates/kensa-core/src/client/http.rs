//! `reqwest` implementation of [`FhirClient`]

use super::{FhirClient, FhirResponse, SearchMethod, SearchParams};
use crate::error::KensaError;
use crate::result::Result;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const FHIR_JSON: &str = "application/fhir+json";

/// FHIR client over HTTP
#[derive(Debug, Clone)]
pub struct HttpFhirClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpFhirClient {
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FHIR_JSON));
        if let Some(token) = bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| KensaError::config_error(format!("Invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| KensaError::config_error(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<FhirResponse> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                KensaError::http_error(format!("Response with status {status} is not JSON: {e}"))
            })?
        };
        Ok(FhirResponse { status, body })
    }
}

#[async_trait]
impl FhirClient for HttpFhirClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn search(
        &self,
        resource_type: &str,
        params: &SearchParams,
        method: SearchMethod,
    ) -> Result<FhirResponse> {
        debug!("{:?} search {} {:?}", method, resource_type, params);
        let pairs: Vec<(&str, &str)> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let request = match method {
            SearchMethod::Get => self.client.get(self.url(resource_type)).query(&pairs),
            SearchMethod::Post => self
                .client
                .post(self.url(&format!("{resource_type}/_search")))
                .form(&pairs),
        };
        self.send(request).await
    }

    async fn read(&self, resource_type: &str, id: &str) -> Result<FhirResponse> {
        self.send(self.client.get(self.url(&format!("{resource_type}/{id}"))))
            .await
    }

    async fn vread(&self, resource_type: &str, id: &str, version: &str) -> Result<FhirResponse> {
        let path = format!("{resource_type}/{id}/_history/{version}");
        self.send(self.client.get(self.url(&path))).await
    }

    async fn history(&self, resource_type: &str, id: Option<&str>) -> Result<FhirResponse> {
        let path = match id {
            Some(id) => format!("{resource_type}/{id}/_history"),
            None => format!("{resource_type}/_history"),
        };
        self.send(self.client.get(self.url(&path))).await
    }

    async fn fetch(&self, url: &str) -> Result<FhirResponse> {
        self.send(self.client.get(url)).await
    }

    async fn capabilities(&self) -> Result<FhirResponse> {
        self.send(self.client.get(self.url("metadata"))).await
    }
}
