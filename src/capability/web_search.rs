use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Capability, Credentials};
use crate::error::{CapabilityError, CapabilityErrorKind};

pub const WEB_SEARCH_CAPABILITY: &str = "web_search";
pub const SERPER_API_KEY: &str = "SERPER_API_KEY";
pub const SERPER_SEARCH_ENDPOINT: &str = "https://google.serper.dev/search";
const DEFAULT_RESULTS: u64 = 5;
const MAX_RESULTS: u64 = 10;

/// Google search through the Serper API.
pub struct WebSearchCapability {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl WebSearchCapability {
    pub fn from_credentials(credentials: &Credentials) -> Result<Self, CapabilityError> {
        let api_key = credentials.require(WEB_SEARCH_CAPABILITY, SERPER_API_KEY)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| {
                CapabilityError::invocation(
                    WEB_SEARCH_CAPABILITY,
                    format!("failed to build http client: {err}"),
                )
            })?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            endpoint: SERPER_SEARCH_ENDPOINT.to_string(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

pub fn parse_search_request(request: &Value) -> Result<(String, u64), CapabilityError> {
    let query = request
        .get("query")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if query.is_empty() {
        return Err(CapabilityError::new(
            WEB_SEARCH_CAPABILITY,
            CapabilityErrorKind::InvalidRequest,
            "'query' is required for web_search",
        ));
    }
    let num = request
        .get("num_results")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_RESULTS)
        .clamp(1, MAX_RESULTS);
    Ok((query.to_string(), num))
}

/// Keeps title/link/snippet of each organic hit.
pub fn parse_search_response(body: &Value) -> Result<Value, CapabilityError> {
    let organic = body
        .get("organic")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CapabilityError::new(
                WEB_SEARCH_CAPABILITY,
                CapabilityErrorKind::MalformedResponse,
                "search response has no 'organic' results array",
            )
        })?;
    let results = organic
        .iter()
        .map(|hit| {
            json!({
                "title": hit.get("title").and_then(Value::as_str).unwrap_or_default(),
                "link": hit.get("link").and_then(Value::as_str).unwrap_or_default(),
                "snippet": hit.get("snippet").and_then(Value::as_str).unwrap_or_default(),
            })
        })
        .collect::<Vec<Value>>();
    Ok(json!({ "status": "ok", "results": results }))
}

#[async_trait]
impl Capability for WebSearchCapability {
    fn name(&self) -> &str {
        WEB_SEARCH_CAPABILITY
    }

    fn description(&self) -> &str {
        "Searches the web and returns the top results. Args: query (required), num_results (1-10)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "num_results": { "type": "integer", "minimum": 1, "maximum": MAX_RESULTS }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, request: Value) -> Result<Value, CapabilityError> {
        let (query, num) = parse_search_request(&request)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({ "q": query, "num": num }))
            .send()
            .await
            .map_err(|err| {
                CapabilityError::invocation(WEB_SEARCH_CAPABILITY, format!("request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::invocation(
                WEB_SEARCH_CAPABILITY,
                format!("search provider returned status {}", status.as_u16()),
            ));
        }

        let body = response.json::<Value>().await.map_err(|err| {
            CapabilityError::new(
                WEB_SEARCH_CAPABILITY,
                CapabilityErrorKind::MalformedResponse,
                format!("search response is not JSON: {err}"),
            )
        })?;
        parse_search_response(&body)
    }
}
