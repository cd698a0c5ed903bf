use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::backend::{BackendReply, CompletionRequest, LlmBackend, ToolCall};
use crate::error::BackendError;

const BASE_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    pub label: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub request_timeout: Duration,
    pub max_retries: usize,
}

/// Chat-completions client shared by OpenAI, DeepSeek, Groq and Ollama.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: OpenAiCompatibleConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let bearer = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .map_err(|e| BackendError::Auth(format!("invalid API key header: {e}")))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Transport(format!("failed to build http client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }
        format!("{base}/chat/completions")
    }

    async fn post_with_retries(&self, body: &Value) -> Result<Value, BackendError> {
        let url = self.chat_completions_url();
        let mut attempt = 0usize;
        loop {
            let err = match self.client.post(&url).json(body).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let text = response.text().await.map_err(|e| {
                        BackendError::Transport(format!("failed to read response body: {e}"))
                    })?;
                    if (200..300).contains(&status) {
                        return serde_json::from_str::<Value>(&text).map_err(|e| {
                            BackendError::MalformedResponse(format!("response is not JSON: {e}"))
                        });
                    }
                    map_status_error(status, &text)
                }
                Err(err) if err.is_timeout() => BackendError::Timeout {
                    secs: self.config.request_timeout.as_secs(),
                },
                Err(err) => BackendError::Transport(err.to_string()),
            };

            if attempt >= self.config.max_retries || !is_retryable(&err) {
                return Err(err);
            }
            let delay = next_backoff_ms(attempt);
            tracing::debug!(
                backend = self.config.label.as_str(),
                attempt = attempt + 1,
                delay_ms = delay,
                error = %err,
                "retrying chat completion"
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }
}

pub fn next_backoff_ms(attempt: usize) -> u64 {
    BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(5))
}

fn is_retryable(err: &BackendError) -> bool {
    match err {
        BackendError::RateLimit(_) | BackendError::Transport(_) => true,
        BackendError::Timeout { .. } | BackendError::Auth(_) | BackendError::MalformedResponse(_) => {
            false
        }
    }
}

pub fn map_status_error(status: u16, body: &str) -> BackendError {
    let detail = extract_error_message(body).unwrap_or_else(|| truncate(body, 200));
    match status {
        401 | 403 => BackendError::Auth(format!("status {status}: {detail}")),
        408 => BackendError::Timeout { secs: 0 },
        429 => BackendError::RateLimit(format!("status {status}: {detail}")),
        _ => BackendError::Transport(format!("status {status}: {detail}")),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = text.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Builds the chat-completions body, replaying earlier tool rounds as
/// assistant/tool message pairs.
pub fn build_chat_body(model: &str, request: &CompletionRequest) -> Value {
    let mut messages = vec![
        json!({ "role": "system", "content": request.system_prompt() }),
        json!({ "role": "user", "content": request.user_prompt() }),
    ];

    for round in &request.tool_rounds {
        let calls = round
            .iter()
            .map(|exchange| {
                json!({
                    "id": exchange.call.id,
                    "type": "function",
                    "function": {
                        "name": exchange.call.name,
                        "arguments": exchange.call.arguments.to_string(),
                    }
                })
            })
            .collect::<Vec<Value>>();
        messages.push(json!({ "role": "assistant", "content": Value::Null, "tool_calls": calls }));
        for exchange in round {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": exchange.call.id,
                "content": exchange.output.to_string(),
            }));
        }
    }

    let mut body = json!({ "model": model, "messages": messages });
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(
            request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    body
}

pub fn parse_chat_reply(body: &Value) -> Result<BackendReply, BackendError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| BackendError::MalformedResponse("missing choices[0].message".to_string()))?;

    if let Some(raw_calls) = message.get("tool_calls").and_then(Value::as_array)
        && !raw_calls.is_empty()
    {
        let calls = raw_calls
            .iter()
            .map(parse_tool_call)
            .collect::<Result<Vec<ToolCall>, BackendError>>()?;
        return Ok(BackendReply::ToolCalls(calls));
    }

    message
        .get("content")
        .and_then(Value::as_str)
        .map(|text| BackendReply::Text(text.to_string()))
        .ok_or_else(|| {
            BackendError::MalformedResponse("message has neither content nor tool calls".to_string())
        })
}

fn parse_tool_call(raw: &Value) -> Result<ToolCall, BackendError> {
    let malformed = |what: &str| BackendError::MalformedResponse(format!("tool call is missing {what}"));
    let id = raw.get("id").and_then(Value::as_str).ok_or_else(|| malformed("id"))?;
    let function = raw.get("function").ok_or_else(|| malformed("function"))?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("function.name"))?;
    let arguments = match function.get("arguments") {
        Some(Value::String(text)) if text.trim().is_empty() => json!({}),
        Some(Value::String(text)) => serde_json::from_str::<Value>(text).map_err(|e| {
            BackendError::MalformedResponse(format!("tool call '{name}' has invalid arguments: {e}"))
        })?,
        Some(other) => other.clone(),
        None => json!({}),
    };
    Ok(ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    })
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.config.label
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply, BackendError> {
        let body = build_chat_body(&self.config.model, request);
        let response = self.post_with_retries(&body).await?;
        parse_chat_reply(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ToolExchange, ToolSpec};

    #[test]
    fn status_codes_map_to_backend_error_kinds() {
        assert!(matches!(map_status_error(401, "{}"), BackendError::Auth(_)));
        assert!(matches!(map_status_error(403, ""), BackendError::Auth(_)));
        assert!(matches!(
            map_status_error(429, r#"{"error":{"message":"slow down"}}"#),
            BackendError::RateLimit(msg) if msg.contains("slow down")
        ));
        assert!(matches!(map_status_error(502, "bad gateway"), BackendError::Transport(_)));
    }

    #[test]
    fn parses_text_and_tool_call_replies() {
        let text = json!({ "choices": [{ "message": { "role": "assistant", "content": "Plan ready" } }] });
        assert_eq!(
            parse_chat_reply(&text).unwrap(),
            BackendReply::Text("Plan ready".to_string())
        );

        let calls = json!({ "choices": [{ "message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": "call_1",
                "type": "function",
                "function": { "name": "web_search", "arguments": "{\"query\":\"gen z snacks\"}" }
            }]
        } }] });
        let BackendReply::ToolCalls(parsed) = parse_chat_reply(&calls).unwrap() else {
            panic!("expected tool calls");
        };
        assert_eq!(parsed[0].name, "web_search");
        assert_eq!(parsed[0].arguments["query"], "gen z snacks");
    }

    #[test]
    fn malformed_bodies_are_reported() {
        assert!(matches!(
            parse_chat_reply(&json!({ "id": "x" })),
            Err(BackendError::MalformedResponse(_))
        ));
        let bad_args = json!({ "choices": [{ "message": { "tool_calls": [{
            "id": "c", "function": { "name": "file_read", "arguments": "{not json" }
        }] } }] });
        assert!(matches!(
            parse_chat_reply(&bad_args),
            Err(BackendError::MalformedResponse(_))
        ));
    }

    #[test]
    fn chat_body_replays_tool_rounds() {
        let mut request = CompletionRequest::new("Market Researcher", "goal", "Generate Marketing Plan: shoes");
        request.tools.push(ToolSpec {
            name: "web_search".to_string(),
            description: "search".to_string(),
            parameters: json!({ "type": "object" }),
        });
        request.tool_rounds.push(vec![ToolExchange {
            call: ToolCall {
                id: "call_1".to_string(),
                name: "web_search".to_string(),
                arguments: json!({ "query": "shoes" }),
            },
            output: json!({ "status": "ok", "results": [] }),
        }]);

        let body = build_chat_body("gpt-4o-mini", &request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "web_search");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(body["tools"][0]["function"]["name"], "web_search");
    }

    #[test]
    fn completions_url_appends_path_once() {
        let backend = OpenAiCompatibleBackend::new(OpenAiCompatibleConfig {
            label: "openai".to_string(),
            api_base: "http://localhost:11434/v1/".to_string(),
            api_key: None,
            model: "llama3".to_string(),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
        })
        .unwrap();
        assert_eq!(
            backend.chat_completions_url(),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
