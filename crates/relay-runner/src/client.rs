//! `LlmClient`: the Answer Runner's call out to a language model (spec.md
//! §4.6 step 6). [`HttpLlmClient`] is the default implementation, a thin
//! `reqwest` POST to an operator-configured endpoint.
//!
//! Generalized from this codebase's spawn/call/await-result shape
//! (`abp-host::SidecarClient::run`), retargeted from a subprocess call to an
//! HTTP call — no teacher crate instantiates `reqwest::Client` directly, so
//! this follows the general async-fn/thiserror/tracing idiom rather than a
//! single verbatim call site.

use async_trait::async_trait;
use relay_error::{ErrorCode, RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One LLM call's request payload.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    /// System-turn text.
    pub system: String,
    /// User-turn text.
    pub user: String,
    /// Model identifier to invoke.
    pub model: String,
    /// Token budget, if the Ask constrained one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Optional JSON Schema the response's structured content must satisfy;
    /// forwarded so providers with native schema-guided decoding can use it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
}

/// One LLM call's response.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    /// Raw model output text.
    pub text: String,
    /// Tools, if any, the model reports having used to produce `text`.
    #[serde(default)]
    pub tools_used: Vec<String>,
}

/// A pluggable LLM backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issue one completion call, aborting after `timeout_ms`.
    async fn complete(&self, request: LlmRequest, timeout_ms: u64) -> Result<LlmResponse>;
}

/// Default [`LlmClient`]: POSTs `LlmRequest` as JSON to a configured
/// endpoint and expects `{"text": ..., "toolsUsed": [...]}` back.
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    /// Build a client posting to `endpoint`, optionally bearer-authenticated
    /// with `api_key`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: LlmRequest, timeout_ms: u64) -> Result<LlmResponse> {
        let mut builder = self
            .http
            .post(&self.endpoint)
            .timeout(Duration::from_millis(timeout_ms))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            let code = if e.is_timeout() { ErrorCode::Timeout } else { ErrorCode::ExecutorError };
            RelayError::new(code, "llm call failed").with_source(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::new(
                ErrorCode::ExecutorError,
                format!("llm endpoint returned status {status}"),
            )
            .with_context("body", body));
        }

        response.json::<LlmResponse>().await.map_err(|e| {
            RelayError::new(ErrorCode::BadArtifacts, "llm response did not parse into {text, toolsUsed}").with_source(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_client_parses_successful_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "the answer",
                "toolsUsed": ["fs.read"],
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(format!("{}/complete", server.uri()), None);
        let response = client
            .complete(
                LlmRequest {
                    system: "s".to_string(),
                    user: "u".to_string(),
                    model: "gpt-4".to_string(),
                    max_tokens: None,
                    response_schema: None,
                },
                5_000,
            )
            .await
            .unwrap();
        assert_eq!(response.text, "the answer");
        assert_eq!(response.tools_used, vec!["fs.read".to_string()]);
    }

    #[tokio::test]
    async fn http_client_maps_non_success_status_to_executor_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/complete"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(format!("{}/complete", server.uri()), None);
        let err = client
            .complete(
                LlmRequest {
                    system: "s".to_string(),
                    user: "u".to_string(),
                    model: "gpt-4".to_string(),
                    max_tokens: None,
                    response_schema: None,
                },
                5_000,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ExecutorError);
    }
}
