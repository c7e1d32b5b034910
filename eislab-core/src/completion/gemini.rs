//! Google Gemini REST transport.
//!
//! Talks to the `generateContent` endpoint:
//! - Auth via `?key=API_KEY` query parameter (not header-based)
//! - System instructions are a top-level `systemInstruction` field
//! - Roles are `"user"` / `"model"`
//! - A structured contract sets `responseMimeType: application/json` plus a
//!   `responseSchema`; free text uses `text/plain`

use super::{CompletionRequest, CompletionTransport};
use crate::config::LlmConfig;
use crate::error::{CompletionError, TransportError};
use crate::types::{ResponseContract, TurnRole};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Longest error body excerpt carried into an error message.
const MAX_ERROR_EXCERPT: usize = 300;

pub struct GeminiTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    temperature: f32,
}

impl GeminiTransport {
    /// Create a transport from configuration.
    ///
    /// A missing credential does not fail construction; it is reported by
    /// [`readiness`](CompletionTransport::readiness) so that calls
    /// short-circuit with `NotConfigured`.
    pub fn new(config: &LlmConfig) -> Result<Self, CompletionError> {
        Self::new_with_key(config, config.resolve_api_key())
    }

    /// Create a transport with an explicitly resolved API key.
    pub fn new_with_key(
        config: &LlmConfig,
        api_key: Option<String>,
    ) -> Result<Self, CompletionError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| CompletionError::NotConfigured {
                reason: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            api_key_env: config.api_key_env.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint_url(&self, api_key: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model, api_key
        )
    }

    /// Build the JSON request body for the Gemini API.
    fn build_request_body(&self, request: &CompletionRequest) -> Value {
        let contents: Vec<Value> = request
            .turns
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    TurnRole::Requester => "user",
                    TurnRole::Responder => "model",
                };
                json!({ "role": role, "parts": [{ "text": turn.text }] })
            })
            .collect();

        let generation_config = match &request.contract {
            ResponseContract::Structured(schema) => json!({
                "temperature": self.temperature,
                "responseMimeType": "application/json",
                "responseSchema": schema,
            }),
            ResponseContract::FreeText => json!({
                "temperature": self.temperature,
                "responseMimeType": "text/plain",
            }),
        };

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if !request.instructions.trim().is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": request.instructions }] });
        }
        body
    }

    /// Extract the text payload from `candidates[0].content.parts`.
    fn parse_response(body: &Value) -> Result<String, TransportError> {
        let candidates = body["candidates"].as_array();
        let Some(candidate) = candidates.and_then(|c| c.first()) else {
            let reason = body["promptFeedback"]["blockReason"]
                .as_str()
                .map(|r| format!("prompt blocked: {}", r))
                .unwrap_or_else(|| "missing 'candidates' in response".to_string());
            return Err(TransportError::Malformed { message: reason });
        };

        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| TransportError::Malformed {
                message: "missing 'parts' array in candidate content".to_string(),
            })?;

        Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .concat())
    }

    /// Map a non-success HTTP status to a transport error, preferring the
    /// service's own `error.message` over the raw body.
    fn map_http_error(status: u16, body_text: &str) -> TransportError {
        let message = serde_json::from_str::<Value>(body_text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| body_text.chars().take(MAX_ERROR_EXCERPT).collect());
        TransportError::Status { status, message }
    }
}

#[async_trait]
impl CompletionTransport for GeminiTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    fn readiness(&self) -> Result<(), String> {
        match self.api_key {
            Some(_) => Ok(()),
            None => Err(format!("env var '{}' not set", self.api_key_env)),
        }
    }

    async fn send(&self, request: &CompletionRequest) -> Result<String, TransportError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| TransportError::Status {
            status: 401,
            message: format!("no API key (env var '{}' not set)", self.api_key_env),
        })?;
        let body = self.build_request_body(request);

        debug!(
            model = self.model.as_str(),
            turns = request.turns.len(),
            structured = request.contract.is_structured(),
            "Sending Gemini generateContent request"
        );

        let response = self
            .client
            .post(self.endpoint_url(api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network {
                message: format!("Request to Gemini API failed: {}", e.without_url()),
            })?;

        let status = response.status();
        let body_text = response.text().await.map_err(|e| TransportError::Network {
            message: format!("Failed to read response body: {}", e.without_url()),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status.as_u16(), &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| TransportError::Malformed {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }
}
