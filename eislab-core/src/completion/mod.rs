//! Completion client: sends a conversation to the remote completion service
//! under a bounded retry policy and decodes the answer per response contract.
//!
//! The service itself sits behind [`CompletionTransport`]; the client owns
//! everything that does not depend on the wire format:
//!
//! - contract selection (structured only for the opening exchange)
//! - configuration short-circuit before any network traffic
//! - retry with exponential backoff on transient failures
//! - payload decoding into text or a [`StructuredReport`]

pub mod gemini;
pub mod mock;

pub use gemini::GeminiTransport;
pub use mock::ScriptedTransport;

use crate::config::RetryConfig;
use crate::error::{CompletionError, TransportError};
use crate::types::{ResponseContract, StructuredReport, Turn, TurnContent, TurnRole};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One turn as sent on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct WireTurn {
    pub role: TurnRole,
    pub text: String,
}

/// A fully prepared request: turns in conversation order, the system-level
/// instructions, and the contract that applies to this call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub turns: Vec<WireTurn>,
    pub instructions: String,
    pub contract: ResponseContract,
}

impl CompletionRequest {
    /// Build the request for `turns`, applying the turn-count contract rule.
    pub fn new(turns: &[Turn], instructions: &str, contract: ResponseContract) -> Self {
        Self {
            turns: turns
                .iter()
                .map(|t| WireTurn {
                    role: t.role,
                    text: t.content.to_wire_text(),
                })
                .collect(),
            instructions: instructions.to_string(),
            contract: contract.effective_for(turns.len()),
        }
    }
}

/// The seam to a remote completion service.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// Short service name for logs.
    fn name(&self) -> &str;

    /// `Err(reason)` when the transport cannot make calls (e.g. no credential).
    fn readiness(&self) -> Result<(), String>;

    /// Perform one exchange and return the raw text payload.
    async fn send(&self, request: &CompletionRequest) -> Result<String, TransportError>;
}

/// Retrying, contract-aware client over a [`CompletionTransport`].
pub struct CompletionClient {
    transport: Arc<dyn CompletionTransport>,
    retry: RetryConfig,
}

impl CompletionClient {
    pub fn new(transport: Arc<dyn CompletionTransport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Send `turns` and decode the answer.
    ///
    /// A structured contract is downgraded to free text once the conversation
    /// is past its opening turn.
    pub async fn complete(
        &self,
        turns: &[Turn],
        instructions: &str,
        contract: ResponseContract,
    ) -> Result<TurnContent, CompletionError> {
        if let Err(reason) = self.transport.readiness() {
            return Err(CompletionError::NotConfigured { reason });
        }

        let request = CompletionRequest::new(turns, instructions, contract);
        debug!(
            service = self.transport.name(),
            turns = request.turns.len(),
            structured = request.contract.is_structured(),
            "Sending completion request"
        );

        let payload = self.send_with_retry(&request).await?;
        let content = decode_payload(&payload, &request.contract)?;
        info!(
            service = self.transport.name(),
            structured = matches!(content, TurnContent::Report(_)),
            chars = payload.len(),
            "Completion received"
        );
        Ok(content)
    }

    async fn send_with_retry(
        &self,
        request: &CompletionRequest,
    ) -> Result<String, CompletionError> {
        let attempts = self.retry.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let e = match self.transport.send(request).await {
                Ok(payload) => return Ok(payload),
                Err(e) => e,
            };
            if !e.is_transient() {
                return Err(permanent_failure(e));
            }
            if attempt < attempts {
                let wait = self.retry.backoff_for(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Retrying completion after transient error"
                );
                tokio::time::sleep(wait).await;
            }
            last_error = e.to_string();
        }

        Err(CompletionError::Unavailable {
            attempts,
            last_error,
        })
    }
}

fn permanent_failure(error: TransportError) -> CompletionError {
    match error {
        TransportError::Status { status, message } => {
            CompletionError::Rejected { status, message }
        }
        TransportError::Malformed { message } => CompletionError::Unparseable { message },
        TransportError::Network { message } => CompletionError::Unavailable {
            attempts: 1,
            last_error: message,
        },
    }
}

/// Decode a raw payload according to `contract`.
pub fn decode_payload(
    payload: &str,
    contract: &ResponseContract,
) -> Result<TurnContent, CompletionError> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return Err(CompletionError::Unparseable {
            message: "empty response payload".to_string(),
        });
    }

    match contract {
        ResponseContract::FreeText => Ok(TurnContent::Text(trimmed.to_string())),
        ResponseContract::Structured(_) => {
            serde_json::from_str::<StructuredReport>(strip_code_fence(trimmed))
                .map(TurnContent::Report)
                .map_err(|e| CompletionError::Unparseable {
                    message: format!("response does not match the report schema: {}", e),
                })
        }
    }
}

/// Some models wrap JSON output in a Markdown fence despite a JSON mime type.
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn schema() -> ResponseContract {
        ResponseContract::Structured(json!({"type": "OBJECT"}))
    }

    fn report_json() -> String {
        json!({
            "report_title": "Sweep Analysis",
            "summary": "Capacitive behaviour dominates.",
            "metrics": [{"name": "LF magnitude", "value": "1.2 kΩ", "insight": "High"}]
        })
        .to_string()
    }

    fn client(transport: &Arc<ScriptedTransport>) -> CompletionClient {
        CompletionClient::new(transport.clone(), RetryConfig::default())
    }

    fn server_error() -> TransportError {
        TransportError::Status {
            status: 503,
            message: "overloaded".into(),
        }
    }

    #[tokio::test]
    async fn test_structured_first_turn() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_text(report_json());

        let result = client(&transport)
            .complete(&[Turn::requester("data")], "instructions", schema())
            .await
            .unwrap();
        let report = result.as_report().unwrap();
        assert_eq!(report.title, "Sweep Analysis");
        assert_eq!(report.metrics.len(), 1);

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contract.is_structured());
        assert_eq!(sent[0].instructions, "instructions");
    }

    #[tokio::test]
    async fn test_contract_downgraded_after_first_exchange() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_text("Plain answer");

        let report: StructuredReport = serde_json::from_str(&report_json()).unwrap();
        let turns = vec![
            Turn::requester("data"),
            Turn::responder(TurnContent::Report(report.clone())),
            Turn::requester("why?"),
        ];
        let result = client(&transport)
            .complete(&turns, "follow up", schema())
            .await
            .unwrap();
        assert_eq!(result.as_text(), Some("Plain answer"));

        let sent = &transport.requests()[0];
        assert_eq!(sent.contract, ResponseContract::FreeText);
        assert_eq!(sent.turns[1].role, TurnRole::Responder);
        assert_eq!(sent.turns[1].text, report.to_canonical_string());
    }

    #[tokio::test]
    async fn test_not_configured_makes_no_call() {
        let transport = Arc::new(ScriptedTransport::unconfigured(
            "env var 'GEMINI_API_KEY' not set",
        ));
        transport.queue_text("never used");

        let err = client(&transport)
            .complete(&[Turn::requester("x")], "", schema())
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::NotConfigured { .. }));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_three_times_with_doubling_backoff() {
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.queue_error(server_error());
        }

        let started = tokio::time::Instant::now();
        let err = client(&transport)
            .complete(&[Turn::requester("x")], "", ResponseContract::FreeText)
            .await
            .unwrap_err();

        assert_eq!(transport.call_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        match err {
            CompletionError::Unavailable {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_error(TransportError::Network {
            message: "connection reset".into(),
        });
        transport.queue_text("ok");

        let started = tokio::time::Instant::now();
        let result = client(&transport)
            .complete(&[Turn::requester("x")], "", ResponseContract::FreeText)
            .await
            .unwrap();
        assert_eq!(result.as_text(), Some("ok"));
        assert_eq!(transport.call_count(), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_not_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_error(TransportError::Status {
            status: 400,
            message: "Invalid schema".into(),
        });
        transport.queue_text("never used");

        let started = tokio::time::Instant::now();
        let err = client(&transport)
            .complete(&[Turn::requester("x")], "", schema())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CompletionError::Rejected {
                status: 400,
                message: "Invalid schema".into()
            }
        );
        assert_eq!(transport.call_count(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_structured_decode_failure_is_unparseable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_text("Sure! Here is the analysis: it looks fine.");

        let err = client(&transport)
            .complete(&[Turn::requester("x")], "", schema())
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Unparseable { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_payload_is_unparseable() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_text("   ");

        let err = client(&transport)
            .complete(&[Turn::requester("x")], "", ResponseContract::FreeText)
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Unparseable { .. }));
    }

    #[test]
    fn test_decode_strips_json_fence() {
        let fenced = format!("```json\n{}\n```", report_json());
        let content = decode_payload(&fenced, &schema()).unwrap();
        assert!(content.as_report().is_some());
    }
}
