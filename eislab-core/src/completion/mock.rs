//! Scripted completion transport for tests and offline demos.

use super::{CompletionRequest, CompletionTransport};
use crate::error::TransportError;
use crate::types::StructuredReport;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

/// A transport that replays queued results in order and records every
/// request it receives.
///
/// When the queue runs dry, `send` fails with a transient network error.
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<String, TransportError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    not_configured: Option<String>,
    gate: Option<Arc<Semaphore>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            not_configured: None,
            gate: None,
        }
    }

    /// A transport that reports itself as unconfigured.
    pub fn unconfigured(reason: impl Into<String>) -> Self {
        Self {
            not_configured: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Hold every `send` until a permit is available on `gate`.
    ///
    /// Each call consumes one permit, so tests can release in-flight requests
    /// one at a time with `gate.add_permits(1)`.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn queue(&self, result: Result<String, TransportError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    pub fn queue_text(&self, text: impl Into<String>) {
        self.queue(Ok(text.into()));
    }

    pub fn queue_report(&self, report: &StructuredReport) {
        self.queue(Ok(report.to_canonical_string()));
    }

    pub fn queue_error(&self, error: TransportError) {
        self.queue(Err(error));
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn readiness(&self) -> Result<(), String> {
        match &self.not_configured {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn send(&self, request: &CompletionRequest) -> Result<String, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| TransportError::Network {
                message: "scripted gate closed".to_string(),
            })?;
            permit.forget();
        }

        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError::Network {
                    message: "no scripted response left".to_string(),
                })
            })
    }
}
