//! Conversation manager: the turn sequence and state machine of one analysis.
//!
//! ```text
//! Idle ──start──▶ Requesting ──▶ Answered ──follow-up──▶ Requesting
//!                      │
//!                      └────────▶ Failed
//! any ──close──▶ Closed (terminal, turns discarded)
//! ```
//!
//! State sits behind a `tokio::sync::Mutex` that is released before every
//! await on the completion service. Each request captures the current epoch;
//! [`close`](ConversationManager::close) bumps it, so a response that lands
//! afterwards is dropped and the caller gets [`AnalysisError::Superseded`].
//! A request future dropped before it finishes moves the phase to `Failed`.

use crate::completion::CompletionClient;
use crate::error::{AnalysisError, CompletionError};
use crate::history::ContextRetriever;
use crate::prompts;
use crate::types::{
    AnalysisTopic, Dataset, ResponseContract, StructuredReport, Turn, TurnContent, TurnRole,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle phase of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisPhase {
    Idle,
    Requesting,
    Answered,
    Failed,
    Closed,
}

impl std::fmt::Display for AnalysisPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AnalysisPhase::Idle => "idle",
            AnalysisPhase::Requesting => "requesting",
            AnalysisPhase::Answered => "answered",
            AnalysisPhase::Failed => "failed",
            AnalysisPhase::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug)]
struct ConversationState {
    phase: AnalysisPhase,
    turns: Vec<Turn>,
    epoch: u64,
    subject: Option<String>,
    last_error: Option<AnalysisError>,
}

impl ConversationState {
    /// Guard shared by both request kinds.
    fn ensure_can_request(&self) -> Result<(), AnalysisError> {
        match self.phase {
            AnalysisPhase::Closed => Err(AnalysisError::Closed),
            AnalysisPhase::Requesting => Err(AnalysisError::Busy),
            _ => Ok(()),
        }
    }
}

/// Leaves `Requesting` if the request future is dropped before it settles.
struct InFlight {
    state: Arc<Mutex<ConversationState>>,
    epoch: u64,
    clear_turns: bool,
    armed: bool,
}

impl InFlight {
    fn new(state: &Arc<Mutex<ConversationState>>, epoch: u64, clear_turns: bool) -> Self {
        Self {
            state: Arc::clone(state),
            epoch,
            clear_turns,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn abandon(state: &mut ConversationState, epoch: u64, clear_turns: bool) {
        if state.epoch != epoch || state.phase != AnalysisPhase::Requesting {
            return;
        }
        if clear_turns {
            state.turns.clear();
        }
        state.phase = AnalysisPhase::Failed;
        state.last_error = Some(AnalysisError::Cancelled);
        debug!("In-flight request dropped");
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (epoch, clear_turns) = (self.epoch, self.clear_turns);
        if let Ok(mut state) = self.state.try_lock() {
            Self::abandon(&mut state, epoch, clear_turns);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            handle.spawn(async move {
                Self::abandon(&mut *state.lock().await, epoch, clear_turns);
            });
        }
    }
}

/// Owns the ordered turns of one analysis session.
pub struct ConversationManager {
    client: Arc<CompletionClient>,
    retriever: ContextRetriever,
    state: Arc<Mutex<ConversationState>>,
}

impl ConversationManager {
    pub fn new(client: Arc<CompletionClient>, retriever: ContextRetriever) -> Self {
        Self {
            client,
            retriever,
            state: Arc::new(Mutex::new(ConversationState {
                phase: AnalysisPhase::Idle,
                turns: Vec::new(),
                epoch: 0,
                subject: None,
                last_error: None,
            })),
        }
    }

    /// Start a fresh analysis of `dataset`, discarding any previous turns.
    ///
    /// On success the conversation holds exactly two turns. On failure it is
    /// emptied and left in `Failed`.
    pub async fn start_analysis(
        &self,
        dataset: &Dataset,
        subject: &str,
        topic: AnalysisTopic,
    ) -> Result<StructuredReport, AnalysisError> {
        let epoch = {
            let mut state = self.state.lock().await;
            state.ensure_can_request()?;
            if dataset.is_empty() {
                return Err(AnalysisError::NoData);
            }
            if !topic.supports(dataset.kind) {
                return Err(AnalysisError::UnsupportedTopic {
                    topic,
                    kind: dataset.kind,
                });
            }
            state.phase = AnalysisPhase::Requesting;
            state.turns.clear();
            state.last_error = None;
            state.subject = Some(subject.trim().to_string()).filter(|s| !s.is_empty());
            state.epoch
        };
        let mut in_flight = InFlight::new(&self.state, epoch, true);

        let digest = self.retriever.fetch_digest(subject).await;
        let instructions =
            prompts::analysis_instructions(topic, dataset.kind, !digest.is_empty());
        let opening = Turn::requester(prompts::first_turn_text(
            &digest,
            &prompts::summarize_dataset(dataset),
        ));
        let schema = prompts::report_schema(topic, dataset.kind);

        {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return Err(AnalysisError::Superseded);
            }
            state.turns.push(opening.clone());
        }

        debug!(
            subject,
            topic = %topic,
            kind = %dataset.kind,
            points = dataset.len(),
            with_history = !digest.is_empty(),
            "Starting analysis"
        );
        let result = self
            .client
            .complete(&[opening], &instructions, ResponseContract::Structured(schema))
            .await;

        let mut state = self.state.lock().await;
        in_flight.disarm();
        if state.epoch != epoch {
            debug!("Discarding analysis response for a closed session");
            return Err(AnalysisError::Superseded);
        }

        let outcome = match result {
            Ok(TurnContent::Report(report)) => Ok(report),
            Ok(TurnContent::Text(_)) => Err(CompletionError::Unparseable {
                message: "expected a structured report".to_string(),
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(report) => {
                state
                    .turns
                    .push(Turn::responder(TurnContent::Report(report.clone())));
                state.phase = AnalysisPhase::Answered;
                info!(
                    title = report.title.as_str(),
                    metrics = report.metrics.len(),
                    "Analysis answered"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Analysis request failed; conversation cleared");
                let error = AnalysisError::Completion(e);
                state.turns.clear();
                state.phase = AnalysisPhase::Failed;
                state.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Ask a follow-up question over the whole conversation.
    ///
    /// The question is appended before the request is sent. If the request
    /// fails, the question stays in place without an answer and the next
    /// follow-up replaces it.
    pub async fn continue_analysis(&self, text: &str) -> Result<String, AnalysisError> {
        let question = text.trim();
        if question.is_empty() {
            return Err(AnalysisError::EmptyFollowUp);
        }

        let (epoch, snapshot) = {
            let mut state = self.state.lock().await;
            state.ensure_can_request()?;
            if state.phase == AnalysisPhase::Idle || state.turns.is_empty() {
                return Err(AnalysisError::NotStarted);
            }
            if state.turns.last().map(|t| t.role) == Some(TurnRole::Requester) {
                state.turns.pop();
            }
            state.turns.push(Turn::requester(question));
            state.phase = AnalysisPhase::Requesting;
            state.last_error = None;
            (state.epoch, state.turns.clone())
        };
        let mut in_flight = InFlight::new(&self.state, epoch, false);

        debug!(turns = snapshot.len(), "Sending follow-up");
        let result = self
            .client
            .complete(&snapshot, prompts::FOLLOW_UP_INSTRUCTIONS, ResponseContract::FreeText)
            .await;

        let mut state = self.state.lock().await;
        in_flight.disarm();
        if state.epoch != epoch {
            debug!("Discarding follow-up response for a closed session");
            return Err(AnalysisError::Superseded);
        }

        match result {
            Ok(content) => {
                let answer = content.to_wire_text();
                state.turns.push(Turn::responder(TurnContent::Text(answer.clone())));
                state.phase = AnalysisPhase::Answered;
                info!(turns = state.turns.len(), "Follow-up answered");
                Ok(answer)
            }
            Err(e) => {
                warn!(error = %e, "Follow-up failed; prior turns kept");
                let error = AnalysisError::Completion(e);
                state.phase = AnalysisPhase::Failed;
                state.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Close the conversation. Any in-flight response will be discarded.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        state.phase = AnalysisPhase::Closed;
        state.turns.clear();
        debug!(epoch = state.epoch, "Conversation closed");
    }

    pub async fn phase(&self) -> AnalysisPhase {
        self.state.lock().await.phase
    }

    /// Snapshot of the turn sequence for display or persistence.
    pub async fn turns(&self) -> Vec<Turn> {
        self.state.lock().await.turns.clone()
    }

    pub async fn last_error(&self) -> Option<AnalysisError> {
        self.state.lock().await.last_error.clone()
    }

    /// Subject given to the most recent `start_analysis`, if any.
    pub async fn subject(&self) -> Option<String> {
        self.state.lock().await.subject.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ScriptedTransport;
    use crate::config::RetryConfig;
    use crate::error::TransportError;
    use crate::history::{HistoryStore, InMemoryHistoryStore, OwnerScope, SavedRun};
    use crate::types::{DatasetKind, MeasurementPoint};
    use tokio::sync::Semaphore;

    fn report() -> StructuredReport {
        StructuredReport {
            title: "General EIS Analysis".into(),
            summary: "Mostly capacitive.".into(),
            metrics: vec![],
        }
    }

    fn sweep() -> Dataset {
        Dataset::new(
            DatasetKind::Sweep,
            vec![
                MeasurementPoint::new(100.0, 1200.0, -40.0),
                MeasurementPoint::new(1000.0, 300.0, -20.0),
            ],
        )
    }

    fn manager_with(
        transport: Arc<ScriptedTransport>,
        store: Arc<InMemoryHistoryStore>,
    ) -> ConversationManager {
        let retry = RetryConfig {
            initial_backoff_ms: 1,
            ..Default::default()
        };
        let client = Arc::new(CompletionClient::new(transport, retry));
        ConversationManager::new(client, ContextRetriever::new(store, OwnerScope::new("lab")))
    }

    fn manager(transport: Arc<ScriptedTransport>) -> ConversationManager {
        manager_with(transport, Arc::new(InMemoryHistoryStore::new()))
    }

    fn rejected() -> TransportError {
        TransportError::Status {
            status: 400,
            message: "bad".into(),
        }
    }

    #[tokio::test]
    async fn test_start_then_follow_up() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_report(&report());
        transport.queue_text("The phase rises with frequency.");
        let conv = manager(transport.clone());

        let got = conv
            .start_analysis(&sweep(), "plot-1", AnalysisTopic::General)
            .await
            .unwrap();
        assert_eq!(got, report());
        assert_eq!(conv.phase().await, AnalysisPhase::Answered);
        let turns = conv.turns().await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::Requester);
        assert_eq!(turns[1].content.as_report(), Some(&report()));

        let answer = conv.continue_analysis("What about phase?").await.unwrap();
        assert_eq!(answer, "The phase rises with frequency.");
        assert_eq!(conv.turns().await.len(), 4);

        let requests = transport.requests();
        assert!(requests[0].contract.is_structured());
        assert_eq!(requests[1].contract, ResponseContract::FreeText);
        assert_eq!(requests[1].turns.len(), 3);
        assert_eq!(requests[1].instructions, prompts::FOLLOW_UP_INSTRUCTIONS);
    }

    #[tokio::test]
    async fn test_start_failure_clears_turns() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_error(rejected());
        let conv = manager(transport);

        let err = conv
            .start_analysis(&sweep(), "plot-1", AnalysisTopic::General)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AnalysisError::Completion(CompletionError::Rejected { status: 400, .. })
        ));
        assert!(conv.turns().await.is_empty());
        assert_eq!(conv.phase().await, AnalysisPhase::Failed);
        assert_eq!(conv.last_error().await, Some(err));

        let err = conv.continue_analysis("anything").await.unwrap_err();
        assert_eq!(err, AnalysisError::NotStarted);
    }

    #[tokio::test]
    async fn test_follow_up_failure_keeps_history_and_question() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_report(&report());
        transport.queue_error(rejected());
        transport.queue_text("second try answer");
        let conv = manager(transport.clone());

        conv.start_analysis(&sweep(), "", AnalysisTopic::General)
            .await
            .unwrap();
        assert!(conv.continue_analysis("first question").await.is_err());
        let turns = conv.turns().await;
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[2].content.as_text(), Some("first question"));
        assert_eq!(conv.phase().await, AnalysisPhase::Failed);

        // The dangling question is replaced, keeping the roles alternating.
        conv.continue_analysis("second question").await.unwrap();
        let turns = conv.turns().await;
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].content.as_text(), Some("second question"));
        assert_eq!(turns[3].role, TurnRole::Responder);
        assert_eq!(transport.requests()[2].turns.len(), 3);
    }

    #[tokio::test]
    async fn test_guards() {
        let transport = Arc::new(ScriptedTransport::new());
        let conv = manager(transport.clone());

        assert_eq!(
            conv.continue_analysis("  ").await.unwrap_err(),
            AnalysisError::EmptyFollowUp
        );
        assert_eq!(
            conv.continue_analysis("hello").await.unwrap_err(),
            AnalysisError::NotStarted
        );
        let empty = Dataset::new(DatasetKind::Sweep, vec![]);
        assert_eq!(
            conv.start_analysis(&empty, "s", AnalysisTopic::General)
                .await
                .unwrap_err(),
            AnalysisError::NoData
        );
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_digest_included_and_trend_requested() {
        let store = Arc::new(InMemoryHistoryStore::new());
        let prior = SavedRun::new("plot-1", DatasetKind::Sweep, vec![]).with_conversation(vec![
            Turn::requester("old"),
            Turn::responder(TurnContent::Report(StructuredReport {
                title: "Old".into(),
                summary: "Dry soil last week.".into(),
                metrics: vec![],
            })),
        ]);
        store.insert(&OwnerScope::new("lab"), prior).await.unwrap();

        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_report(&report());
        let conv = manager_with(transport.clone(), store);
        conv.start_analysis(&sweep(), "plot-1", AnalysisTopic::Soil)
            .await
            .unwrap();

        let request = &transport.requests()[0];
        assert!(request.turns[0].text.contains("Summary: Dry soil last week."));
        assert!(request.turns[0].text.contains("Type: 1D Frequency Sweep"));
        assert!(request.instructions.contains("TREND ANALYSIS"));
        assert!(request.instructions.contains("agricultural EIS expert"));
    }

    #[tokio::test]
    async fn test_no_trend_without_history() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_report(&report());
        let conv = manager(transport.clone());
        conv.start_analysis(&sweep(), "new-subject", AnalysisTopic::Plant)
            .await
            .unwrap();
        assert!(!transport.requests()[0].instructions.contains("TREND ANALYSIS"));
    }

    #[tokio::test]
    async fn test_busy_while_in_flight_and_superseded_after_close() {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Arc::new(ScriptedTransport::gated(gate.clone()));
        transport.queue_report(&report());
        let conv = Arc::new(manager(transport.clone()));

        let pending = {
            let conv = conv.clone();
            tokio::spawn(async move {
                conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
                    .await
            })
        };
        while transport.call_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(conv.phase().await, AnalysisPhase::Requesting);
        assert_eq!(
            conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
                .await
                .unwrap_err(),
            AnalysisError::Busy
        );

        conv.close().await;
        gate.add_permits(1);
        assert_eq!(pending.await.unwrap().unwrap_err(), AnalysisError::Superseded);
        assert_eq!(conv.phase().await, AnalysisPhase::Closed);
        assert!(conv.turns().await.is_empty());
        assert_eq!(
            conv.continue_analysis("more").await.unwrap_err(),
            AnalysisError::Closed
        );
    }

    #[tokio::test]
    async fn test_restart_discards_previous_conversation() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.queue_report(&report());
        transport.queue_text("answer");
        transport.queue_report(&report());
        let conv = manager(transport);

        conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
            .await
            .unwrap();
        conv.continue_analysis("q").await.unwrap();
        conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
            .await
            .unwrap();
        assert_eq!(conv.turns().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_start_leaves_session_usable() {
        let gate = Arc::new(Semaphore::new(0));
        let transport = Arc::new(ScriptedTransport::gated(gate.clone()));
        transport.queue_report(&report());
        let conv = Arc::new(manager(transport.clone()));

        let pending = {
            let conv = conv.clone();
            tokio::spawn(async move {
                conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
                    .await
            })
        };
        while transport.call_count() == 0 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert_eq!(conv.phase().await, AnalysisPhase::Failed);
        assert_eq!(conv.last_error().await, Some(AnalysisError::Cancelled));
        assert!(conv.turns().await.is_empty());

        gate.add_permits(1);
        conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
            .await
            .unwrap();
        assert_eq!(conv.phase().await, AnalysisPhase::Answered);
        assert_eq!(conv.turns().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_follow_up_keeps_prior_turns() {
        let gate = Arc::new(Semaphore::new(1));
        let transport = Arc::new(ScriptedTransport::gated(gate.clone()));
        transport.queue_report(&report());
        transport.queue_text("late answer");
        let conv = Arc::new(manager(transport.clone()));
        conv.start_analysis(&sweep(), "s", AnalysisTopic::General)
            .await
            .unwrap();

        let pending = {
            let conv = conv.clone();
            tokio::spawn(async move { conv.continue_analysis("and phase?").await })
        };
        while transport.call_count() < 2 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert_eq!(conv.phase().await, AnalysisPhase::Failed);
        assert_eq!(conv.turns().await.len(), 3);

        gate.add_permits(1);
        let answer = conv.continue_analysis("and magnitude?").await.unwrap();
        assert_eq!(answer, "late answer");
        let turns = conv.turns().await;
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].content, TurnContent::Text("and magnitude?".into()));
    }
}
