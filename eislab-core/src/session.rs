//! Analysis sessions and the workbench that holds them.
//!
//! An [`AnalysisSession`] bundles one loaded dataset with its conversation and
//! is committed to history as a [`SavedRun`]. The [`Workbench`] keeps at most
//! one live session per view (sweep, map); loading a dataset closes whatever
//! session that view held, so a late response for the old data is discarded.

use crate::completion::{CompletionClient, GeminiTransport};
use crate::config::EislabConfig;
use crate::conversation::{AnalysisPhase, ConversationManager};
use crate::error::{AnalysisError, EislabError, StorageError};
use crate::history::{
    ContextRetriever, HistoryQuery, HistoryStore, JsonHistoryStore, OwnerScope, SavedRun,
};
use crate::types::{AnalysisTopic, Dataset, DatasetKind, StructuredReport, Turn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// One dataset under analysis.
pub struct AnalysisSession {
    id: Uuid,
    dataset: Dataset,
    calibration: Option<BTreeMap<String, f64>>,
    conversation: ConversationManager,
    store: Arc<dyn HistoryStore>,
    owner: OwnerScope,
}

impl AnalysisSession {
    pub fn new(
        dataset: Dataset,
        conversation: ConversationManager,
        store: Arc<dyn HistoryStore>,
        owner: OwnerScope,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset,
            calibration: None,
            conversation,
            store,
            owner,
        }
    }

    /// Record the calibration coefficients the dataset was corrected with.
    pub fn with_calibration(mut self, coefficients: BTreeMap<String, f64>) -> Self {
        self.calibration = Some(coefficients).filter(|c| !c.is_empty());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn kind(&self) -> DatasetKind {
        self.dataset.kind
    }

    pub fn calibration(&self) -> Option<&BTreeMap<String, f64>> {
        self.calibration.as_ref()
    }

    pub fn conversation(&self) -> &ConversationManager {
        &self.conversation
    }

    /// Run the opening analysis. `None` picks the default topic for the view.
    pub async fn analyze(
        &self,
        subject: &str,
        topic: Option<AnalysisTopic>,
    ) -> Result<StructuredReport, AnalysisError> {
        let topic = topic.unwrap_or_else(|| AnalysisTopic::default_for(self.dataset.kind));
        self.conversation
            .start_analysis(&self.dataset, subject, topic)
            .await
    }

    pub async fn ask(&self, question: &str) -> Result<String, AnalysisError> {
        self.conversation.continue_analysis(question).await
    }

    pub async fn phase(&self) -> AnalysisPhase {
        self.conversation.phase().await
    }

    pub async fn turns(&self) -> Vec<Turn> {
        self.conversation.turns().await
    }

    /// Build the saved-run record for this session without storing it.
    ///
    /// Requires a non-empty subject and a non-empty dataset.
    pub async fn snapshot(&self, subject: &str) -> Result<SavedRun, StorageError> {
        let subject = subject.trim();
        if subject.is_empty() {
            return Err(StorageError::Rejected {
                reason: "a subject is required to save a run".to_string(),
            });
        }
        if self.dataset.is_empty() {
            return Err(StorageError::Rejected {
                reason: "there is no data to save".to_string(),
            });
        }

        let mut run = SavedRun::new(subject, self.dataset.kind, self.dataset.points.clone())
            .with_conversation(self.conversation.turns().await);
        if let Some(coefficients) = &self.calibration {
            run = run.with_calibration(coefficients.clone());
        }
        Ok(run)
    }

    /// Save this session to history and return the stored record.
    pub async fn commit(&self, subject: &str) -> Result<SavedRun, StorageError> {
        let run = self.snapshot(subject).await?;
        self.store.insert(&self.owner, run.clone()).await?;
        info!(
            session = %self.id,
            run_id = %run.id,
            subject = run.subject.as_str(),
            turns = run.conversation.len(),
            "Session committed"
        );
        Ok(run)
    }

    pub async fn close(&self) {
        self.conversation.close().await;
    }
}

/// Holds one live session per dataset view.
pub struct Workbench {
    client: Arc<CompletionClient>,
    store: Arc<dyn HistoryStore>,
    owner: OwnerScope,
    digest_limit: usize,
    sessions: Mutex<HashMap<DatasetKind, Arc<AnalysisSession>>>,
}

impl Workbench {
    pub fn new(
        client: Arc<CompletionClient>,
        store: Arc<dyn HistoryStore>,
        owner: OwnerScope,
    ) -> Self {
        Self {
            client,
            store,
            owner,
            digest_limit: crate::history::retriever::DEFAULT_DIGEST_LIMIT,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_digest_limit(mut self, limit: usize) -> Self {
        self.digest_limit = limit;
        self
    }

    /// Wire a workbench to the Gemini transport and the JSON history store
    /// described by `config`.
    pub fn from_config(config: &EislabConfig) -> Result<Self, EislabError> {
        let transport = GeminiTransport::new(&config.llm)?;
        let client = Arc::new(CompletionClient::new(
            Arc::new(transport),
            config.retry.clone(),
        ));
        let store = Arc::new(JsonHistoryStore::new(config.history.resolve_data_dir()));
        Ok(Self::new(client, store, OwnerScope::new(config.history.owner.clone()))
            .with_digest_limit(config.history.digest_limit))
    }

    pub fn owner(&self) -> &OwnerScope {
        &self.owner
    }

    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    fn retriever(&self) -> ContextRetriever {
        ContextRetriever::new(self.store.clone(), self.owner.clone()).with_limit(self.digest_limit)
    }

    /// Make `dataset` the active session for its view, closing the previous one.
    pub async fn load(
        &self,
        dataset: Dataset,
        calibration: Option<BTreeMap<String, f64>>,
    ) -> Arc<AnalysisSession> {
        let kind = dataset.kind;
        let conversation = ConversationManager::new(self.client.clone(), self.retriever());
        let mut session =
            AnalysisSession::new(dataset, conversation, self.store.clone(), self.owner.clone());
        if let Some(coefficients) = calibration {
            session = session.with_calibration(coefficients);
        }
        let session = Arc::new(session);

        let previous = self.sessions.lock().await.insert(kind, session.clone());
        if let Some(previous) = previous {
            previous.close().await;
            info!(view = %kind, replaced = %previous.id(), "Replaced active session");
        }
        session
    }

    pub async fn session(&self, kind: DatasetKind) -> Option<Arc<AnalysisSession>> {
        self.sessions.lock().await.get(&kind).cloned()
    }

    /// Close and drop the session for `kind`.
    pub async fn unload(&self, kind: DatasetKind) {
        let previous = self.sessions.lock().await.remove(&kind);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Saved runs for this workbench's owner, newest first.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<SavedRun>, StorageError> {
        self.store.query(&self.owner, query).await
    }
}
