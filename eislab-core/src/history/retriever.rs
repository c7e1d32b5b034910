//! Historical-context digest for a subject.

use super::{HistoryQuery, HistoryStore, OwnerScope, SavedRun, SavedRunPayload};
use crate::error::RetrievalError;
use crate::types::TurnRole;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DIGEST_HEADER: &str = "--- Historical Context for Subject ---";
pub const DIGEST_FOOTER: &str = "--- End of Historical Context ---";

/// Default number of prior runs included in a digest.
pub const DEFAULT_DIGEST_LIMIT: usize = 5;

/// Fetches prior runs for a subject and renders them as a prompt digest.
///
/// Retrieval is a soft dependency: any storage failure is logged and yields
/// an empty digest.
#[derive(Clone)]
pub struct ContextRetriever {
    store: Arc<dyn HistoryStore>,
    owner: OwnerScope,
    limit: usize,
}

impl ContextRetriever {
    pub fn new(store: Arc<dyn HistoryStore>, owner: OwnerScope) -> Self {
        Self {
            store,
            owner,
            limit: DEFAULT_DIGEST_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn owner(&self) -> &OwnerScope {
        &self.owner
    }

    /// Digest for `subject`, or an empty string when there is no subject,
    /// no history, or the store cannot be read.
    pub async fn fetch_digest(&self, subject: &str) -> String {
        match self.try_fetch_digest(subject).await {
            Ok(digest) => digest,
            Err(e) => {
                warn!(
                    subject,
                    owner = %self.owner,
                    error = %e,
                    "History lookup failed; continuing without context"
                );
                String::new()
            }
        }
    }

    /// Like [`fetch_digest`](Self::fetch_digest) but surfaces the failure.
    pub async fn try_fetch_digest(&self, subject: &str) -> Result<String, RetrievalError> {
        let subject = subject.trim();
        if subject.is_empty() || self.limit == 0 {
            return Ok(String::new());
        }

        let query = HistoryQuery::for_subject(subject, self.limit);
        let mut runs = self.store.query(&self.owner, &query).await?;
        debug!(subject, runs = runs.len(), "Fetched history for digest");

        // Newest first from the store; the digest reads oldest first.
        runs.reverse();
        Ok(render_digest(&runs))
    }
}

/// Render runs (oldest first) into the digest block. Empty input yields "".
pub fn render_digest(runs: &[SavedRun]) -> String {
    if runs.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{}", DIGEST_HEADER);
    for run in runs {
        let _ = writeln!(out, "\n[{}]", run.created_at.format("%Y-%m-%d %H:%M UTC"));
        if let Some(line) = digest_line(run.payload()) {
            let _ = writeln!(out, "{}", line);
        }
    }
    let _ = writeln!(out, "{}", DIGEST_FOOTER);
    out
}

fn digest_line(payload: SavedRunPayload<'_>) -> Option<String> {
    match payload {
        SavedRunPayload::WithConversation(turns) => turns
            .iter()
            .rev()
            .find(|t| t.role == TurnRole::Responder)
            .and_then(|t| t.content.as_report())
            .map(|report| format!("Summary: {}", report.summary)),
        SavedRunPayload::Sweep(points) => match (points.first(), points.last()) {
            (Some(low), Some(high)) => Some(format!(
                "Data (1D): {} points. LF: {:.0}Ω, HF: {:.0}Ω",
                points.len(),
                low.magnitude(),
                high.magnitude()
            )),
            _ => Some("Data (1D): 0 points.".to_string()),
        },
        SavedRunPayload::Map(points) => Some(format!("Data (2D): {} data points.", points.len())),
    }
}
