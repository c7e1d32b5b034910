//! Saved analysis runs and the historical-context digest built from them.
//!
//! A [`SavedRun`] is written once when a session is committed and never
//! mutated. Runs live in a [`HistoryStore`] partitioned by [`OwnerScope`] and
//! are read back by the [`ContextRetriever`] and by history browsing.

pub mod retriever;
pub mod store;

pub use retriever::{ContextRetriever, render_digest};
pub use store::{HistoryStore, InMemoryHistoryStore, JsonHistoryStore};

use crate::types::{DatasetKind, MeasurementPoint, Turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Opaque partition key for saved runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerScope(String);

impl OwnerScope {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form of the scope, used as a directory name.
    pub fn path_segment(&self) -> String {
        let cleaned: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "_".to_string()
        } else {
            cleaned
        }
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A committed analysis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedRun {
    pub id: Uuid,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub kind: DatasetKind,
    pub points: Vec<MeasurementPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub conversation: Vec<Turn>,
}

/// The part of a saved run that a digest line is rendered from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SavedRunPayload<'a> {
    Sweep(&'a [MeasurementPoint]),
    Map(&'a [MeasurementPoint]),
    WithConversation(&'a [Turn]),
}

impl SavedRun {
    pub fn new(
        subject: impl Into<String>,
        kind: DatasetKind,
        points: Vec<MeasurementPoint>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            created_at: Utc::now(),
            kind,
            points,
            calibration: None,
            conversation: Vec::new(),
        }
    }

    pub fn with_conversation(mut self, conversation: Vec<Turn>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn with_calibration(mut self, calibration: BTreeMap<String, f64>) -> Self {
        self.calibration = Some(calibration);
        self
    }

    /// A recorded conversation takes precedence over the raw points.
    pub fn payload(&self) -> SavedRunPayload<'_> {
        if !self.conversation.is_empty() {
            return SavedRunPayload::WithConversation(&self.conversation);
        }
        match self.kind {
            DatasetKind::Sweep => SavedRunPayload::Sweep(&self.points),
            DatasetKind::Map => SavedRunPayload::Map(&self.points),
        }
    }
}

/// Selection over one owner's saved runs.
///
/// Results are always ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Exact-match subject filter.
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn for_subject(subject: impl Into<String>, limit: usize) -> Self {
        Self {
            subject: Some(subject.into()),
            limit: Some(limit),
        }
    }

    pub fn matches(&self, run: &SavedRun) -> bool {
        self.subject.as_deref().is_none_or(|s| run.subject == s)
    }

    /// Filter, order newest first, and truncate.
    pub fn apply<'a>(&self, runs: impl IntoIterator<Item = &'a SavedRun>) -> Vec<SavedRun> {
        let mut selected: Vec<SavedRun> = runs
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}
