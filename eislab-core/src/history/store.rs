//! Storage backends for saved runs.
//!
//! [`JsonHistoryStore`] keeps one JSON document per owner at
//! `<root>/<owner>/eis_history.json`, written atomically (`.tmp` then rename).
//! [`InMemoryHistoryStore`] is used by tests and ephemeral sessions.

use super::{HistoryQuery, OwnerScope, SavedRun};
use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

const HISTORY_FILE: &str = "eis_history.json";

/// Read/write access to saved runs, partitioned by owner.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a new run. Runs are never updated after insertion.
    async fn insert(&self, owner: &OwnerScope, run: SavedRun) -> Result<(), StorageError>;

    /// Runs matching `query`, newest first.
    async fn query(
        &self,
        owner: &OwnerScope,
        query: &HistoryQuery,
    ) -> Result<Vec<SavedRun>, StorageError>;
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryDocument {
    #[serde(default)]
    runs: Vec<SavedRun>,
}

/// File-backed store.
pub struct JsonHistoryStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on the owner documents.
    write_lock: Mutex<()>,
}

impl JsonHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, owner: &OwnerScope) -> PathBuf {
        self.root.join(owner.path_segment()).join(HISTORY_FILE)
    }

    async fn load(&self, path: &Path) -> Result<HistoryDocument, StorageError> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HistoryDocument::default());
            }
            Err(e) => {
                return Err(StorageError::Io {
                    message: format!("Failed to read {}: {}", path.display(), e),
                });
            }
        };
        serde_json::from_str(&data).map_err(|e| StorageError::Corrupt {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    async fn save(&self, path: &Path, document: &HistoryDocument) -> Result<(), StorageError> {
        let io_err = |action: &str, e: std::io::Error| StorageError::Io {
            message: format!("Failed to {} {}: {}", action, path.display(), e),
        };

        let json = serde_json::to_string_pretty(document).map_err(|e| StorageError::Io {
            message: format!("Failed to serialize history: {}", e),
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("create directory for", e))?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json.as_bytes())
            .await
            .map_err(|e| io_err("write", e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_err("replace", e))
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn insert(&self, owner: &OwnerScope, run: SavedRun) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let path = self.document_path(owner);
        let mut document = self.load(&path).await?;
        let id = run.id;
        document.runs.push(run);
        self.save(&path, &document).await?;
        info!(owner = %owner, run_id = %id, path = %path.display(), "Saved analysis run");
        Ok(())
    }

    async fn query(
        &self,
        owner: &OwnerScope,
        query: &HistoryQuery,
    ) -> Result<Vec<SavedRun>, StorageError> {
        let path = self.document_path(owner);
        let document = self.load(&path).await?;
        let runs = query.apply(&document.runs);
        debug!(owner = %owner, matched = runs.len(), "History query");
        Ok(runs)
    }
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    runs: RwLock<HashMap<OwnerScope, Vec<SavedRun>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, owner: &OwnerScope) -> usize {
        self.runs.read().await.get(owner).map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn insert(&self, owner: &OwnerScope, run: SavedRun) -> Result<(), StorageError> {
        self.runs
            .write()
            .await
            .entry(owner.clone())
            .or_default()
            .push(run);
        Ok(())
    }

    async fn query(
        &self,
        owner: &OwnerScope,
        query: &HistoryQuery,
    ) -> Result<Vec<SavedRun>, StorageError> {
        let runs = self.runs.read().await;
        Ok(runs
            .get(owner)
            .map(|owned| query.apply(owned))
            .unwrap_or_default())
    }
}
