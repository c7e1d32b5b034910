//! # EISLab Core
//!
//! Core library for EISLab, an impedance-spectroscopy analysis assistant.
//! Provides signal normalization, device calibration, spatial aggregation of
//! map data, saved-run history with digest retrieval, and the LLM-backed
//! conversation that interprets a dataset.

pub mod calibration;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod error;
pub mod history;
pub mod prompts;
pub mod session;
pub mod signal;
pub mod spatial;
pub mod types;

// Re-export commonly used types at the crate root.
pub use calibration::Calibration;
pub use completion::{
    CompletionClient, CompletionRequest, CompletionTransport, GeminiTransport, ScriptedTransport,
};
pub use config::{EislabConfig, LlmConfig, RetryConfig};
pub use conversation::{AnalysisPhase, ConversationManager};
pub use error::{
    AnalysisError, CompletionError, EislabError, ParseError, Result, StorageError, TransportError,
};
pub use history::{
    ContextRetriever, HistoryQuery, HistoryStore, InMemoryHistoryStore, JsonHistoryStore,
    OwnerScope, SavedRun,
};
pub use session::{AnalysisSession, Workbench};
pub use spatial::{Metric, SpatialMap};
pub use types::{
    AnalysisTopic, Dataset, DatasetKind, MeasurementPoint, ResponseContract, StructuredReport,
    Turn, TurnContent, TurnRole,
};
