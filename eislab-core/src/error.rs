//! Error types for the EISLab core.
//!
//! Uses `thiserror` for public API error types with one enum per domain:
//! input parsing, completion calls, history storage, conversation control,
//! spatial mapping, and configuration.

use crate::types::{AnalysisTopic, DatasetKind};

/// Top-level error type for the EISLab core library.
#[derive(Debug, thiserror::Error)]
pub enum EislabError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Spatial error: {0}")]
    Spatial(#[from] SpatialError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from normalizing raw tabular input.
///
/// Any of these aborts the whole file; there is no partial dataset.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Missing required column '{column}'{}", row_suffix(.row))]
    MissingColumn { column: String, row: Option<usize> },

    #[error("Invalid value '{value}' for '{field}' in row {row}: {reason}")]
    InvalidValue {
        row: usize,
        field: String,
        value: String,
        reason: String,
    },

    #[error("Wrong dataset shape for {expected} input: {reason}")]
    WrongDatasetShape {
        expected: DatasetKind,
        reason: String,
    },

    #[error("Malformed input: {message}")]
    Malformed { message: String },
}

fn row_suffix(row: &Option<usize>) -> String {
    row.map(|r| format!(" in row {}", r)).unwrap_or_default()
}

/// Errors from the completion client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    #[error("Analysis service is not configured: {reason}")]
    NotConfigured { reason: String },

    #[error("Analysis service unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("Could not parse the analysis response: {message}")]
    Unparseable { message: String },

    #[error("Analysis request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Outcome of a single failed exchange with the completion service.
///
/// The completion client turns these into a [`CompletionError`] once the
/// retry policy is settled.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Request failed: {message}")]
    Network { message: String },

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Malformed response: {message}")]
    Malformed { message: String },
}

impl TransportError {
    /// Transport failures and server-side statuses are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Status { status, .. } => *status >= 500,
            TransportError::Malformed { .. } => false,
        }
    }
}

/// Errors from the saved-run store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("History store I/O failed: {message}")]
    Io { message: String },

    #[error("History store is corrupt: {message}")]
    Corrupt { message: String },

    #[error("Cannot save run: {reason}")]
    Rejected { reason: String },
}

/// Errors from fetching historical context. Always soft.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
    #[error("History lookup failed: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from the conversation manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("An analysis request is already in flight for this session")]
    Busy,

    #[error("No data available to analyze")]
    NoData,

    #[error("No analysis has been started for this session")]
    NotStarted,

    #[error("Follow-up question is empty")]
    EmptyFollowUp,

    #[error("The {topic} topic is not available for {kind} data")]
    UnsupportedTopic {
        topic: AnalysisTopic,
        kind: DatasetKind,
    },

    #[error("Session was replaced while the request was in flight; response discarded")]
    Superseded,

    #[error("The request was abandoned before a response arrived")]
    Cancelled,

    #[error("Session is closed")]
    Closed,
}

/// Errors from the spatial aggregator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    #[error("Point {index} has no spatial coordinates")]
    MissingCoordinates { index: usize },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },
}

/// A type alias for results using the top-level `EislabError`.
pub type Result<T> = std::result::Result<T, EislabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_missing_column() {
        let err = ParseError::MissingColumn {
            column: "y".into(),
            row: None,
        };
        assert_eq!(err.to_string(), "Missing required column 'y'");

        let err = ParseError::MissingColumn {
            column: "phase".into(),
            row: Some(4),
        };
        assert_eq!(err.to_string(), "Missing required column 'phase' in row 4");
    }

    #[test]
    fn test_error_display_invalid_value() {
        let err = EislabError::Parse(ParseError::InvalidValue {
            row: 2,
            field: "magnitude".into(),
            value: "abc".into(),
            reason: "not a number".into(),
        });
        assert_eq!(
            err.to_string(),
            "Parse error: Invalid value 'abc' for 'magnitude' in row 2: not a number"
        );
    }

    #[test]
    fn test_error_display_wrong_shape() {
        let err = ParseError::WrongDatasetShape {
            expected: DatasetKind::Sweep,
            reason: "column 'x' is present".into(),
        };
        assert_eq!(
            err.to_string(),
            "Wrong dataset shape for sweep input: column 'x' is present"
        );
    }

    #[test]
    fn test_completion_error_variants() {
        let err = CompletionError::Unavailable {
            attempts: 3,
            last_error: "HTTP 503".into(),
        };
        assert_eq!(
            err.to_string(),
            "Analysis service unavailable after 3 attempts: HTTP 503"
        );

        let err = CompletionError::Rejected {
            status: 400,
            message: "bad request".into(),
        };
        assert_eq!(
            err.to_string(),
            "Analysis request rejected with status 400: bad request"
        );
    }

    #[test]
    fn test_transport_error_classification() {
        let network = TransportError::Network {
            message: "connection reset".into(),
        };
        assert!(network.is_transient());
        let server = TransportError::Status {
            status: 503,
            message: "overloaded".into(),
        };
        assert!(server.is_transient());
        let client = TransportError::Status {
            status: 400,
            message: "bad schema".into(),
        };
        assert!(!client.is_transient());
        let throttled = TransportError::Status {
            status: 429,
            message: "quota".into(),
        };
        assert!(!throttled.is_transient());
        assert!(
            !TransportError::Malformed {
                message: "not json".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_analysis_error_is_transparent_for_completion() {
        let err: AnalysisError = CompletionError::NotConfigured {
            reason: "env var 'GEMINI_API_KEY' not set".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Analysis service is not configured: env var 'GEMINI_API_KEY' not set"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EislabError = io_err.into();
        assert!(matches!(err, EislabError::Io(_)));
    }

    #[test]
    fn test_retrieval_error_wraps_storage() {
        let err: RetrievalError = StorageError::Io {
            message: "disk gone".into(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "History lookup failed: History store I/O failed: disk gone"
        );
    }
}
