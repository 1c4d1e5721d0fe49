//! Centralized error types for the daemon
//!
//! Every failure that can cross the RPC boundary maps to a stable `kind`
//! string so clients can match on it without parsing messages.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for daemon operations
#[derive(Error, Debug)]
pub enum CidxError {
    /// An indexing or watch job is already live on this daemon
    #[error("already running: {message}")]
    AlreadyRunning { message: String },

    /// Incremental indexing requested with no prior timestamp.
    /// Callers escalate to a full index instead of surfacing this.
    #[error("no previous index found")]
    NoPreviousIndex,

    /// Provider, model, or git availability changed since the last run.
    /// Callers escalate to a full index instead of surfacing this.
    #[error("configuration changed since last index")]
    ConfigurationChanged,

    /// Semantic or temporal collection is absent
    #[error("collection not found: {0}")]
    MissingCollection(String),

    /// The vector store rejected a batch flush; the indexing run is aborted
    #[error("vector store rejected batch upsert: {0}")]
    BackendUpsertFailed(String),

    /// The embedding provider returned fewer vectors than requested
    #[error("embedding provider returned {returned} vectors for {requested} inputs")]
    PartialEmbeddingResponse { requested: usize, returned: usize },

    /// Another daemon owns the project socket
    #[error("daemon already running on {socket}")]
    SingleInstanceViolation { socket: PathBuf },

    /// Malformed temporal time-range string
    #[error("invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Language or path filter validation failure
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Cooperative cancellation via the progress callback
    #[error("operation cancelled by progress callback")]
    CallbackInterrupt,

    /// Transient network failure after all retries were exhausted
    #[error("network error: {0}")]
    Network(String),

    /// Embedding provider rate limit exhausted after retries
    #[error("provider rate limited: {0}")]
    ProviderRateLimited(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Vector storage errors (LMDB / ANN layer)
    #[error("storage error: {0}")]
    Storage(String),

    /// Full-text index errors
    #[error("full-text index error: {0}")]
    Fts(String),

    /// Git subprocess errors
    #[error("git error: {0}")]
    Git(String),

    /// I/O operation errors
    #[error("I/O error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An indexing run failed and was recorded in progressive metadata
    #[error("indexing failed: {0}")]
    IndexingFailure(String),

    /// Wire protocol errors (malformed requests, serialization)
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CidxError {
    /// Stable kind string carried in RPC error envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::NoPreviousIndex => "no_previous_index",
            Self::ConfigurationChanged => "configuration_changed",
            Self::MissingCollection(_) => "missing_collection",
            Self::BackendUpsertFailed(_) => "backend_upsert_failed",
            Self::PartialEmbeddingResponse { .. } => "partial_embedding_response",
            Self::SingleInstanceViolation { .. } => "single_instance_violation",
            Self::InvalidTimeRange(_) => "invalid_time_range",
            Self::InvalidFilter(_) => "invalid_filter",
            Self::CallbackInterrupt => "callback_interrupt",
            Self::Network(_) => "network_error",
            Self::ProviderRateLimited(_) => "provider_rate_limited",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::Fts(_) => "fts_error",
            Self::Git(_) => "git_error",
            Self::Io { .. } => "io_error",
            Self::IndexingFailure(_) => "indexing_failure",
            Self::Protocol(_) => "protocol_error",
        }
    }

    /// Create an I/O error carrying the offending path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for daemon operations
pub type Result<T> = std::result::Result<T, CidxError>;

impl From<std::io::Error> for CidxError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for CidxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<heed::Error> for CidxError {
    fn from(err: heed::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<arroy::Error> for CidxError {
    fn from(err: arroy::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<tantivy::TantivyError> for CidxError {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::Fts(err.to_string())
    }
}

impl From<reqwest::Error> for CidxError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<globset::Error> for CidxError {
    fn from(err: globset::Error) -> Self {
        Self::InvalidFilter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(
            CidxError::AlreadyRunning {
                message: "x".into()
            }
            .kind(),
            "already_running"
        );
        assert_eq!(
            CidxError::PartialEmbeddingResponse {
                requested: 4,
                returned: 3
            }
            .kind(),
            "partial_embedding_response"
        );
        assert_eq!(
            CidxError::SingleInstanceViolation {
                socket: PathBuf::from("/tmp/daemon.sock")
            }
            .kind(),
            "single_instance_violation"
        );
        assert_eq!(
            CidxError::InvalidTimeRange("x".into()).kind(),
            "invalid_time_range"
        );
    }

    #[test]
    fn test_partial_response_message_enumerates_counts() {
        let err = CidxError::PartialEmbeddingResponse {
            requested: 10,
            returned: 9,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('9'));
    }

    #[test]
    fn test_io_error_carries_path() {
        let err = CidxError::io(
            "/some/file",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert!(err.to_string().contains("/some/file"));
    }
}
