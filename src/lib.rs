pub mod config;
pub mod constants;
pub mod daemon;
pub mod embed;
pub mod error;
pub mod fts;
pub mod git;
pub mod indexer;
pub mod logger;
pub mod query;
pub mod storage;
pub mod watch;

// Re-export commonly used types
pub use config::DaemonConfig;
pub use daemon::{DaemonClient, DaemonService};
pub use embed::{EmbeddingProvider, ThrottleState};
pub use error::{CidxError, Result};
pub use indexer::{IndexOptions, ProcessingStats, ProgressControl, ProgressReporter, SmartIndexer};
pub use storage::{DiskVectorStore, Point, PointPayload, VectorBackend};
