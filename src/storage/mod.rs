//! Vector storage layer.
//!
//! `DiskVectorStore` owns the on-disk collections under
//! `<config_dir>/index/<collection>/`: an LMDB environment holding arroy
//! vectors plus a payload table, with a `collection_meta.json` beside it
//! carrying the vector size and the rebuild stamp the daemon cache uses for
//! freshness checks. The write surface is also exposed through the
//! [`VectorBackend`] trait so the indexer can be exercised against stubs.

pub mod collections;
pub mod meta;
pub mod semantic;
pub mod store;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use meta::CollectionMeta;
pub use semantic::{AnnIndex, IdMapping};
pub use store::{CollectionStatus, DiskVectorStore, ScrolledPoint};

/// Payload carried by every indexed point. All fields are plain values so
/// results serialize directly across the RPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PointPayload {
    pub path: String,
    pub content: String,
    pub line_start: usize,
    pub line_end: usize,
    pub language: String,
    /// ISO-8601 `%Y-%m-%dT%H:%M:%SZ` timestamp of when the point was indexed
    pub indexed_at: String,
    /// Filesystem mtime at indexing time (absent for git-derived points)
    #[serde(default)]
    pub filesystem_mtime: Option<f64>,
    /// Mtime recorded for staleness detection
    #[serde(default)]
    pub file_last_modified: Option<f64>,
    /// Commit date (`YYYY-MM-DD`) for temporal points
    #[serde(default)]
    pub commit_date: Option<String>,
    /// `commit_message` or `commit_diff` for temporal points
    #[serde(default)]
    pub chunk_type: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// A vector plus payload pending upsert.
#[derive(Debug, Clone)]
pub struct Point {
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// Write-side interface the indexer and clean operations depend on.
pub trait VectorBackend: Send + Sync {
    /// Create the collection if absent; returns its resolved name.
    fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()>;

    /// Remove every point from a collection, keeping the collection itself.
    fn clear_collection(&self, name: &str) -> Result<bool>;

    /// Delete a collection and its directory entirely.
    fn delete_collection(&self, name: &str) -> Result<bool>;

    fn list_collections(&self) -> Result<Vec<String>>;

    /// Append a batch of points. `Ok(false)` and `Err` both abort the
    /// indexing run that issued the flush.
    fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<bool>;

    /// Rebuild the ANN forest and stamp a fresh rebuild uuid.
    fn build_collection(&self, collection: &str) -> Result<()>;

    /// Page through stored points. `offset` is the id to resume from;
    /// the returned offset is `None` once the collection is exhausted.
    fn scroll_points(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<u32>,
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<(Vec<ScrolledPoint>, Option<u32>)>;

    fn count_points(&self, collection: &str) -> Result<u64>;

    fn collection_status(&self, collection: &str) -> Result<CollectionStatus>;
}
