//! Collection metadata file.
//!
//! `collection_meta.json` is the freshness contract between the store and
//! the daemon cache: `vector_size` drives ANN construction, and
//! `hnsw_index.index_rebuild_uuid` changes whenever the on-disk index is
//! reconstructed, letting the cache detect out-of-band rebuilds.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::COLLECTION_META_FILE;
use crate::error::{CidxError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub vector_size: usize,

    pub hnsw_index: HnswIndexMeta,

    #[serde(default)]
    pub points_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswIndexMeta {
    pub index_rebuild_uuid: String,
}

impl CollectionMeta {
    pub fn new(vector_size: usize) -> Self {
        Self {
            vector_size,
            hnsw_index: HnswIndexMeta {
                index_rebuild_uuid: Uuid::new_v4().to_string(),
            },
            points_count: 0,
        }
    }

    pub fn meta_path(collection_path: &Path) -> std::path::PathBuf {
        collection_path.join(COLLECTION_META_FILE)
    }

    pub fn read(collection_path: &Path) -> Result<Self> {
        let path = Self::meta_path(collection_path);
        let content = std::fs::read_to_string(&path).map_err(|e| CidxError::io(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| CidxError::storage(format!("corrupt {}: {e}", path.display())))
    }

    pub fn write(&self, collection_path: &Path) -> Result<()> {
        std::fs::create_dir_all(collection_path)
            .map_err(|e| CidxError::io(collection_path, e))?;
        let path = Self::meta_path(collection_path);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, content).map_err(|e| CidxError::io(&path, e))?;
        Ok(())
    }

    /// Stamp a new rebuild uuid and persist.
    pub fn mark_rebuilt(&mut self, collection_path: &Path) -> Result<()> {
        self.hnsw_index.index_rebuild_uuid = Uuid::new_v4().to_string();
        self.write(collection_path)
    }

    /// Read just the rebuild stamp; `None` when the metadata file is
    /// missing or unreadable.
    pub fn rebuild_stamp(collection_path: &Path) -> Option<String> {
        Self::read(collection_path)
            .ok()
            .map(|meta| meta.hnsw_index.index_rebuild_uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let meta = CollectionMeta::new(1024);
        meta.write(dir.path()).unwrap();

        let loaded = CollectionMeta::read(dir.path()).unwrap();
        assert_eq!(loaded.vector_size, 1024);
        assert_eq!(
            loaded.hnsw_index.index_rebuild_uuid,
            meta.hnsw_index.index_rebuild_uuid
        );
    }

    #[test]
    fn test_mark_rebuilt_changes_stamp() {
        let dir = tempdir().unwrap();
        let mut meta = CollectionMeta::new(4);
        meta.write(dir.path()).unwrap();
        let before = CollectionMeta::rebuild_stamp(dir.path()).unwrap();

        meta.mark_rebuilt(dir.path()).unwrap();
        let after = CollectionMeta::rebuild_stamp(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_missing_stamp_is_none() {
        let dir = tempdir().unwrap();
        assert_eq!(CollectionMeta::rebuild_stamp(dir.path()), None);
    }
}
