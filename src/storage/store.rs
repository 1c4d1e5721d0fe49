//! Disk-backed vector store using arroy + heed (LMDB).
//!
//! One LMDB environment per collection directory, holding the arroy vector
//! trees and a payload table keyed by point id. Writes happen only from the
//! indexing thread or explicit clean operations; reads go through cached
//! [`AnnIndex`](super::semantic::AnnIndex) handles or the scroll API.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use arroy::distances::Cosine;
use arroy::{Database as ArroyDatabase, Reader, Writer};
use heed::byteorder::BigEndian;
use heed::types::{SerdeBincode, U32};
use heed::{Database, Env, EnvOpenOptions};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info};

use crate::constants::DEFAULT_LMDB_MAP_SIZE_MB;
use crate::error::{CidxError, Result};

use super::meta::CollectionMeta;
use super::semantic::{AnnIndex, IdMapping};
use super::{Point, PointPayload, VectorBackend};

/// arroy index id within each environment; a collection holds one index
const ARROY_INDEX: u16 = 0;

/// A point returned from [`DiskVectorStore::scroll_points`].
#[derive(Debug, Clone)]
pub struct ScrolledPoint {
    pub id: u32,
    pub payload: Option<PointPayload>,
    pub vector: Option<Vec<f32>>,
}

/// Storage-level status for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub points_count: u64,
    pub vector_size: usize,
    pub index_rebuild_uuid: String,
}

/// Open handles for one collection environment.
#[derive(Clone)]
pub(crate) struct CollectionHandle {
    pub(crate) env: Env,
    pub(crate) vectors: ArroyDatabase<Cosine>,
    pub(crate) points: Database<U32<BigEndian>, SerdeBincode<PointPayload>>,
    pub(crate) vector_size: usize,
}

pub struct DiskVectorStore {
    index_dir: PathBuf,
    handles: Mutex<HashMap<String, CollectionHandle>>,
}

impl DiskVectorStore {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.index_dir.join(name)
    }

    fn map_size_bytes() -> usize {
        let mb = std::env::var("CIDX_LMDB_MAP_SIZE_MB")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_LMDB_MAP_SIZE_MB);
        mb * 1024 * 1024
    }

    /// Open (or create) the environment for a collection. Handles are
    /// cached so the same LMDB environment is never opened twice in one
    /// process.
    pub(crate) fn handle(&self, name: &str, create: Option<usize>) -> Result<CollectionHandle> {
        let mut handles = self.handles.lock().expect("handle map poisoned");
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }

        let path = self.collection_path(name);
        let meta = match CollectionMeta::read(&path) {
            Ok(meta) => meta,
            Err(_) => match create {
                Some(vector_size) => {
                    let meta = CollectionMeta::new(vector_size);
                    meta.write(&path)?;
                    info!("created collection {name} (vector_size: {vector_size})");
                    meta
                }
                None => return Err(CidxError::MissingCollection(name.to_string())),
            },
        };

        std::fs::create_dir_all(&path).map_err(|e| CidxError::io(&path, e))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::map_size_bytes())
                .max_dbs(4)
                .open(&path)?
        };

        let mut wtxn = env.write_txn()?;
        let vectors: ArroyDatabase<Cosine> = env.create_database(&mut wtxn, Some("vectors"))?;
        let points: Database<U32<BigEndian>, SerdeBincode<PointPayload>> =
            env.create_database(&mut wtxn, Some("points"))?;
        wtxn.commit()?;

        let handle = CollectionHandle {
            env,
            vectors,
            points,
            vector_size: meta.vector_size,
        };
        handles.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Load the ANN side of a collection for caching. Reads
    /// `collection_meta.json` for the vector size and the rebuild stamp.
    pub fn load_ann_index(&self, name: &str, max_elements: usize) -> Result<AnnIndex> {
        let path = self.collection_path(name);
        if !path.exists() {
            return Err(CidxError::MissingCollection(name.to_string()));
        }
        let meta = CollectionMeta::read(&path)?;
        let handle = self.handle(name, None)?;
        AnnIndex::load_index(
            meta.vector_size,
            handle.env.clone(),
            handle.vectors,
            meta.hnsw_index.index_rebuild_uuid,
            max_elements,
        )
    }

    /// Load the id → payload mapping for caching, capped at `max_elements`.
    pub fn load_id_mapping(&self, name: &str, max_elements: usize) -> Result<IdMapping> {
        let handle = self.handle(name, None)?;
        let rtxn = handle.env.read_txn()?;

        let mut mapping = HashMap::new();
        for entry in handle.points.iter(&rtxn)? {
            let (id, payload) = entry?;
            mapping.insert(id, payload);
            if mapping.len() >= max_elements {
                debug!("id mapping for {name} truncated at {max_elements} elements");
                break;
            }
        }
        Ok(mapping)
    }

    fn next_id(handle: &CollectionHandle) -> Result<u32> {
        let rtxn = handle.env.read_txn()?;
        Ok(handle
            .points
            .last(&rtxn)?
            .map(|(id, _)| id + 1)
            .unwrap_or(0))
    }
}

impl VectorBackend for DiskVectorStore {
    fn ensure_collection(&self, name: &str, vector_size: usize) -> Result<()> {
        self.handle(name, Some(vector_size)).map(|_| ())
    }

    fn clear_collection(&self, name: &str) -> Result<bool> {
        let handle = match self.handle(name, None) {
            Ok(h) => h,
            Err(CidxError::MissingCollection(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut wtxn = handle.env.write_txn()?;
        handle.points.clear(&mut wtxn)?;
        handle.vectors.clear(&mut wtxn)?;
        wtxn.commit()?;

        let path = self.collection_path(name);
        let mut meta = CollectionMeta::read(&path)?;
        meta.points_count = 0;
        meta.mark_rebuilt(&path)?;

        info!("cleared collection {name}");
        Ok(true)
    }

    fn delete_collection(&self, name: &str) -> Result<bool> {
        // Drop the cached env before removing the directory
        self.handles
            .lock()
            .expect("handle map poisoned")
            .remove(name);

        let path = self.collection_path(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&path).map_err(|e| CidxError::io(&path, e))?;
        info!("deleted collection {name}");
        Ok(true)
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        if !self.index_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in
            std::fs::read_dir(&self.index_dir).map_err(|e| CidxError::io(&self.index_dir, e))?
        {
            let entry = entry.map_err(|e| CidxError::io(&self.index_dir, e))?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<bool> {
        if points.is_empty() {
            return Ok(true);
        }

        let handle = self.handle(collection, None)?;
        let mut next_id = Self::next_id(&handle)?;

        let mut wtxn = handle.env.write_txn()?;
        let writer = Writer::new(handle.vectors, ARROY_INDEX, handle.vector_size);

        for point in points {
            if point.vector.len() != handle.vector_size {
                return Err(CidxError::storage(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    handle.vector_size,
                    point.vector.len()
                )));
            }
            writer.add_item(&mut wtxn, next_id, &point.vector)?;
            handle.points.put(&mut wtxn, &next_id, &point.payload)?;
            next_id += 1;
        }

        wtxn.commit()?;
        debug!("upserted {} points into {collection}", points.len());
        Ok(true)
    }

    fn build_collection(&self, collection: &str) -> Result<()> {
        let handle = self.handle(collection, None)?;

        let mut wtxn = handle.env.write_txn()?;
        let writer = Writer::new(handle.vectors, ARROY_INDEX, handle.vector_size);
        let mut rng = StdRng::seed_from_u64(rand::random());
        writer.builder(&mut rng).build(&mut wtxn)?;
        wtxn.commit()?;

        let path = self.collection_path(collection);
        let mut meta = CollectionMeta::read(&path)?;
        meta.points_count = self.count_points(collection)?;
        meta.mark_rebuilt(&path)?;

        info!(
            "rebuilt ANN index for {collection} ({} points)",
            meta.points_count
        );
        Ok(())
    }

    fn scroll_points(
        &self,
        collection: &str,
        limit: usize,
        offset: Option<u32>,
        with_payload: bool,
        with_vectors: bool,
    ) -> Result<(Vec<ScrolledPoint>, Option<u32>)> {
        let handle = self.handle(collection, None)?;
        let rtxn = handle.env.read_txn()?;

        let start = offset.unwrap_or(0);
        let mut page = Vec::with_capacity(limit.min(1024));
        let mut last_id = None;

        let reader = if with_vectors {
            Reader::open(&rtxn, ARROY_INDEX, handle.vectors).ok()
        } else {
            None
        };

        for entry in handle.points.range(&rtxn, &(start..))? {
            if page.len() >= limit {
                break;
            }
            let (id, payload) = entry?;
            let vector = reader
                .as_ref()
                .and_then(|r| r.item_vector(&rtxn, id).ok().flatten());
            page.push(ScrolledPoint {
                id,
                payload: with_payload.then_some(payload),
                vector,
            });
            last_id = Some(id);
        }

        let next_offset = if page.len() == limit {
            last_id.map(|id| id + 1)
        } else {
            None
        };
        Ok((page, next_offset))
    }

    fn count_points(&self, collection: &str) -> Result<u64> {
        let handle = self.handle(collection, None)?;
        let rtxn = handle.env.read_txn()?;
        Ok(handle.points.len(&rtxn)?)
    }

    fn collection_status(&self, collection: &str) -> Result<CollectionStatus> {
        let path = self.collection_path(collection);
        let meta = CollectionMeta::read(&path)?;
        Ok(CollectionStatus {
            name: collection.to_string(),
            points_count: self.count_points(collection)?,
            vector_size: meta.vector_size,
            index_rebuild_uuid: meta.hnsw_index.index_rebuild_uuid,
        })
    }
}

/// Quality knob applied to candidate exploration: higher `ef` explores more
/// of the tree forest before settling on the top results.
pub(crate) fn search_k_for(limit: usize, ef: usize) -> Option<NonZeroUsize> {
    NonZeroUsize::new(limit.max(1) * ef.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn payload(path: &str, mtime: f64) -> PointPayload {
        PointPayload {
            path: path.to_string(),
            content: format!("contents of {path}"),
            line_start: 1,
            line_end: 10,
            language: "rs".to_string(),
            indexed_at: "2025-06-01T10:00:00Z".to_string(),
            filesystem_mtime: Some(mtime),
            file_last_modified: Some(mtime),
            ..Default::default()
        }
    }

    fn point(path: &str, vector: Vec<f32>) -> Point {
        Point {
            vector,
            payload: payload(path, 1000.0),
        }
    }

    #[test]
    fn test_ensure_upsert_count() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));

        store.ensure_collection("main", 4).unwrap();
        assert!(store
            .upsert_points(
                "main",
                &[
                    point("a.rs", vec![1.0, 0.0, 0.0, 0.0]),
                    point("b.rs", vec![0.0, 1.0, 0.0, 0.0]),
                ]
            )
            .unwrap());

        assert_eq!(store.count_points("main").unwrap(), 2);
        assert_eq!(store.list_collections().unwrap(), vec!["main".to_string()]);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("main", 4).unwrap();

        let err = store
            .upsert_points("main", &[point("a.rs", vec![1.0, 0.0])])
            .unwrap_err();
        assert!(err.to_string().contains("dimension mismatch"));
    }

    #[test]
    fn test_scroll_pages_until_empty() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("main", 4).unwrap();

        let points: Vec<Point> = (0..25)
            .map(|i| point(&format!("file{i}.rs"), vec![i as f32, 0.0, 0.0, 1.0]))
            .collect();
        store.upsert_points("main", &points).unwrap();

        let mut seen = 0;
        let mut offset = None;
        loop {
            let (page, next) = store
                .scroll_points("main", 10, offset, true, false)
                .unwrap();
            seen += page.len();
            for p in &page {
                assert!(p.payload.is_some());
            }
            match next {
                Some(n) => offset = Some(n),
                None => break,
            }
        }
        assert_eq!(seen, 25);
    }

    #[test]
    fn test_build_changes_rebuild_stamp_and_enables_search() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("main", 4).unwrap();
        store
            .upsert_points(
                "main",
                &[
                    point("a.rs", vec![1.0, 0.0, 0.0, 0.0]),
                    point("b.rs", vec![0.0, 1.0, 0.0, 0.0]),
                ],
            )
            .unwrap();

        let before = CollectionMeta::rebuild_stamp(&store.collection_path("main")).unwrap();
        store.build_collection("main").unwrap();
        let after = CollectionMeta::rebuild_stamp(&store.collection_path("main")).unwrap();
        assert_ne!(before, after);

        let ann = store.load_ann_index("main", 100_000).unwrap();
        let hits = ann.search(&[1.0, 0.0, 0.0, 0.0], 1, 100).unwrap();
        assert_eq!(hits.len(), 1);

        let mapping = store.load_id_mapping("main", 100_000).unwrap();
        assert_eq!(mapping.get(&hits[0].0).unwrap().path, "a.rs");
    }

    #[test]
    fn test_clear_and_delete() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("main", 4).unwrap();
        store
            .upsert_points("main", &[point("a.rs", vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();

        assert!(store.clear_collection("main").unwrap());
        assert_eq!(store.count_points("main").unwrap(), 0);

        assert!(store.delete_collection("main").unwrap());
        assert!(store.list_collections().unwrap().is_empty());
        assert!(!store.delete_collection("main").unwrap());
    }
}
