//! Cache entry and TTL eviction for the daemon service.
//!
//! One [`CacheEntry`] per daemon holds the loaded semantic (HEAD), FTS, and
//! temporal indexes for a project, with access tracking for TTL eviction
//! and version stamps for rebuild detection. Readers share the entry's
//! `RwLock`; structural mutations additionally serialise on `write_lock`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info};

use crate::constants::MAX_CACHED_ELEMENTS;
use crate::error::Result;
use crate::fts::FtsStore;
use crate::storage::{AnnIndex, CollectionMeta, DiskVectorStore, IdMapping};

/// Loaded index slots. HEAD (workspace) and temporal caches are
/// independent: invalidating one never touches the other.
#[derive(Default)]
pub struct LoadedIndexes {
    // HEAD (workspace) indexes
    pub ann_index: Option<Arc<AnnIndex>>,
    pub id_mapping: Option<Arc<IdMapping>>,
    pub collection_name: Option<String>,
    pub vector_dim: Option<usize>,
    pub ann_index_version: Option<String>,

    // Full-text indexes
    pub fts_index: Option<Arc<FtsStore>>,
    pub fts_available: bool,

    // Temporal (git-history) indexes
    pub temporal_ann: Option<Arc<AnnIndex>>,
    pub temporal_id_mapping: Option<Arc<IdMapping>>,
    pub temporal_index_version: Option<String>,
}

pub struct CacheEntry {
    project_path: PathBuf,
    ttl: Duration,
    last_accessed: Mutex<Instant>,
    access_count: Mutex<u64>,
    /// Readers take the shared side; writers take the exclusive side
    pub indexes: RwLock<LoadedIndexes>,
    /// Serialises structural mutations; writers hold this and the
    /// exclusive side of `indexes`
    write_lock: Mutex<()>,
}

impl CacheEntry {
    pub fn new(project_path: PathBuf, ttl: Duration) -> Self {
        Self {
            project_path,
            ttl,
            last_accessed: Mutex::new(Instant::now()),
            access_count: Mutex::new(0),
            indexes: RwLock::new(LoadedIndexes::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    /// Record a read. Called on every query.
    pub fn update_access(&self) {
        *self.last_accessed.lock().expect("access lock poisoned") = Instant::now();
        *self.access_count.lock().expect("access lock poisoned") += 1;
    }

    pub fn is_expired(&self) -> bool {
        self.last_accessed
            .lock()
            .expect("access lock poisoned")
            .elapsed()
            >= self.ttl
    }

    pub fn access_count(&self) -> u64 {
        *self.access_count.lock().expect("access lock poisoned")
    }

    pub fn set_semantic_indexes(
        &self,
        ann_index: AnnIndex,
        id_mapping: IdMapping,
        collection_name: String,
    ) {
        let _write = self.write_lock.lock().expect("write lock poisoned");
        let mut indexes = self.indexes.write().expect("index lock poisoned");
        indexes.vector_dim = Some(ann_index.vector_dim());
        indexes.ann_index_version = Some(ann_index.rebuild_uuid().to_string());
        indexes.ann_index = Some(Arc::new(ann_index));
        indexes.id_mapping = Some(Arc::new(id_mapping));
        indexes.collection_name = Some(collection_name);
    }

    pub fn set_fts_indexes(&self, fts: FtsStore) {
        let _write = self.write_lock.lock().expect("write lock poisoned");
        let mut indexes = self.indexes.write().expect("index lock poisoned");
        indexes.fts_index = Some(Arc::new(fts));
        indexes.fts_available = true;
    }

    /// Clear HEAD and FTS fields; access tracking survives. The temporal
    /// cache is left alone.
    pub fn invalidate(&self) {
        let _write = self.write_lock.lock().expect("write lock poisoned");
        let mut indexes = self.indexes.write().expect("index lock poisoned");
        indexes.ann_index = None;
        indexes.id_mapping = None;
        indexes.collection_name = None;
        indexes.vector_dim = None;
        indexes.ann_index_version = None;
        indexes.fts_index = None;
        indexes.fts_available = false;
        debug!("cache entry invalidated for {}", self.project_path.display());
    }

    /// Clear only the temporal fields.
    pub fn invalidate_temporal(&self) {
        let _write = self.write_lock.lock().expect("write lock poisoned");
        let mut indexes = self.indexes.write().expect("index lock poisoned");
        indexes.temporal_ann = None;
        indexes.temporal_id_mapping = None;
        indexes.temporal_index_version = None;
        debug!("temporal cache invalidated for {}", self.project_path.display());
    }

    /// Load the temporal collection into the cache. Idempotent: a second
    /// call with a populated cache is a no-op.
    pub fn load_temporal_indexes(
        &self,
        store: &DiskVectorStore,
        temporal_collection: &str,
    ) -> Result<()> {
        {
            let indexes = self.indexes.read().expect("index lock poisoned");
            if indexes.temporal_ann.is_some() {
                return Ok(());
            }
        }

        let ann = store.load_ann_index(temporal_collection, MAX_CACHED_ELEMENTS)?;
        let mapping = store.load_id_mapping(temporal_collection, MAX_CACHED_ELEMENTS)?;

        let _write = self.write_lock.lock().expect("write lock poisoned");
        let mut indexes = self.indexes.write().expect("index lock poisoned");
        indexes.temporal_index_version = Some(ann.rebuild_uuid().to_string());
        indexes.temporal_ann = Some(Arc::new(ann));
        indexes.temporal_id_mapping = Some(Arc::new(mapping));
        Ok(())
    }

    /// True when the on-disk rebuild stamp differs from the one cached at
    /// load time (an out-of-band rebuild happened).
    pub fn is_stale_after_rebuild(&self, collection_path: &Path) -> bool {
        let cached = {
            let indexes = self.indexes.read().expect("index lock poisoned");
            indexes.ann_index_version.clone()
        };
        match cached {
            Some(cached) => CollectionMeta::rebuild_stamp(collection_path)
                .map(|disk| disk != cached)
                .unwrap_or(true),
            // Nothing cached means nothing can be stale
            None => false,
        }
    }

    /// Same contract as [`is_stale_after_rebuild`](Self::is_stale_after_rebuild)
    /// against the temporal collection path.
    pub fn is_temporal_stale_after_rebuild(&self, collection_path: &Path) -> bool {
        let cached = {
            let indexes = self.indexes.read().expect("index lock poisoned");
            indexes.temporal_index_version.clone()
        };
        match cached {
            Some(cached) => CollectionMeta::rebuild_stamp(collection_path)
                .map(|disk| disk != cached)
                .unwrap_or(true),
            None => false,
        }
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let indexes = self.indexes.read().expect("index lock poisoned");
        json!({
            "project_path": self.project_path.display().to_string(),
            "access_count": self.access_count(),
            "ttl_seconds": self.ttl.as_secs(),
            "semantic_loaded": indexes.ann_index.is_some(),
            "fts_loaded": indexes.fts_available,
            "temporal_loaded": indexes.temporal_ann.is_some(),
            "collection_name": indexes.collection_name,
            "vector_dim": indexes.vector_dim,
            "expired": self.is_expired(),
        })
    }
}

/// Handle for the TTL eviction loop.
pub struct EvictionHandle {
    running: Arc<std::sync::atomic::AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EvictionHandle {
    pub fn stop(&mut self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        // The loop wakes at most check_interval later; it is a daemon
        // thread, so no join on shutdown
        self.thread.take();
    }
}

/// Start the TTL eviction loop.
///
/// Every `check_interval` the loop takes the daemon cache mutex and drops
/// the entry if it expired. Eviction can never tear a query: queries hold
/// the same mutex for their full duration. With `auto_shutdown_on_idle`
/// set, an eviction that empties the cache terminates the process.
pub fn start_eviction_loop(
    cache: Weak<Mutex<Option<Arc<CacheEntry>>>>,
    check_interval: Duration,
    auto_shutdown_on_idle: bool,
) -> EvictionHandle {
    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let running_flag = Arc::clone(&running);

    let thread = std::thread::Builder::new()
        .name("ttl-eviction".to_string())
        .spawn(move || loop {
            std::thread::sleep(check_interval);
            if !running_flag.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            let Some(cache) = cache.upgrade() else {
                return;
            };

            let mut guard = cache.lock().expect("cache lock poisoned");
            let expired = guard.as_ref().map(|e| e.is_expired()).unwrap_or(false);
            if expired {
                info!("cache expired, evicting");
                *guard = None;

                if auto_shutdown_on_idle {
                    info!("auto-shutdown on idle");
                    std::process::exit(0);
                }
            }
        })
        .expect("failed to spawn eviction thread");

    EvictionHandle {
        running,
        thread: Some(thread),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Point, PointPayload, VectorBackend};
    use tempfile::tempdir;

    fn entry(ttl_ms: u64) -> CacheEntry {
        CacheEntry::new(PathBuf::from("/proj"), Duration::from_millis(ttl_ms))
    }

    fn seeded_store(dir: &Path) -> DiskVectorStore {
        let store = DiskVectorStore::new(dir.join("index"));
        store.ensure_collection("main", 4).unwrap();
        store
            .upsert_points(
                "main",
                &[Point {
                    vector: vec![1.0, 0.0, 0.0, 0.0],
                    payload: PointPayload {
                        path: "a.rs".into(),
                        indexed_at: "2025-06-01T10:00:00Z".into(),
                        ..Default::default()
                    },
                }],
            )
            .unwrap();
        store.build_collection("main").unwrap();
        store
    }

    #[test]
    fn test_expiry_and_access_tracking() {
        let entry = entry(50);
        assert!(!entry.is_expired());

        std::thread::sleep(Duration::from_millis(70));
        assert!(entry.is_expired());

        entry.update_access();
        assert!(!entry.is_expired());
        assert_eq!(entry.access_count(), 1);
    }

    #[test]
    fn test_invalidate_preserves_access_tracking() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path());
        let entry = entry(60_000);

        let ann = store.load_ann_index("main", 1000).unwrap();
        let mapping = store.load_id_mapping("main", 1000).unwrap();
        entry.set_semantic_indexes(ann, mapping, "main".to_string());
        entry.update_access();
        entry.update_access();

        entry.invalidate();

        let indexes = entry.indexes.read().unwrap();
        assert!(indexes.ann_index.is_none());
        assert!(indexes.collection_name.is_none());
        assert!(!indexes.fts_available);
        drop(indexes);
        assert_eq!(entry.access_count(), 2);
    }

    #[test]
    fn test_fts_invariant() {
        let dir = tempdir().unwrap();
        let entry = entry(60_000);
        {
            let indexes = entry.indexes.read().unwrap();
            assert!(!indexes.fts_available);
            assert!(indexes.fts_index.is_none());
        }

        let fts = FtsStore::open(&dir.path().join("tantivy_index")).unwrap();
        entry.set_fts_indexes(fts);
        {
            let indexes = entry.indexes.read().unwrap();
            assert!(indexes.fts_available);
            assert!(indexes.fts_index.is_some());
        }

        entry.invalidate();
        let indexes = entry.indexes.read().unwrap();
        assert!(!indexes.fts_available);
        assert!(indexes.fts_index.is_none());
    }

    #[test]
    fn test_stale_after_rebuild() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path());
        let entry = entry(60_000);

        let ann = store.load_ann_index("main", 1000).unwrap();
        let mapping = store.load_id_mapping("main", 1000).unwrap();
        entry.set_semantic_indexes(ann, mapping, "main".to_string());

        let collection_path = store.collection_path("main");
        assert!(!entry.is_stale_after_rebuild(&collection_path));

        // Out-of-band rebuild changes the stamp
        store.build_collection("main").unwrap();
        assert!(entry.is_stale_after_rebuild(&collection_path));
    }

    #[test]
    fn test_temporal_cache_is_independent() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        for name in ["head", "code-indexer-temporal"] {
            store.ensure_collection(name, 4).unwrap();
            store
                .upsert_points(
                    name,
                    &[Point {
                        vector: vec![1.0, 0.0, 0.0, 0.0],
                        payload: PointPayload::default(),
                    }],
                )
                .unwrap();
            store.build_collection(name).unwrap();
        }

        let entry = entry(60_000);
        let ann = store.load_ann_index("head", 1000).unwrap();
        let mapping = store.load_id_mapping("head", 1000).unwrap();
        entry.set_semantic_indexes(ann, mapping, "head".to_string());

        entry
            .load_temporal_indexes(&store, "code-indexer-temporal")
            .unwrap();
        // Idempotent second load
        entry
            .load_temporal_indexes(&store, "code-indexer-temporal")
            .unwrap();

        // HEAD invalidation leaves temporal loaded
        entry.invalidate();
        {
            let indexes = entry.indexes.read().unwrap();
            assert!(indexes.temporal_ann.is_some());
            assert!(indexes.ann_index.is_none());
        }

        // Temporal invalidation leaves nothing temporal
        entry.invalidate_temporal();
        let indexes = entry.indexes.read().unwrap();
        assert!(indexes.temporal_ann.is_none());
        assert!(indexes.temporal_index_version.is_none());
    }

    #[test]
    fn test_temporal_staleness_independent_stamp() {
        let dir = tempdir().unwrap();
        let store = seeded_store(dir.path());
        store.ensure_collection("code-indexer-temporal", 4).unwrap();
        store
            .upsert_points(
                "code-indexer-temporal",
                &[Point {
                    vector: vec![0.0, 1.0, 0.0, 0.0],
                    payload: PointPayload::default(),
                }],
            )
            .unwrap();
        store.build_collection("code-indexer-temporal").unwrap();

        let entry = entry(60_000);
        entry
            .load_temporal_indexes(&store, "code-indexer-temporal")
            .unwrap();

        let temporal_path = store.collection_path("code-indexer-temporal");
        assert!(!entry.is_temporal_stale_after_rebuild(&temporal_path));

        store.build_collection("code-indexer-temporal").unwrap();
        assert!(entry.is_temporal_stale_after_rebuild(&temporal_path));

        // HEAD stamp is untouched by temporal rebuilds
        assert!(!entry.is_stale_after_rebuild(&store.collection_path("main")));
    }

    #[test]
    fn test_eviction_loop_drops_expired_entry() {
        let cache: Arc<Mutex<Option<Arc<CacheEntry>>>> = Arc::new(Mutex::new(Some(Arc::new(
            CacheEntry::new(PathBuf::from("/proj"), Duration::from_millis(10)),
        ))));

        let mut handle =
            start_eviction_loop(Arc::downgrade(&cache), Duration::from_millis(30), false);

        std::thread::sleep(Duration::from_millis(120));
        assert!(cache.lock().unwrap().is_none());
        handle.stop();
    }
}
