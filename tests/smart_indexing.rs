//! End-to-end indexing behaviour: strategy selection, resumability,
//! reconciliation, and failure containment.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;

use cidx_daemon::embed::EmbeddingProvider;
use cidx_daemon::error::{CidxError, Result};
use cidx_daemon::indexer::metadata::IndexingStatus;
use cidx_daemon::indexer::{IndexOptions, NullProgress, SmartIndexer};
use cidx_daemon::storage::{
    CollectionStatus, DiskVectorStore, Point, ScrolledPoint, VectorBackend,
};

use common::{CollectingProgress, StubProvider, TestProject};

fn indexer_with_store(project: &TestProject) -> (SmartIndexer, Arc<DiskVectorStore>) {
    let store = Arc::new(DiskVectorStore::new(project.config_dir().join("index")));
    let backend: Arc<dyn VectorBackend> = Arc::clone(&store) as Arc<dyn VectorBackend>;
    let indexer = SmartIndexer::new(
        &project.config(),
        &project.config_dir(),
        Arc::new(StubProvider::new()),
        backend,
    );
    (indexer, store)
}

fn indexer_for(project: &TestProject) -> SmartIndexer {
    indexer_with_store(project).0
}

fn scroll_paths(store: &dyn VectorBackend, collection: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut offset = None;
    loop {
        let (page, next) = store
            .scroll_points(collection, 100, offset, true, false)
            .unwrap();
        paths.extend(page.into_iter().filter_map(|p| p.payload.map(|pl| pl.path)));
        match next {
            Some(n) => offset = Some(n),
            None => break,
        }
    }
    paths
}

#[test]
fn test_full_then_incremental() {
    let project = TestProject::new().with_sample_files();
    let mut indexer = indexer_for(&project);

    let stats = indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap();
    assert_eq!(stats.files_processed, 3);
    assert!(stats.chunks_created >= 3);
    assert!(!stats.cancelled);
    assert_eq!(
        indexer.progressive_metadata().data().status,
        IndexingStatus::Completed
    );

    // Nothing changed: with no safety buffer the incremental pass finds
    // no files newer than the completion timestamp
    let options = IndexOptions {
        safety_buffer: Duration::ZERO,
        ..Default::default()
    };
    let stats = indexer.smart_index(&options, &NullProgress).unwrap();
    assert_eq!(stats.files_processed, 0);

    // A touched file is newer than the resume timestamp and gets picked up
    std::thread::sleep(Duration::from_millis(1100));
    project.write_file("src/auth.rs", "fn authenticate_v2() {}\n");
    let stats = indexer.smart_index(&options, &NullProgress).unwrap();
    assert!(stats.files_processed >= 1);
    assert!(stats.files_processed < 3);
}

#[test]
fn test_provider_change_forces_full() {
    let project = TestProject::new().with_sample_files();

    {
        let mut indexer = indexer_for(&project);
        indexer
            .smart_index(&IndexOptions::default(), &NullProgress)
            .unwrap();
    }

    // Same project, different model fingerprint
    let store: Arc<dyn VectorBackend> = Arc::new(DiskVectorStore::new(
        project.config_dir().join("index"),
    ));
    struct OtherModel(StubProvider);
    impl cidx_daemon::embed::EmbeddingProvider for OtherModel {
        fn provider_name(&self) -> &str {
            self.0.provider_name()
        }
        fn current_model(&self) -> String {
            "stub-code-2".to_string()
        }
        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }
        fn supports_batch(&self) -> bool {
            true
        }
        fn health_check(&self, test_api: bool) -> Result<bool> {
            self.0.health_check(test_api)
        }
        fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
            self.0.get_embedding(text)
        }
        fn get_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.get_embeddings_batch(texts)
        }
    }

    let mut indexer = SmartIndexer::new(
        &project.config(),
        &project.config_dir(),
        Arc::new(OtherModel(StubProvider::new())),
        store,
    );

    let progress = CollectingProgress::new();
    let stats = indexer.smart_index(&IndexOptions::default(), &progress).unwrap();

    // All files re-indexed, with the configuration-change notice surfaced
    assert_eq!(stats.files_processed, 3);
    assert!(progress
        .infos()
        .iter()
        .any(|info| info.contains("configuration changed")));
}

#[test]
fn test_interrupt_and_resume_covers_every_file_once() {
    let project = TestProject::new();
    for i in 0..6 {
        project.write_file(
            &format!("src/module_{i}.rs"),
            &format!("fn module_{i}() {{ compute({i}); }}\n"),
        );
    }

    let (mut indexer, store) = indexer_with_store(&project);
    let collection = indexer.collection_name();

    // Interrupt after three files
    let progress = CollectingProgress::interrupting_after(3);
    let stats = indexer.smart_index(&IndexOptions::default(), &progress).unwrap();
    assert!(stats.cancelled);
    assert_eq!(stats.files_processed, 3);
    assert_eq!(
        indexer.progressive_metadata().data().status,
        IndexingStatus::InProgress
    );
    assert!(indexer.progressive_metadata().can_resume_interrupted());

    // Restart: the run resumes and completes
    let stats = indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap();
    assert!(!stats.cancelled);
    assert_eq!(stats.files_processed, 3);

    let meta = indexer.progressive_metadata().data();
    assert_eq!(meta.status, IndexingStatus::Completed);

    // completed ∪ failed covers the whole work list, nothing twice
    let mut covered: Vec<String> = meta
        .completed_files
        .iter()
        .chain(meta.failed_file_paths.iter())
        .cloned()
        .collect();
    covered.sort();
    let mut expected = meta.files_to_index.clone();
    expected.sort();
    assert_eq!(covered, expected);
    assert_eq!(meta.files_processed, 6);

    // The store holds each file's chunks exactly once
    let mut paths = scroll_paths(store.as_ref(), &collection);
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 6);
}

#[test]
fn test_reconcile_reindexes_exactly_the_drifted_files() {
    let project = TestProject::new();
    for i in 0..5 {
        project.write_file(
            &format!("src/file_{i}.rs"),
            &format!("fn file_{i}() {{}}\n"),
        );
    }

    let mut indexer = indexer_for(&project);
    indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap();

    // Drift: one brand-new file, one file touched well past the tolerance
    std::thread::sleep(Duration::from_millis(30));
    project.write_file("src/new_file.rs", "fn newcomer() {}\n");
    let touched = project.root().join("src/file_2.rs");
    let future = filetime_now_plus(10);
    set_mtime(&touched, future);

    let progress = CollectingProgress::new();
    let options = IndexOptions {
        reconcile_with_database: true,
        ..Default::default()
    };
    let stats = indexer.smart_index(&options, &progress).unwrap();

    assert_eq!(stats.files_processed, 2);
    assert!(progress
        .infos()
        .iter()
        .any(|info| info.contains("1 missing + 1 modified")));

    // A second reconcile finds nothing to do
    let progress = CollectingProgress::new();
    let stats = indexer.smart_index(&options, &progress).unwrap();
    assert_eq!(stats.files_processed, 0);
    assert!(progress
        .infos()
        .iter()
        .any(|info| info.contains("all files up-to-date")));
}

fn filetime_now_plus(seconds: u64) -> std::time::SystemTime {
    std::time::SystemTime::now() + Duration::from_secs(seconds)
}

fn set_mtime(path: &std::path::Path, to: std::time::SystemTime) {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_times(
        std::fs::FileTimes::new().set_modified(to),
    )
    .unwrap();
}

/// Backend stub that records upserts and can reject flushes.
#[derive(Default)]
struct RecordingBackend {
    upserted: Mutex<Vec<Point>>,
    reject_upserts: AtomicBool,
}

impl VectorBackend for RecordingBackend {
    fn ensure_collection(&self, _name: &str, _vector_size: usize) -> Result<()> {
        Ok(())
    }
    fn clear_collection(&self, _name: &str) -> Result<bool> {
        self.upserted.lock().unwrap().clear();
        Ok(true)
    }
    fn delete_collection(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }
    fn list_collections(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }
    fn upsert_points(&self, _collection: &str, points: &[Point]) -> Result<bool> {
        if self.reject_upserts.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.upserted.lock().unwrap().extend_from_slice(points);
        Ok(true)
    }
    fn build_collection(&self, _collection: &str) -> Result<()> {
        Ok(())
    }
    fn scroll_points(
        &self,
        _collection: &str,
        _limit: usize,
        _offset: Option<u32>,
        _with_payload: bool,
        _with_vectors: bool,
    ) -> Result<(Vec<ScrolledPoint>, Option<u32>)> {
        Ok((vec![], None))
    }
    fn count_points(&self, _collection: &str) -> Result<u64> {
        Ok(self.upserted.lock().unwrap().len() as u64)
    }
    fn collection_status(&self, collection: &str) -> Result<CollectionStatus> {
        Ok(CollectionStatus {
            name: collection.to_string(),
            points_count: self.count_points(collection)?,
            vector_size: common::STUB_DIMS,
            index_rebuild_uuid: "static".to_string(),
        })
    }
}

#[test]
fn test_partial_embedding_response_aborts_without_upserting() {
    let project = TestProject::new();
    project.write_file("src/lib.rs", "fn lib() {}\n");

    let backend = Arc::new(RecordingBackend::default());
    let store: Arc<dyn VectorBackend> = backend.clone();
    let mut indexer = SmartIndexer::new(
        &project.config(),
        &project.config_dir(),
        Arc::new(StubProvider::partial(1)),
        store,
    );

    let err = indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap_err();
    assert!(matches!(err, CidxError::PartialEmbeddingResponse { .. }));

    // The run failed before any flush reached the store
    assert!(backend.upserted.lock().unwrap().is_empty());
    assert_eq!(
        indexer.progressive_metadata().data().status,
        IndexingStatus::Failed
    );
}

#[test]
fn test_upsert_failure_is_fatal_and_recorded() {
    let project = TestProject::new();
    project.write_file("src/lib.rs", "fn lib() {}\n");

    let backend = Arc::new(RecordingBackend::default());
    backend.reject_upserts.store(true, Ordering::SeqCst);
    let store: Arc<dyn VectorBackend> = backend.clone();
    let mut indexer = SmartIndexer::new(
        &project.config(),
        &project.config_dir(),
        Arc::new(StubProvider::new()),
        store,
    );

    let err = indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap_err();
    assert!(matches!(err, CidxError::BackendUpsertFailed(_)));
    assert_eq!(
        indexer.progressive_metadata().data().status,
        IndexingStatus::Failed
    );
}

#[test]
fn test_unreadable_file_is_recorded_and_skipped() {
    let project = TestProject::new();
    project.write_file("src/good.rs", "fn good() {}\n");
    // Invalid UTF-8 makes the read fail without aborting the run
    let bad = project.root().join("src/bad.rs");
    std::fs::write(&bad, [0xff, 0xfe, 0x00, 0x01]).unwrap();

    let mut indexer = indexer_for(&project);
    let stats = indexer
        .smart_index(&IndexOptions::default(), &NullProgress)
        .unwrap();

    assert_eq!(stats.files_processed, 1);
    assert_eq!(stats.failed_files, 1);
    let meta = indexer.progressive_metadata().data();
    assert_eq!(meta.status, IndexingStatus::Completed);
    assert_eq!(meta.failed_file_paths, vec!["src/bad.rs".to_string()]);
}
