//! Smart incremental indexer.
//!
//! One entry point, [`SmartIndexer::smart_index`], chooses between four
//! strategies: full, incremental (resume timestamp minus a safety buffer),
//! reconcile against the persisted collection, and resuming an interrupted
//! run from progressive metadata. All strategies share one processing loop
//! with batched upserts, per-file progress marks, throughput-composed
//! progress text, and cooperative interruption.

pub mod chunker;
pub mod files;
pub mod metadata;
pub mod pool;
pub mod throughput;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_COLLECTION_BASE, DEFAULT_SAFETY_BUFFER_SECS, METADATA_FILE_NAME,
    SCROLL_PAGE_SIZE,
};
use crate::embed::EmbeddingProvider;
use crate::error::{CidxError, Result};
use crate::fts::FtsStore;
use crate::git::GitTopologyService;
use crate::query::staleness::format_indexed_at;
use crate::storage::collections::{project_id, provider_aware_collection_name};
use crate::storage::{Point, PointPayload, VectorBackend};

use chunker::{chunk_content, language_from_extension};
use files::{file_mtime, FileFinder};
use metadata::{IndexingStatus, ProgressiveMetadata};
use pool::{EmbeddingPool, PendingEmbedding};
use throughput::{compose_info, ThroughputMonitor, ThroughputStats};

pub use metadata::MetadataFile;

/// What the progress callback wants the indexer to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    /// Stop gracefully: flush the partial batch and leave the run resumable
    Interrupt,
}

/// Capability object handed to the indexer for progress reporting.
pub trait ProgressReporter: Send + Sync {
    fn on_progress(
        &self,
        current: usize,
        total: usize,
        file_path: &Path,
        info: &str,
    ) -> ProgressControl;

    fn on_file_error(
        &self,
        current: usize,
        total: usize,
        file_path: &Path,
        error: &str,
    ) -> ProgressControl {
        self.on_progress(current, total, file_path, &format!("error: {error}"))
    }

    /// Phase transitions may reset client-side timers
    fn on_reset_timers(&self) {}
}

/// Reporter that swallows everything.
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn on_progress(&self, _: usize, _: usize, _: &Path, _: &str) -> ProgressControl {
        ProgressControl::Continue
    }
}

/// Options for one indexing run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub force_full: bool,
    pub reconcile_with_database: bool,
    pub batch_size: usize,
    pub safety_buffer: Duration,
    pub enable_fts: bool,
    /// Truncate the work list (testing hook carried by the RPC surface)
    pub files_count_to_process: Option<usize>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            force_full: false,
            reconcile_with_database: false,
            batch_size: DEFAULT_BATCH_SIZE,
            safety_buffer: Duration::from_secs(DEFAULT_SAFETY_BUFFER_SECS),
            enable_fts: false,
            files_count_to_process: None,
        }
    }
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub files_processed: u64,
    pub chunks_created: u64,
    pub failed_files: u64,
    pub duration_seconds: f64,
    pub cancelled: bool,
}

pub struct SmartIndexer {
    project_root: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorBackend>,
    topology: GitTopologyService,
    metadata: ProgressiveMetadata,
    finder: FileFinder,
    fts_dir: PathBuf,
    worker_count: usize,
}

impl SmartIndexer {
    pub fn new(
        config: &DaemonConfig,
        config_dir: &Path,
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorBackend>,
    ) -> Self {
        let project_root = config.resolve_codebase_dir(config_dir);
        let metadata = ProgressiveMetadata::load(config_dir.join(METADATA_FILE_NAME));
        let finder = FileFinder::new(&project_root, &config.indexing);
        let topology = GitTopologyService::new(&project_root);

        Self {
            project_root,
            provider,
            store,
            topology,
            metadata,
            finder,
            fts_dir: crate::fts::fts_dir(config_dir),
            worker_count: config.embedding.parallel_requests,
        }
    }

    pub fn progressive_metadata(&self) -> &ProgressiveMetadata {
        &self.metadata
    }

    pub fn progressive_metadata_mut(&mut self) -> &mut ProgressiveMetadata {
        &mut self.metadata
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Whether a path would be picked up by discovery (watch handler hook).
    pub fn is_indexable(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.project_root).unwrap_or(path);
        self.finder.is_indexable(relative)
    }

    /// Provider-aware collection this indexer writes to.
    pub fn collection_name(&self) -> String {
        provider_aware_collection_name(
            DEFAULT_COLLECTION_BASE,
            self.provider.provider_name(),
            &self.provider.current_model(),
            Some(&project_id(&self.project_root)),
        )
    }

    /// Choose and run an indexing strategy. Failures other than cooperative
    /// interruption are recorded in progressive metadata before returning.
    pub fn smart_index(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingStats> {
        let result = self.smart_index_inner(options, progress);
        if let Err(err) = &result {
            if !matches!(err, CidxError::CallbackInterrupt) {
                let _ = self.metadata.fail_indexing(Some(&err.to_string()));
            }
        }
        result
    }

    fn smart_index_inner(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingStats> {
        let git_state = self.topology.get_current_state();
        let provider_name = self.provider.provider_name().to_string();
        let model_name = self.provider.current_model();

        if options.reconcile_with_database {
            return self.do_reconcile(options, progress, &git_state, &provider_name, &model_name);
        }

        if options.force_full {
            return self.do_full(options, progress, &git_state, &provider_name, &model_name);
        }

        if self
            .metadata
            .should_force_full_index(&provider_name, &model_name, &git_state)
        {
            progress.on_progress(
                0,
                0,
                Path::new(""),
                "configuration changed, performing full index",
            );
            return self.do_full(options, progress, &git_state, &provider_name, &model_name);
        }

        if self.metadata.can_resume_interrupted() {
            return self.do_resume(options, progress);
        }

        self.do_incremental(options, progress, &git_state, &provider_name, &model_name)
    }

    fn do_full(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
        git_state: &crate::git::GitState,
        provider_name: &str,
        model_name: &str,
    ) -> Result<ProcessingStats> {
        let collection = self.collection_name();
        info!("full index into collection {collection}");

        self.store
            .ensure_collection(&collection, self.provider.dimensions())?;
        self.store.clear_collection(&collection)?;
        self.metadata.clear()?;
        self.metadata
            .start_indexing(provider_name, model_name, git_state)?;

        let files = self.finder.find_files();
        if files.is_empty() {
            self.metadata.complete_indexing()?;
            return Err(CidxError::IndexingFailure(
                "no files found to index".to_string(),
            ));
        }

        self.metadata.set_files_to_index(&files)?;
        let stats = self.process_files(&files, options, progress)?;
        if !stats.cancelled {
            self.metadata.complete_indexing()?;
        }
        Ok(stats)
    }

    fn do_incremental(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
        git_state: &crate::git::GitState,
        provider_name: &str,
        model_name: &str,
    ) -> Result<ProcessingStats> {
        let resume_timestamp = self.metadata.get_resume_timestamp(options.safety_buffer);
        if resume_timestamp == 0.0 {
            progress.on_progress(
                0,
                0,
                Path::new(""),
                "no previous index found, performing full index",
            );
            return self.do_full(options, progress, git_state, provider_name, model_name);
        }

        let collection = self.collection_name();
        self.store
            .ensure_collection(&collection, self.provider.dimensions())?;

        if self.metadata.data().status != IndexingStatus::InProgress {
            self.metadata
                .start_indexing(provider_name, model_name, git_state)?;
        }

        let files = self.finder.find_modified_files(resume_timestamp);
        if files.is_empty() {
            self.metadata.complete_indexing()?;
            return Ok(ProcessingStats::default());
        }

        let since = DateTime::<Utc>::from_timestamp(resume_timestamp as i64, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| format!("{resume_timestamp:.0}"));
        progress.on_progress(
            0,
            0,
            Path::new(""),
            &format!(
                "incremental update: {} files modified since {since}",
                files.len()
            ),
        );

        self.metadata.set_files_to_index(&files)?;
        let stats = self.process_files(&files, options, progress)?;
        if !stats.cancelled {
            self.metadata.complete_indexing()?;
        }
        Ok(stats)
    }

    fn do_reconcile(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
        git_state: &crate::git::GitState,
        provider_name: &str,
        model_name: &str,
    ) -> Result<ProcessingStats> {
        let collection = self.collection_name();
        self.store
            .ensure_collection(&collection, self.provider.dimensions())?;

        let all_files = self.finder.find_files();
        if all_files.is_empty() {
            progress.on_progress(0, 0, Path::new(""), "no files found to index");
            return Ok(ProcessingStats::default());
        }

        progress.on_progress(
            0,
            0,
            Path::new(""),
            &format!("checking database collection '{collection}' for indexed files"),
        );

        let indexed = match self.scroll_indexed_timestamps(&collection) {
            Ok(map) => map,
            Err(err) => {
                warn!("database scroll failed during reconcile: {err}");
                progress.on_progress(
                    0,
                    0,
                    Path::new(""),
                    &format!("database query failed ({err}), treating all files as missing"),
                );
                HashMap::new()
            }
        };

        // Compare in enumeration order so the re-index set stays stable
        let mut files_to_index = Vec::new();
        let mut missing_files = 0usize;
        let mut modified_files = 0usize;

        for file_path in &all_files {
            let Some(disk_mtime) = file_mtime(file_path) else {
                // Vanished between discovery and comparison
                continue;
            };
            let key = self.relative_path(file_path);
            match indexed.get(&key) {
                None => {
                    files_to_index.push(file_path.clone());
                    missing_files += 1;
                }
                Some(&db_timestamp)
                    if disk_mtime
                        > db_timestamp + crate::constants::RECONCILE_MTIME_TOLERANCE_SECS =>
                {
                    files_to_index.push(file_path.clone());
                    modified_files += 1;
                }
                Some(_) => {}
            }
        }

        if files_to_index.is_empty() {
            progress.on_progress(
                0,
                0,
                Path::new(""),
                "all files up-to-date, no reconciliation needed",
            );
            return Ok(ProcessingStats::default());
        }

        if let Some(limit) = options.files_count_to_process {
            files_to_index.truncate(limit);
        }

        let up_to_date = all_files.len() - missing_files - modified_files;
        progress.on_progress(
            0,
            0,
            Path::new(""),
            &format!(
                "reconcile: {up_to_date}/{} files up-to-date, indexing {missing_files} missing + {modified_files} modified",
                all_files.len()
            ),
        );

        if self.metadata.data().status != IndexingStatus::InProgress {
            self.metadata
                .start_indexing(provider_name, model_name, git_state)?;
        }
        self.metadata.set_files_to_index(&files_to_index)?;

        let stats = self.process_files(&files_to_index, options, progress)?;
        if !stats.cancelled {
            self.metadata.complete_indexing()?;
        }
        Ok(stats)
    }

    fn do_resume(
        &mut self,
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingStats> {
        let collection = self.collection_name();
        self.store
            .ensure_collection(&collection, self.provider.dimensions())?;

        let remaining: Vec<PathBuf> = self
            .metadata
            .get_remaining_files()
            .into_iter()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .collect();

        if remaining.is_empty() {
            self.metadata.complete_indexing()?;
            return Ok(ProcessingStats::default());
        }

        let completed = self.metadata.data().files_processed;
        let total = self.metadata.data().total_files_to_index;
        progress.on_progress(
            0,
            0,
            Path::new(""),
            &format!(
                "resuming interrupted operation: {completed}/{total} files completed, {} remaining",
                remaining.len()
            ),
        );

        let stats = self.process_files(&remaining, options, progress)?;
        if !stats.cancelled {
            self.metadata.complete_indexing()?;
        }
        Ok(stats)
    }

    /// Index an explicit file set (watch-driven incremental cycles).
    pub fn index_files(
        &mut self,
        files: &[PathBuf],
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingStats> {
        if files.is_empty() {
            return Ok(ProcessingStats::default());
        }

        let git_state = self.topology.get_current_state();
        let collection = self.collection_name();
        self.store
            .ensure_collection(&collection, self.provider.dimensions())?;

        if self.metadata.data().status != IndexingStatus::InProgress {
            let provider_name = self.provider.provider_name().to_string();
            let model_name = self.provider.current_model();
            self.metadata
                .start_indexing(&provider_name, &model_name, &git_state)?;
        }
        self.metadata.set_files_to_index(files)?;

        let stats = self.process_files(files, &IndexOptions::default(), progress)?;
        if !stats.cancelled {
            self.metadata.complete_indexing()?;
        }
        Ok(stats)
    }

    /// Page through every persisted point collecting path → newest
    /// timestamp. Git-indexed points without a filesystem mtime fall back
    /// to the `indexed_at` string.
    fn scroll_indexed_timestamps(&self, collection: &str) -> Result<HashMap<String, f64>> {
        let mut map: HashMap<String, f64> = HashMap::new();
        let mut offset = None;

        loop {
            let (page, next_offset) =
                self.store
                    .scroll_points(collection, SCROLL_PAGE_SIZE, offset, true, false)?;
            if page.is_empty() {
                break;
            }

            for point in page {
                let Some(payload) = point.payload else {
                    continue;
                };
                let timestamp = payload
                    .filesystem_mtime
                    .or_else(|| parse_indexed_at(&payload.indexed_at))
                    .unwrap_or(0.0);

                map.entry(payload.path)
                    .and_modify(|existing| {
                        if timestamp > *existing {
                            *existing = timestamp;
                        }
                    })
                    .or_insert(timestamp);
            }

            match next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        Ok(map)
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// The shared processing loop: chunk, embed through the pool, batch
    /// upserts, mark per-file progress, report throughput, honour
    /// interruption.
    fn process_files(
        &mut self,
        files: &[PathBuf],
        options: &IndexOptions,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingStats> {
        let started = Instant::now();
        let collection = self.collection_name();

        let mut stats = ProcessingStats::default();
        let mut batch_points: Vec<Point> = Vec::with_capacity(options.batch_size);
        let mut monitor = ThroughputMonitor::new();
        let mut cached_stats = ThroughputStats::default();

        let pool = EmbeddingPool::start(Arc::clone(&self.provider), self.worker_count);
        let fts = if options.enable_fts {
            Some(FtsStore::open(&self.fts_dir)?)
        } else {
            None
        };

        progress.on_reset_timers();

        for (i, file_path) in files.iter().enumerate() {
            match self.process_one_file(file_path, &pool, fts.as_ref()) {
                Ok(points) => {
                    let chunks = points.len() as u64;
                    stats.files_processed += 1;
                    stats.chunks_created += chunks;
                    monitor.record_file(chunks);
                    batch_points.extend(points);

                    if batch_points.len() >= options.batch_size {
                        flush_batch(self.store.as_ref(), &collection, &mut batch_points)?;
                    }

                    self.metadata
                        .mark_file_completed(&self.relative_path(file_path), chunks)?;

                    if monitor.should_recalculate(i) {
                        let remaining = files.len().saturating_sub(i + 1);
                        cached_stats = monitor.calculate(remaining, &pool.throttle_state());
                    }

                    let control = progress.on_progress(
                        i + 1,
                        files.len(),
                        file_path,
                        &compose_info(&cached_stats),
                    );
                    if control == ProgressControl::Interrupt {
                        stats.cancelled = true;
                        break;
                    }
                }
                // Batch-length violations abort the run before any flush of
                // the affected points
                Err(err @ CidxError::PartialEmbeddingResponse { .. }) => return Err(err),
                Err(err) => {
                    stats.failed_files += 1;
                    self.metadata
                        .mark_file_failed(&self.relative_path(file_path))?;

                    let control = progress.on_file_error(
                        i + 1,
                        files.len(),
                        file_path,
                        &err.to_string(),
                    );
                    if control == ProgressControl::Interrupt {
                        stats.cancelled = true;
                        break;
                    }
                }
            }
        }

        // An interrupted run still flushes what it has; the metadata stays
        // in_progress so the next run resumes
        flush_batch(self.store.as_ref(), &collection, &mut batch_points)?;
        self.store.build_collection(&collection)?;

        if let Some(fts) = &fts {
            fts.commit()?;
        }

        stats.duration_seconds = started.elapsed().as_secs_f64();
        if stats.cancelled {
            info!(
                "indexing interrupted after {} files ({} chunks), resumable",
                stats.files_processed, stats.chunks_created
            );
        }
        Ok(stats)
    }

    fn process_one_file(
        &self,
        file_path: &Path,
        pool: &EmbeddingPool,
        fts: Option<&FtsStore>,
    ) -> Result<Vec<Point>> {
        let content =
            std::fs::read_to_string(file_path).map_err(|e| CidxError::io(file_path, e))?;
        let chunks = chunk_content(&content);
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        // One task per chunk; workers run them in parallel
        let pending: Vec<PendingEmbedding> = chunks
            .iter()
            .map(|chunk| pool.submit_chunk(chunk.content.clone()))
            .collect::<Result<_>>()?;

        let mut vectors = Vec::with_capacity(pending.len());
        for handle in pending {
            let mut batch = handle.wait()?;
            vectors.push(batch.remove(0));
        }

        let language = language_from_extension(file_path);
        let relative = self.relative_path(file_path);
        let mtime = file_mtime(file_path);
        let indexed_at = format_indexed_at(Utc::now());

        if let Some(fts) = fts {
            fts.add_file_document(&relative, &content, &language)?;
        }

        Ok(chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| Point {
                vector,
                payload: PointPayload {
                    path: relative.clone(),
                    content: chunk.content,
                    line_start: chunk.line_start,
                    line_end: chunk.line_end,
                    language: language.clone(),
                    indexed_at: indexed_at.clone(),
                    filesystem_mtime: mtime,
                    file_last_modified: mtime,
                    ..Default::default()
                },
            })
            .collect())
    }
}

fn flush_batch(
    store: &dyn VectorBackend,
    collection: &str,
    batch_points: &mut Vec<Point>,
) -> Result<()> {
    if batch_points.is_empty() {
        return Ok(());
    }
    match store.upsert_points(collection, batch_points) {
        Ok(true) => {
            batch_points.clear();
            Ok(())
        }
        Ok(false) => Err(CidxError::BackendUpsertFailed(format!(
            "upsert of {} points into {collection} returned failure",
            batch_points.len()
        ))),
        Err(err) => Err(CidxError::BackendUpsertFailed(err.to_string())),
    }
}

fn parse_indexed_at(value: &str) -> Option<f64> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%SZ")
        .ok()
        .map(|naive| naive.and_utc().timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_indexed_at() {
        assert_eq!(
            parse_indexed_at("2025-06-01T10:00:00Z"),
            Some(1_748_772_000.0)
        );
        assert_eq!(parse_indexed_at("garbage"), None);
    }

    #[test]
    fn test_default_options() {
        let options = IndexOptions::default();
        assert_eq!(options.batch_size, 50);
        assert_eq!(options.safety_buffer, Duration::from_secs(60));
        assert!(!options.force_full);
        assert!(!options.reconcile_with_database);
    }
}
