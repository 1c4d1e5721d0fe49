//! The daemon service: one shared instance behind all connections.
//!
//! Owns the cache, the watch manager, the background indexing job, and the
//! collaborator services (embedding provider, vector stores, git
//! topology), all constructed once at daemon start and injected downward.
//! Query operations hold the daemon cache mutex for their entire duration,
//! so eviction and rebuild detection can never tear a query in progress.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, INDEX_DIR_NAME, MAX_CACHED_ELEMENTS, METADATA_FILE_NAME,
    TEMPORAL_COLLECTION_NAME,
};
use crate::embed::{EmbeddingProvider, VoyageClient};
use crate::error::{CidxError, Result};
use crate::fts::{fts_dir, FtsSearchOptions, FtsStore};
use crate::indexer::files::FileFinder;
use crate::indexer::{IndexOptions, ProgressControl, ProgressReporter, SmartIndexer};
use crate::query::{accuracy_to_ef, FilterConditions, StalenessDetector};
use crate::storage::{DiskVectorStore, PointPayload, VectorBackend};

use super::cache::{start_eviction_loop, CacheEntry, EvictionHandle};
use super::protocol::{
    CleanParams, FtsQueryParams, IndexParams, QueryParams, StatusParams, TemporalQueryParams,
    WatchParams,
};
use super::watch_manager::{WatchDeps, WatchManager};

/// Background indexing job state; at most one job per daemon.
#[derive(Default)]
struct IndexingJob {
    thread: Option<JoinHandle<()>>,
    project_path: Option<PathBuf>,
    current_files_processed: usize,
    total_files: usize,
    error: Option<String>,
    stats: Option<Value>,
}

impl IndexingJob {
    fn is_running(&self) -> bool {
        self.thread.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

/// Progress reporter that publishes counters for polling.
struct PollingProgress {
    job: Arc<Mutex<IndexingJob>>,
}

impl ProgressReporter for PollingProgress {
    fn on_progress(&self, current: usize, total: usize, _: &Path, _: &str) -> ProgressControl {
        let mut job = self.job.lock().expect("indexing job poisoned");
        job.current_files_processed = current;
        job.total_files = total;
        ProgressControl::Continue
    }
}

pub struct DaemonService {
    config: DaemonConfig,
    config_dir: PathBuf,
    project_root: PathBuf,
    cache: Arc<Mutex<Option<Arc<CacheEntry>>>>,
    stores: Mutex<HashMap<PathBuf, Arc<DiskVectorStore>>>,
    indexing: Arc<Mutex<IndexingJob>>,
    watch_manager: WatchManager,
    provider: Arc<dyn EmbeddingProvider>,
    eviction: Mutex<Option<EvictionHandle>>,
    shutdown: AtomicBool,
}

impl DaemonService {
    /// Build the service with the provider named in the config.
    pub fn new(config: DaemonConfig, config_dir: PathBuf) -> Result<Arc<Self>> {
        let provider: Arc<dyn EmbeddingProvider> = match config.embedding.provider.as_str() {
            "voyage-ai" => Arc::new(VoyageClient::new(config.embedding.clone())?),
            other => {
                return Err(CidxError::config(format!(
                    "unknown embedding provider: {other}"
                )))
            }
        };
        Ok(Self::with_provider(config, config_dir, provider))
    }

    /// Build the service with an injected provider (tests, alternative
    /// deployments).
    pub fn with_provider(
        config: DaemonConfig,
        config_dir: PathBuf,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Arc<Self> {
        let project_root = config.resolve_codebase_dir(&config_dir);
        let cache = Arc::new(Mutex::new(None));

        let service = Arc::new(Self {
            cache: Arc::clone(&cache),
            stores: Mutex::new(HashMap::new()),
            indexing: Arc::new(Mutex::new(IndexingJob::default())),
            watch_manager: WatchManager::new(),
            provider,
            eviction: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            project_root,
            config_dir,
            config,
        });

        let handle = start_eviction_loop(
            Arc::downgrade(&cache),
            Duration::from_secs(service.config.daemon.check_interval_seconds),
            service.config.daemon.auto_shutdown_on_idle,
        );
        *service.eviction.lock().expect("eviction slot poisoned") = Some(handle);

        info!("daemon service initialized for {}", service.project_root.display());
        service
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.daemon.request_timeout_seconds)
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.daemon.ttl_minutes * 60)
    }

    fn config_dir_for(&self, project: &Path) -> PathBuf {
        if project == self.project_root {
            self.config_dir.clone()
        } else {
            project.join(CONFIG_DIR_NAME)
        }
    }

    fn config_for(&self, project: &Path) -> DaemonConfig {
        if project == self.project_root {
            return self.config.clone();
        }
        let path = project.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
        match DaemonConfig::load(&path) {
            Ok(mut config) => {
                config.codebase_dir = project.to_path_buf();
                config
            }
            Err(_) => {
                let mut config = self.config.clone();
                config.codebase_dir = project.to_path_buf();
                config
            }
        }
    }

    /// The vector store serving a project. Handles are cached per project
    /// path so LMDB environments are never opened twice in one process.
    pub fn vector_store(&self, project: &Path) -> Arc<DiskVectorStore> {
        self.store_for(project)
    }

    fn store_for(&self, project: &Path) -> Arc<DiskVectorStore> {
        let mut stores = self.stores.lock().expect("store map poisoned");
        Arc::clone(stores.entry(project.to_path_buf()).or_insert_with(|| {
            Arc::new(DiskVectorStore::new(
                project.join(CONFIG_DIR_NAME).join(INDEX_DIR_NAME),
            ))
        }))
    }

    fn build_indexer(&self, project: &Path) -> SmartIndexer {
        let config = self.config_for(project);
        let config_dir = self.config_dir_for(project);
        let store: Arc<dyn VectorBackend> = self.store_for(project);
        SmartIndexer::new(&config, &config_dir, Arc::clone(&self.provider), store)
    }

    // ── Cache loading ────────────────────────────────────────────────

    /// First workspace (non-temporal) collection of a project.
    fn primary_collection(&self, project: &Path) -> Option<String> {
        let store = self.store_for(project);
        store
            .list_collections()
            .ok()?
            .into_iter()
            .find(|name| name != TEMPORAL_COLLECTION_NAME)
    }

    /// Load indexes into the cache if absent; detect out-of-band rebuilds
    /// via the version stamp and reload. Caller holds the cache mutex.
    fn ensure_cache_loaded_locked(
        &self,
        guard: &mut Option<Arc<CacheEntry>>,
        project: &Path,
    ) {
        if let Some(entry) = guard.as_ref() {
            if entry.project_path() == project {
                if let Some(collection) = self.primary_collection(project) {
                    let collection_path = self.store_for(project).collection_path(&collection);
                    if entry.is_stale_after_rebuild(&collection_path) {
                        info!("background rebuild detected, invalidating cache");
                        entry.invalidate();
                        *guard = None;
                    }
                }
            }
        }

        let needs_load = guard
            .as_ref()
            .map(|entry| entry.project_path() != project)
            .unwrap_or(true);

        if needs_load {
            info!("loading cache for {}", project.display());
            let entry = Arc::new(CacheEntry::new(project.to_path_buf(), self.ttl()));
            self.load_semantic_indexes(&entry, project);
            self.load_fts_indexes(&entry, project);
            *guard = Some(entry);
        }
    }

    fn load_semantic_indexes(&self, entry: &CacheEntry, project: &Path) {
        let Some(collection) = self.primary_collection(project) else {
            warn!("no collections found for {}", project.display());
            return;
        };
        let store = self.store_for(project);

        match (
            store.load_ann_index(&collection, MAX_CACHED_ELEMENTS),
            store.load_id_mapping(&collection, MAX_CACHED_ELEMENTS),
        ) {
            (Ok(ann), Ok(mapping)) => {
                info!(
                    "semantic indexes loaded (collection: {collection}, vector_dim: {}, version: {})",
                    ann.vector_dim(),
                    ann.rebuild_uuid()
                );
                entry.set_semantic_indexes(ann, mapping, collection);
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to load semantic indexes: {e}");
            }
        }
    }

    fn load_fts_indexes(&self, entry: &CacheEntry, project: &Path) {
        let dir = fts_dir(&self.config_dir_for(project));
        if !dir.exists() {
            debug!("FTS directory does not exist: {}", dir.display());
            return;
        }
        match FtsStore::open(&dir) {
            Ok(fts) => {
                info!("FTS indexes loaded");
                entry.set_fts_indexes(fts);
            }
            Err(e) => warn!("failed to load FTS indexes: {e}"),
        }
    }

    fn invalidate_cache(&self, reason: &str) {
        let mut guard = self.cache.lock().expect("cache lock poisoned");
        if guard.is_some() {
            info!("invalidating cache: {reason}");
            *guard = None;
        }
    }

    // ── Query operations ─────────────────────────────────────────────

    /// Semantic search with timing and best-effort staleness enrichment.
    pub fn query(&self, params: &QueryParams) -> Result<Value> {
        debug!("query: project={}, query={:.50}", params.project.display(), params.query);
        let total_start = Instant::now();

        let mut guard = self.cache.lock().expect("cache lock poisoned");
        self.ensure_cache_loaded_locked(&mut guard, &params.project);
        let entry = guard.as_ref().expect("entry just ensured").clone();
        entry.update_access();

        let (mut results, mut timing) = self.execute_semantic_search(&entry, params)?;

        // Staleness detection is best-effort; the detector reorders its
        // working set, so matches are joined back by path
        if !results.is_empty() {
            let payloads: Vec<PointPayload> = results
                .iter()
                .filter_map(|r| serde_json::from_value(r["payload"].clone()).ok())
                .collect();
            let staleness =
                StalenessDetector::default().detect(&params.project, payloads.iter());
            for result in &mut results {
                if let Some(path) = result["payload"]["path"].as_str() {
                    if let Some(meta) = staleness.get(path) {
                        result["staleness"] = json!({
                            "is_stale": meta.is_stale,
                            "staleness_indicator": meta.staleness_indicator,
                            "staleness_delta_seconds": meta.staleness_delta_seconds,
                        });
                    }
                }
            }
        }

        timing["total_ms"] = json!(total_start.elapsed().as_secs_f64() * 1000.0);
        Ok(json!({"results": results, "timing": timing}))
    }

    fn execute_semantic_search(
        &self,
        entry: &CacheEntry,
        params: &QueryParams,
    ) -> Result<(Vec<Value>, Value)> {
        let indexes = entry.indexes.read().expect("index lock poisoned");
        let (Some(ann), Some(mapping)) = (&indexes.ann_index, &indexes.id_mapping) else {
            warn!("semantic indexes not loaded, returning empty results");
            return Ok((Vec::new(), json!({})));
        };

        let filters = FilterConditions::build(
            &params.languages,
            &params.exclude_languages,
            &params.path_filter,
            &params.exclude_paths,
        )?;
        let ef = accuracy_to_ef(&params.accuracy);

        let embed_start = Instant::now();
        let query_vector = self.provider.get_embedding(&params.query)?;
        let embed_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        // Over-fetch so post-filtering still fills the limit
        let fetch = if filters.is_empty() {
            params.limit
        } else {
            (params.limit * 4).max(params.limit + 16)
        };

        let search_start = Instant::now();
        let hits = ann.search(&query_vector, fetch, ef)?;
        let search_ms = search_start.elapsed().as_secs_f64() * 1000.0;

        let mut results = Vec::new();
        for (id, score) in hits {
            if results.len() >= params.limit {
                break;
            }
            if let Some(min_score) = params.min_score {
                if score < min_score {
                    continue;
                }
            }
            let Some(payload) = mapping.get(&id) else {
                continue;
            };
            if !filters.matches(payload) {
                continue;
            }
            results.push(json!({
                "score": score,
                "payload": payload,
            }));
        }

        info!("semantic search returned {} results", results.len());
        Ok((
            results,
            json!({"embed_ms": embed_ms, "search_ms": search_ms}),
        ))
    }

    /// Full-text search against the cached tantivy index.
    pub fn query_fts(&self, params: &FtsQueryParams) -> Result<Value> {
        debug!("query_fts: project={}, query={:.50}", params.project.display(), params.query);

        let mut guard = self.cache.lock().expect("cache lock poisoned");
        self.ensure_cache_loaded_locked(&mut guard, &params.project);
        let entry = guard.as_ref().expect("entry just ensured").clone();
        entry.update_access();

        let indexes = entry.indexes.read().expect("index lock poisoned");
        let Some(fts) = indexes.fts_index.as_ref() else {
            warn!("FTS index not available for {}", params.project.display());
            return Ok(json!([]));
        };

        let options = FtsSearchOptions {
            limit: params.limit,
            edit_distance: params.edit_distance,
            case_sensitive: params.case_sensitive,
            use_regex: params.use_regex,
            snippet_lines: params.snippet_lines,
            languages: params.languages.clone(),
            exclude_languages: params.exclude_languages.clone(),
            path_filters: params.path_filters.clone(),
            exclude_paths: params.exclude_paths.clone(),
        };

        let results = fts.search(&params.query, &options)?;
        info!("FTS search returned {} results", results.len());
        Ok(serde_json::to_value(results)?)
    }

    /// Semantic and FTS search back-to-back.
    pub fn query_hybrid(&self, params: &QueryParams, fts_params: &FtsQueryParams) -> Result<Value> {
        let semantic = self.query(params)?;
        let fts = self.query_fts(fts_params)?;
        Ok(json!({"semantic": semantic, "fts": fts}))
    }

    /// Temporal-collection search. Missing collection and malformed time
    /// ranges come back as an embedded error with an empty result list.
    pub fn query_temporal(&self, params: &TemporalQueryParams) -> Result<Value> {
        debug!(
            "query_temporal: project={}, time_range={}",
            params.project.display(),
            params.time_range
        );

        let range = match parse_time_range(&params.time_range) {
            Ok(range) => range,
            Err(e) => {
                return Ok(json!({"error": e.to_string(), "results": []}));
            }
        };

        let mut guard = self.cache.lock().expect("cache lock poisoned");
        self.ensure_cache_loaded_locked(&mut guard, &params.project);
        let entry = guard.as_ref().expect("entry just ensured").clone();

        let store = self.store_for(&params.project);
        let temporal_path = store.collection_path(TEMPORAL_COLLECTION_NAME);
        if !temporal_path.exists() {
            warn!("temporal index not found: {}", temporal_path.display());
            return Ok(json!({
                "error": "temporal index not found; index commit history first",
                "results": [],
            }));
        }

        if let Err(e) = entry.load_temporal_indexes(&store, TEMPORAL_COLLECTION_NAME) {
            return Ok(json!({"error": e.to_string(), "results": []}));
        }

        if entry.is_temporal_stale_after_rebuild(&temporal_path) {
            info!("temporal cache stale after rebuild, reloading");
            entry.invalidate_temporal();
            if let Err(e) = entry.load_temporal_indexes(&store, TEMPORAL_COLLECTION_NAME) {
                return Ok(json!({"error": e.to_string(), "results": []}));
            }
        }

        entry.update_access();

        let indexes = entry.indexes.read().expect("index lock poisoned");
        let (Some(ann), Some(mapping)) =
            (&indexes.temporal_ann, &indexes.temporal_id_mapping)
        else {
            return Ok(json!({"error": "temporal index unavailable", "results": []}));
        };

        let filters = FilterConditions::build(
            &params.languages,
            &params.exclude_languages,
            &params.path_filter,
            &params.exclude_path,
        )?;
        let ef = accuracy_to_ef(&params.accuracy);

        let embed_start = Instant::now();
        let query_vector = self.provider.get_embedding(&params.query)?;
        let embed_ms = embed_start.elapsed().as_secs_f64() * 1000.0;

        let fetch = (params.limit * 4).max(params.limit + 16);
        let search_start = Instant::now();
        let hits = ann.search(&query_vector, fetch, ef)?;
        let search_ms = search_start.elapsed().as_secs_f64() * 1000.0;

        let (start_date, end_date) = range;
        let mut results = Vec::new();
        for (id, score) in hits {
            if results.len() >= params.limit {
                break;
            }
            if let Some(min_score) = params.min_score {
                if score < min_score {
                    continue;
                }
            }
            let Some(payload) = mapping.get(&id) else {
                continue;
            };
            let Some(commit_date) = payload
                .commit_date
                .as_deref()
                .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if commit_date < start_date || commit_date > end_date {
                continue;
            }
            if let Some(wanted) = &params.chunk_type {
                if payload.chunk_type.as_deref() != Some(wanted.as_str()) {
                    continue;
                }
            }
            if !filters.matches(payload) {
                continue;
            }
            results.push(json!({
                "file_path": payload.path,
                "content": payload.content,
                "score": score,
                "commit_date": payload.commit_date,
                "chunk_type": payload.chunk_type,
                "branch": payload.branch,
            }));
        }

        let total_found = results.len();
        Ok(json!({
            "results": results,
            "query": params.query,
            "filter_type": "time_range",
            "filter_value": params.time_range,
            "total_found": total_found,
            "performance": {"embed_ms": embed_ms, "search_ms": search_ms},
        }))
    }

    // ── Indexing operations ──────────────────────────────────────────

    fn index_options(params: &IndexParams, defaults: &DaemonConfig) -> IndexOptions {
        IndexOptions {
            force_full: params.force_full,
            reconcile_with_database: params.reconcile_with_database,
            batch_size: params.batch_size.unwrap_or(defaults.indexing.batch_size),
            safety_buffer: Duration::from_secs(defaults.indexing.safety_buffer_seconds),
            enable_fts: params.enable_fts,
            files_count_to_process: params.files_count_to_process,
        }
    }

    /// Synchronous indexing, streaming progress through the reporter.
    /// Invalidates the cache before and after.
    pub fn index_blocking(&self, params: &IndexParams, progress: &dyn ProgressReporter) -> Value {
        info!("index_blocking: project={}", params.project.display());
        self.invalidate_cache("before indexing");

        let config = self.config_for(&params.project);
        let options = Self::index_options(params, &config);
        let mut indexer = self.build_indexer(&params.project);

        let outcome = indexer.smart_index(&options, progress);
        self.invalidate_cache("after indexing completed");

        match outcome {
            Ok(stats) => json!({
                "status": "completed",
                "stats": {
                    "files_processed": stats.files_processed,
                    "chunks_created": stats.chunks_created,
                    "failed_files": stats.failed_files,
                    "duration_seconds": stats.duration_seconds,
                    "cancelled": stats.cancelled,
                },
            }),
            Err(e) => {
                error!("blocking indexing failed: {e}");
                json!({"status": "error", "message": e.to_string(), "kind": e.kind()})
            }
        }
    }

    /// Non-blocking indexing: spawn the background job and return
    /// immediately. A second call while one runs gets `already_running`.
    pub fn index(&self, params: &IndexParams) -> Value {
        info!("index: project={} [background]", params.project.display());

        let mut job = self.indexing.lock().expect("indexing job poisoned");
        if job.is_running() {
            return json!({
                "status": "already_running",
                "message": "indexing already in progress",
                "project_path": job.project_path.as_ref().map(|p| p.display().to_string()),
            });
        }

        job.project_path = Some(params.project.clone());
        job.current_files_processed = 0;
        job.total_files = 0;
        job.error = None;
        job.stats = None;

        let cache = Arc::clone(&self.cache);
        let job_handle = Arc::clone(&self.indexing);
        let config = self.config_for(&params.project);
        let config_dir = self.config_dir_for(&params.project);
        let provider = Arc::clone(&self.provider);
        let store: Arc<dyn VectorBackend> = self.store_for(&params.project);
        let options = Self::index_options(params, &config);

        let thread = std::thread::Builder::new()
            .name("background-indexing".to_string())
            .spawn(move || {
                run_indexing_background(cache, job_handle, config, config_dir, provider, store, options);
            });

        match thread {
            Ok(handle) => {
                job.thread = Some(handle);
                json!({
                    "status": "started",
                    "message": "indexing started in background",
                    "project_path": params.project.display().to_string(),
                })
            }
            Err(e) => {
                job.project_path = None;
                json!({"status": "error", "message": format!("failed to spawn indexing thread: {e}")})
            }
        }
    }

    /// Poll the background indexing state.
    pub fn get_index_progress(&self) -> Value {
        let job = self.indexing.lock().expect("indexing job poisoned");
        let running = job.is_running();

        if !running {
            if let Some(stats) = &job.stats {
                return json!({"running": false, "status": "completed", "stats": stats});
            }
            if let Some(error) = &job.error {
                return json!({"running": false, "status": "error", "message": error});
            }
            return json!({"running": false, "status": "idle"});
        }

        json!({
            "running": true,
            "status": "indexing",
            "files_processed": job.current_files_processed,
            "total_files": job.total_files,
        })
    }

    /// Walk discovered files and rebuild the FTS index from scratch.
    pub fn rebuild_fts_index(&self, params: &StatusParams, progress: &dyn ProgressReporter) -> Value {
        info!("rebuild_fts_index: project={}", params.project.display());

        let config_dir = self.config_dir_for(&params.project);
        if !config_dir.join(METADATA_FILE_NAME).exists() {
            return json!({
                "status": "error",
                "error": "no indexing metadata found; run indexing first to create the semantic index",
            });
        }

        let config = self.config_for(&params.project);
        let root = config.resolve_codebase_dir(&config_dir);
        let finder = FileFinder::new(&root, &config.indexing);

        progress.on_progress(0, 0, Path::new(""), "discovering files");
        let files = finder.find_files();
        if files.is_empty() {
            return json!({
                "status": "error",
                "error": "no files found to index; check file_extensions and exclude_dirs",
            });
        }
        progress.on_progress(0, files.len(), Path::new(""), &format!("found {} files", files.len()));

        self.invalidate_cache("before FTS rebuild");

        let fts = match FtsStore::recreate(&fts_dir(&config_dir)) {
            Ok(fts) => fts,
            Err(e) => return json!({"status": "error", "error": e.to_string()}),
        };

        let mut indexed = 0usize;
        let mut failed = 0usize;
        for (i, file) in files.iter().enumerate() {
            match std::fs::read_to_string(file) {
                Ok(content) => {
                    let language = crate::indexer::chunker::language_from_extension(file);
                    let relative = file
                        .strip_prefix(&root)
                        .unwrap_or(file)
                        .to_string_lossy()
                        .to_string();
                    match fts.add_file_document(&relative, &content, &language) {
                        Ok(()) => indexed += 1,
                        Err(e) => {
                            warn!("failed to index {}: {e}", file.display());
                            failed += 1;
                        }
                    }
                }
                Err(_) => failed += 1,
            }
            let control = progress.on_progress(
                i + 1,
                files.len(),
                file,
                &format!("indexing files ({}/{})", i + 1, files.len()),
            );
            if control == ProgressControl::Interrupt {
                break;
            }
        }

        progress.on_progress(files.len(), files.len(), Path::new(""), "committing FTS index");
        if let Err(e) = fts.commit() {
            return json!({"status": "error", "error": e.to_string()});
        }

        progress.on_progress(
            files.len(),
            files.len(),
            Path::new(""),
            &format!("complete: {indexed} indexed, {failed} failed"),
        );
        json!({"status": "success", "files_indexed": indexed, "files_failed": failed})
    }

    // ── Watch operations ─────────────────────────────────────────────

    pub fn watch_start(&self, params: &WatchParams) -> Value {
        info!("watch_start: project={}", params.project.display());
        let deps = WatchDeps {
            config: self.config_for(&params.project),
            config_dir: self.config_dir_for(&params.project),
            provider: Arc::clone(&self.provider),
            store: self.store_for(&params.project),
        };
        self.watch_manager.start_watch(&params.project, deps)
    }

    pub fn watch_stop(&self) -> Value {
        info!("watch_stop");
        self.watch_manager.stop_watch()
    }

    pub fn watch_status(&self) -> Value {
        let stats = self.watch_manager.get_stats();
        if stats["status"] == "running" {
            json!({
                "running": true,
                "project_path": stats["project_path"],
                "stats": stats,
            })
        } else {
            json!({"running": false, "project_path": null})
        }
    }

    // ── Storage operations ───────────────────────────────────────────

    /// Clear a collection's vectors; cache is invalidated first.
    pub fn clean(&self, params: &CleanParams) -> Value {
        info!("clean: project={}", params.project.display());
        self.invalidate_cache("before clean");

        let store = self.store_for(&params.project);
        let collection = match &params.collection {
            Some(name) => name.clone(),
            None => {
                let collections = match store.list_collections() {
                    Ok(c) => c,
                    Err(e) => return json!({"status": "error", "message": e.to_string()}),
                };
                match collections.len() {
                    0 => return json!({"status": "success", "message": "no collections to clear"}),
                    1 => collections.into_iter().next().expect("len checked"),
                    _ => {
                        return json!({
                            "status": "error",
                            "message": "multiple collections exist, specify the collection parameter",
                        })
                    }
                }
            }
        };

        match store.clear_collection(&collection) {
            Ok(true) => json!({
                "status": "success",
                "message": format!("collection '{collection}' cleared"),
            }),
            Ok(false) => json!({
                "status": "error",
                "message": format!("collection '{collection}' not found"),
            }),
            Err(e) => json!({"status": "error", "message": e.to_string()}),
        }
    }

    /// Delete one or all collections; cache is invalidated first.
    pub fn clean_data(&self, params: &CleanParams) -> Value {
        info!("clean_data: project={}", params.project.display());
        self.invalidate_cache("before clean_data");

        let store = self.store_for(&params.project);
        if let Some(collection) = &params.collection {
            return match store.delete_collection(collection) {
                Ok(true) => json!({
                    "status": "success",
                    "message": format!("collection '{collection}' deleted"),
                }),
                Ok(false) => json!({
                    "status": "error",
                    "message": format!("collection '{collection}' not found"),
                }),
                Err(e) => json!({"status": "error", "message": e.to_string()}),
            };
        }

        let collections = match store.list_collections() {
            Ok(c) => c,
            Err(e) => return json!({"status": "error", "message": e.to_string()}),
        };
        let mut deleted = 0usize;
        for collection in &collections {
            if matches!(store.delete_collection(collection), Ok(true)) {
                deleted += 1;
            }
        }
        json!({"status": "success", "message": format!("deleted {deleted} collection(s)")})
    }

    /// Combined cache + storage status for one project.
    pub fn status(&self, params: &StatusParams) -> Value {
        debug!("status: project={}", params.project.display());

        let cache_stats = {
            let guard = self.cache.lock().expect("cache lock poisoned");
            match guard.as_ref() {
                Some(entry) => entry.get_stats(),
                None => json!({"cache_loaded": false}),
            }
        };

        let store = self.store_for(&params.project);
        let storage = match store.list_collections() {
            Ok(collections) => {
                let statuses: Vec<Value> = collections
                    .iter()
                    .filter_map(|name| {
                        store
                            .collection_status(name)
                            .ok()
                            .and_then(|s| serde_json::to_value(s).ok())
                    })
                    .collect();
                json!({"collections": statuses})
            }
            Err(e) => json!({"error": e.to_string()}),
        };

        json!({"cache": cache_stats, "storage": storage})
    }

    // ── Daemon management ────────────────────────────────────────────

    /// Aggregated cache + indexing + watch status.
    pub fn get_status(&self) -> Value {
        let cache_status = {
            let guard = self.cache.lock().expect("cache lock poisoned");
            match guard.as_ref() {
                Some(entry) => {
                    let mut stats = entry.get_stats();
                    stats["cache_loaded"] = json!(true);
                    stats
                }
                None => json!({"cache_loaded": false}),
            }
        };

        let (indexing_running, indexing_project) = {
            let job = self.indexing.lock().expect("indexing job poisoned");
            (
                job.is_running(),
                job.project_path.as_ref().map(|p| p.display().to_string()),
            )
        };

        let watch_stats = self.watch_manager.get_stats();

        let mut status = cache_status;
        status["indexing_running"] = json!(indexing_running);
        status["indexing_project"] =
            json!(if indexing_running { indexing_project } else { None });
        status["watch_running"] = json!(watch_stats["status"] == "running");
        status["watch_project"] = watch_stats
            .get("project_path")
            .cloned()
            .unwrap_or(Value::Null);
        status["watch_uptime_seconds"] = watch_stats
            .get("uptime_seconds")
            .cloned()
            .unwrap_or(json!(0));
        status["watch_files_processed"] = watch_stats
            .get("files_processed")
            .cloned()
            .unwrap_or(json!(0));
        status
    }

    pub fn clear_cache(&self) -> Value {
        info!("clear_cache");
        self.invalidate_cache("manual clear");
        json!({"status": "success", "message": "cache cleared"})
    }

    pub fn ping(&self) -> Value {
        json!({"status": "ok"})
    }

    /// Graceful shutdown: stop watch, drop cache, stop the eviction loop,
    /// then signal the accept loop to exit.
    pub fn shutdown(&self) -> Value {
        info!("shutdown: initiating graceful shutdown");

        if self.watch_manager.is_running() {
            self.watch_manager.stop_watch();
        }
        self.invalidate_cache("shutdown");
        if let Some(mut handle) = self.eviction.lock().expect("eviction slot poisoned").take() {
            handle.stop();
        }
        self.shutdown.store(true, Ordering::SeqCst);

        info!("shutdown complete");
        json!({"status": "success", "message": "shutdown initiated"})
    }
}

/// Body of the background indexing thread: invalidate, run, publish.
fn run_indexing_background(
    cache: Arc<Mutex<Option<Arc<CacheEntry>>>>,
    job: Arc<Mutex<IndexingJob>>,
    config: DaemonConfig,
    config_dir: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorBackend>,
    options: IndexOptions,
) {
    info!("background indexing thread started");

    {
        let mut guard = cache.lock().expect("cache lock poisoned");
        if guard.is_some() {
            info!("invalidating cache before indexing");
            *guard = None;
        }
    }

    let mut indexer = SmartIndexer::new(&config, &config_dir, provider, store);
    let reporter = PollingProgress {
        job: Arc::clone(&job),
    };
    let outcome = indexer.smart_index(&options, &reporter);

    {
        let mut guard = job.lock().expect("indexing job poisoned");
        match outcome {
            Ok(stats) => {
                guard.stats = Some(json!({
                    "files_processed": stats.files_processed,
                    "chunks_created": stats.chunks_created,
                    "failed_files": stats.failed_files,
                    "duration_seconds": stats.duration_seconds,
                    "cancelled": stats.cancelled,
                }));
            }
            Err(e) => {
                error!("background indexing failed: {e}");
                guard.error = Some(e.to_string());
            }
        }
        guard.project_path = None;
        // Dropping the handle detaches the finished thread
        guard.thread = None;
    }

    {
        let mut guard = cache.lock().expect("cache lock poisoned");
        if guard.is_some() {
            info!("invalidating cache after indexing completed");
            *guard = None;
        }
    }

    info!("background indexing thread exiting");
}

/// Parse a temporal time-range string into an inclusive date interval.
pub fn parse_time_range(value: &str) -> Result<(NaiveDate, NaiveDate)> {
    if value == "all" {
        let start = NaiveDate::from_ymd_opt(1970, 1, 1).expect("valid constant date");
        let end = NaiveDate::from_ymd_opt(2100, 12, 31).expect("valid constant date");
        return Ok((start, end));
    }

    if let Some((start_raw, end_raw)) = value.split_once("..") {
        if start_raw.contains("..") || end_raw.contains("..") {
            return Err(CidxError::InvalidTimeRange(format!(
                "{value}: use YYYY-MM-DD..YYYY-MM-DD"
            )));
        }
        let start = NaiveDate::parse_from_str(start_raw.trim(), "%Y-%m-%d")
            .map_err(|e| CidxError::InvalidTimeRange(format!("{value}: {e}")))?;
        let end = NaiveDate::parse_from_str(end_raw.trim(), "%Y-%m-%d")
            .map_err(|e| CidxError::InvalidTimeRange(format!("{value}: {e}")))?;
        return Ok((start, end));
    }

    if let Some(rest) = value.strip_prefix("last-") {
        let days_raw = rest
            .strip_suffix("-days")
            .or_else(|| rest.strip_suffix("-day"))
            .ok_or_else(|| {
                CidxError::InvalidTimeRange(format!("{value}: use 'last-N-days'"))
            })?;
        let days: u64 = days_raw
            .parse()
            .map_err(|_| CidxError::InvalidTimeRange(format!("{value}: use 'last-N-days'")))?;
        let end = Utc::now().date_naive();
        let start = end
            .checked_sub_days(Days::new(days))
            .ok_or_else(|| CidxError::InvalidTimeRange(format!("{value}: range too large")))?;
        return Ok((start, end));
    }

    Err(CidxError::InvalidTimeRange(format!(
        "{value}: use 'all', 'last-N-days', or YYYY-MM-DD..YYYY-MM-DD"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_time_range_all() {
        let (start, end) = parse_time_range("all").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2100, 12, 31).unwrap());
    }

    #[test]
    fn test_parse_time_range_explicit() {
        let (start, end) = parse_time_range("2024-01-01..2024-12-31").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }

    #[test]
    fn test_parse_time_range_relative() {
        let (start, end) = parse_time_range("last-7-days").unwrap();
        assert_eq!(end, Utc::now().date_naive());
        assert_eq!(end.signed_duration_since(start).num_days(), 7);
    }

    #[test]
    fn test_parse_time_range_rejects_garbage() {
        for bad in ["yesterday", "2024-01-01..2024-12-31..extra", "last-n-days", "2024-13-01..2024-12-31"] {
            let err = parse_time_range(bad).unwrap_err();
            assert_eq!(err.kind(), "invalid_time_range", "input: {bad}");
        }
    }
}
