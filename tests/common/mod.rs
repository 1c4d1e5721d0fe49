//! Shared fixtures for integration tests.
#![allow(dead_code)] // Each test binary uses a different subset

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cidx_daemon::config::DaemonConfig;
use cidx_daemon::daemon::DaemonService;
use cidx_daemon::embed::{EmbeddingProvider, ThrottleState};
use cidx_daemon::error::Result;
use cidx_daemon::indexer::{ProgressControl, ProgressReporter};

pub const STUB_DIMS: usize = 16;

/// Deterministic embedding provider: bag-of-words token hashing, so texts
/// sharing tokens land close in cosine space. No network, no model.
pub struct StubProvider {
    pub batch_calls: AtomicUsize,
    /// Return this many fewer vectors than requested (partial response)
    pub short_by: usize,
}

impl StubProvider {
    pub fn new() -> Self {
        Self {
            batch_calls: AtomicUsize::new(0),
            short_by: 0,
        }
    }

    pub fn partial(short_by: usize) -> Self {
        Self {
            batch_calls: AtomicUsize::new(0),
            short_by,
        }
    }

    pub fn embed(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; STUB_DIMS];
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let mut hash = 5381u64;
            for b in token.to_lowercase().bytes() {
                hash = hash.wrapping_mul(33).wrapping_add(b as u64);
            }
            vector[(hash % STUB_DIMS as u64) as usize] += 1.0;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        } else {
            vector[0] = 1.0;
        }
        vector
    }
}

impl EmbeddingProvider for StubProvider {
    fn provider_name(&self) -> &str {
        "voyage-ai"
    }

    fn current_model(&self) -> String {
        "stub-code-1".to_string()
    }

    fn dimensions(&self) -> usize {
        STUB_DIMS
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn health_check(&self, _test_api: bool) -> Result<bool> {
        Ok(true)
    }

    fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::embed(text))
    }

    fn get_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::Relaxed);
        let n = texts.len().saturating_sub(self.short_by);
        Ok(texts[..n].iter().map(|t| Self::embed(t)).collect())
    }

    fn throttle_state(&self) -> ThrottleState {
        ThrottleState::default()
    }
}

/// A throwaway project with a `.code-indexer` config directory and a few
/// source files.
pub struct TestProject {
    pub dir: tempfile::TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(".code-indexer")).expect("config dir");
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.path().join(".code-indexer")
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dirs");
        }
        std::fs::write(&path, content).expect("write file");
        path
    }

    pub fn config(&self) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.codebase_dir = self.root();
        config.embedding.parallel_requests = 2;
        // Fast eviction checks keep tests snappy
        config.daemon.check_interval_seconds = 1;
        config
    }

    pub fn service(&self) -> Arc<DaemonService> {
        DaemonService::with_provider(self.config(), self.config_dir(), Arc::new(StubProvider::new()))
    }

    /// A small codebase with authentication-flavoured content.
    pub fn with_sample_files(self) -> Self {
        self.write_file(
            "src/auth.rs",
            "fn authenticate(user: &User) -> Result<Token> {\n    verify_password(user)\n}\n",
        );
        self.write_file(
            "src/storage.py",
            "def save_record(record):\n    database.insert(record)\n",
        );
        self.write_file(
            "src/tests/auth_test.py",
            "def test_authenticate():\n    assert authenticate(user)\n",
        );
        self
    }
}

/// Progress reporter that records every event and can interrupt after a
/// fixed number of file completions.
#[derive(Default)]
pub struct CollectingProgress {
    pub events: Mutex<Vec<(usize, usize, String, String)>>,
    pub interrupt_after: Option<usize>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupting_after(files: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            interrupt_after: Some(files),
        }
    }

    pub fn infos(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, _, info)| info.clone())
            .collect()
    }
}

impl ProgressReporter for CollectingProgress {
    fn on_progress(
        &self,
        current: usize,
        total: usize,
        file_path: &Path,
        info: &str,
    ) -> ProgressControl {
        let mut events = self.events.lock().unwrap();
        events.push((
            current,
            total,
            file_path.display().to_string(),
            info.to_string(),
        ));

        // Count only per-file progress (total > 0 with a real path)
        if let Some(limit) = self.interrupt_after {
            let file_events = events
                .iter()
                .filter(|(_, total, path, _)| *total > 0 && !path.is_empty())
                .count();
            if file_events >= limit {
                return ProgressControl::Interrupt;
            }
        }
        ProgressControl::Continue
    }
}
