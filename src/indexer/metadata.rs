//! Progressive metadata for resumable indexing.
//!
//! One JSON file per project (`.code-indexer/metadata.json`) recording the
//! run status, the full resume file list, per-branch commit watermarks, and
//! the provider/model/git fingerprint that forces full reindexes on
//! configuration changes. Writes from the daemon and a concurrently running
//! CLI are coordinated with `fs2` file locks: branch updates take an
//! exclusive lock around a read-modify-write, branch reads take a
//! non-blocking shared lock and fall back to a caller-supplied default.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CidxError, Result};
use crate::git::GitState;

/// Indexing run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// The persisted record. Every field defaults so older files merge cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataFile {
    #[serde(default)]
    pub status: IndexingStatus,

    #[serde(default)]
    pub last_index_timestamp: f64,

    #[serde(default)]
    pub indexed_at: Option<String>,

    #[serde(default)]
    pub git_available: bool,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default)]
    pub current_branch: Option<String>,

    #[serde(default)]
    pub current_commit: Option<String>,

    #[serde(default)]
    pub embedding_provider: Option<String>,

    #[serde(default)]
    pub embedding_model: Option<String>,

    #[serde(default)]
    pub files_processed: u64,

    #[serde(default)]
    pub chunks_indexed: u64,

    #[serde(default)]
    pub failed_files: u64,

    #[serde(default)]
    pub error_message: Option<String>,

    // Resumability
    #[serde(default)]
    pub total_files_to_index: usize,

    #[serde(default)]
    pub files_to_index: Vec<String>,

    #[serde(default)]
    pub completed_files: Vec<String>,

    #[serde(default)]
    pub failed_file_paths: Vec<String>,

    #[serde(default)]
    pub current_file_index: usize,

    // Git commit watermarks for incremental indexing against history
    #[serde(default)]
    pub branch_commit_watermarks: HashMap<String, String>,

    #[serde(default)]
    pub last_commit_check_timestamp: f64,
}

pub struct ProgressiveMetadata {
    metadata_path: PathBuf,
    data: MetadataFile,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl ProgressiveMetadata {
    /// Load from disk. Corrupt or missing files fall back to defaults; no
    /// error surfaces to the caller.
    pub fn load(metadata_path: impl Into<PathBuf>) -> Self {
        let metadata_path = metadata_path.into();
        let data = std::fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            metadata_path,
            data,
        }
    }

    pub fn path(&self) -> &Path {
        &self.metadata_path
    }

    pub fn data(&self) -> &MetadataFile {
        &self.data
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CidxError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.metadata_path, content)
            .map_err(|e| CidxError::io(&self.metadata_path, e))?;
        Ok(())
    }

    /// Mark the start of an indexing run and persist the fingerprint.
    pub fn start_indexing(
        &mut self,
        provider_name: &str,
        model_name: &str,
        git_state: &GitState,
    ) -> Result<()> {
        self.data.status = IndexingStatus::InProgress;
        self.data.indexed_at = Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        self.data.embedding_provider = Some(provider_name.to_string());
        self.data.embedding_model = Some(model_name.to_string());
        self.data.git_available = git_state.git_available;
        self.data.project_id = Some(git_state.project_id.clone());
        self.data.current_branch = git_state.current_branch.clone();
        self.data.current_commit = git_state.current_commit.clone();
        self.data.files_processed = 0;
        self.data.chunks_indexed = 0;
        self.data.failed_files = 0;
        self.data.error_message = None;
        self.save()
    }

    pub fn complete_indexing(&mut self) -> Result<()> {
        self.data.status = IndexingStatus::Completed;
        self.data.indexed_at = Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        self.data.last_index_timestamp = now_epoch();
        self.save()
    }

    pub fn fail_indexing(&mut self, error_message: Option<&str>) -> Result<()> {
        self.data.status = IndexingStatus::Failed;
        self.data.error_message = error_message.map(|s| s.to_string());
        self.save()
    }

    /// Timestamp to resume incremental indexing from, with a safety buffer
    /// going back to catch files the last pass may have missed. Returns 0
    /// when a full index is needed.
    pub fn get_resume_timestamp(&self, safety_buffer: Duration) -> f64 {
        match self.data.status {
            IndexingStatus::InProgress | IndexingStatus::Completed => {}
            _ => return 0.0,
        }
        let last = self.data.last_index_timestamp;
        if last <= 0.0 || !last.is_finite() {
            return 0.0;
        }
        (last - safety_buffer.as_secs_f64()).max(0.0)
    }

    /// A provider, model, git availability, or project identity change
    /// forces a full reindex regardless of status.
    pub fn should_force_full_index(
        &self,
        current_provider: &str,
        current_model: &str,
        git_state: &GitState,
    ) -> bool {
        if self.data.embedding_provider.as_deref() != Some(current_provider)
            || self.data.embedding_model.as_deref() != Some(current_model)
        {
            return true;
        }
        if self.data.git_available != git_state.git_available {
            return true;
        }
        if self.data.project_id.as_deref() != Some(git_state.project_id.as_str()) {
            return true;
        }
        false
    }

    /// Record the full work list for resumability, resetting progress.
    pub fn set_files_to_index(&mut self, paths: &[PathBuf]) -> Result<()> {
        self.data.files_to_index = paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        self.data.total_files_to_index = self.data.files_to_index.len();
        self.data.current_file_index = 0;
        self.data.completed_files = Vec::new();
        self.data.failed_file_paths = Vec::new();
        self.save()
    }

    /// Files still pending in the current work list.
    pub fn get_remaining_files(&self) -> Vec<String> {
        if self.data.current_file_index < self.data.files_to_index.len() {
            self.data.files_to_index[self.data.current_file_index..].to_vec()
        } else {
            Vec::new()
        }
    }

    pub fn mark_file_completed(&mut self, file_path: &str, chunks_count: u64) -> Result<()> {
        if !self.data.completed_files.iter().any(|f| f == file_path) {
            self.data.completed_files.push(file_path.to_string());
        }
        self.data.current_file_index += 1;
        self.data.files_processed = self.data.completed_files.len() as u64;
        self.data.chunks_indexed += chunks_count;
        self.data.last_index_timestamp = now_epoch();
        self.save()
    }

    pub fn mark_file_failed(&mut self, file_path: &str) -> Result<()> {
        if !self.data.failed_file_paths.iter().any(|f| f == file_path) {
            self.data.failed_file_paths.push(file_path.to_string());
        }
        self.data.current_file_index += 1;
        self.data.failed_files = self.data.failed_file_paths.len() as u64;
        self.save()
    }

    /// True when an interrupted run left work behind that can continue.
    pub fn can_resume_interrupted(&self) -> bool {
        self.data.status == IndexingStatus::InProgress
            && !self.data.files_to_index.is_empty()
            && self.data.current_file_index < self.data.files_to_index.len()
    }

    pub fn get_current_branch(&self) -> String {
        self.data
            .current_branch
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Update the current branch under an exclusive file lock so daemon and
    /// CLI writers do not clobber each other. Falls back to an in-memory
    /// update plus save when the file does not exist yet.
    pub fn update_current_branch(&mut self, branch_name: &str) -> Result<()> {
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CidxError::io(parent, e))?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.metadata_path);

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.data.current_branch = Some(branch_name.to_string());
                return self.save();
            }
            Err(e) => return Err(CidxError::io(&self.metadata_path, e)),
        };

        file.lock_exclusive()
            .map_err(|e| CidxError::io(&self.metadata_path, e))?;

        let result = (|| -> Result<()> {
            let mut content = String::new();
            file.read_to_string(&mut content)
                .map_err(|e| CidxError::io(&self.metadata_path, e))?;

            // Corrupt on-disk content falls back to the in-memory state
            let mut current: MetadataFile =
                serde_json::from_str(&content).unwrap_or_else(|_| self.data.clone());
            current.current_branch = Some(branch_name.to_string());

            let serialized = serde_json::to_string_pretty(&current)?;
            file.seek(SeekFrom::Start(0))
                .map_err(|e| CidxError::io(&self.metadata_path, e))?;
            file.set_len(0)
                .map_err(|e| CidxError::io(&self.metadata_path, e))?;
            file.write_all(serialized.as_bytes())
                .map_err(|e| CidxError::io(&self.metadata_path, e))?;

            self.data = current;
            Ok(())
        })();

        let _ = file.unlock();
        result
    }

    /// Read the current branch with a non-blocking shared lock. Returns the
    /// fallback instead of spinning when the lock cannot be acquired.
    pub fn get_current_branch_with_retry(&self, fallback: &str, max_retries: u32) -> String {
        for attempt in 0..=max_retries {
            if !self.metadata_path.exists() {
                return fallback.to_string();
            }

            let read = || -> Option<String> {
                let file = std::fs::File::open(&self.metadata_path).ok()?;
                file.try_lock_shared().ok()?;
                let content = std::fs::read_to_string(&self.metadata_path).ok();
                let _ = file.unlock();
                let data: MetadataFile = serde_json::from_str(&content?).ok()?;
                data.current_branch
            };

            match read() {
                Some(branch) => return branch,
                None if attempt < max_retries => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                None => break,
            }
        }
        fallback.to_string()
    }

    pub fn get_last_indexed_commit(&self, branch: &str) -> Option<String> {
        self.data.branch_commit_watermarks.get(branch).cloned()
    }

    pub fn update_commit_watermark(&mut self, branch: &str, commit_hash: &str) -> Result<()> {
        self.data
            .branch_commit_watermarks
            .insert(branch.to_string(), commit_hash.to_string());
        self.data.last_commit_check_timestamp = now_epoch();
        self.save()
    }

    pub fn clear_commit_watermarks(&mut self) -> Result<()> {
        self.data.branch_commit_watermarks.clear();
        self.data.last_commit_check_timestamp = 0.0;
        self.save()
    }

    pub fn get_all_commit_watermarks(&self) -> HashMap<String, String> {
        self.data.branch_commit_watermarks.clone()
    }

    /// Current statistics surfaced through `get_status`.
    pub fn get_stats(&self) -> serde_json::Value {
        let can_resume_incremental = matches!(
            self.data.status,
            IndexingStatus::InProgress | IndexingStatus::Completed
        ) && self.data.last_index_timestamp > 0.0;

        serde_json::json!({
            "status": self.data.status,
            "last_indexed": self.data.indexed_at,
            "files_processed": self.data.files_processed,
            "chunks_indexed": self.data.chunks_indexed,
            "failed_files": self.data.failed_files,
            "embedding_provider": self.data.embedding_provider,
            "embedding_model": self.data.embedding_model,
            "project_id": self.data.project_id,
            "current_branch": self.data.current_branch,
            "can_resume": can_resume_incremental,
            "can_resume_interrupted": self.can_resume_interrupted(),
            "total_files_to_index": self.data.total_files_to_index,
            "current_file_index": self.data.current_file_index,
            "remaining_files": self
                .data
                .total_files_to_index
                .saturating_sub(self.data.current_file_index),
        })
    }

    /// Reset everything for a fresh start.
    pub fn clear(&mut self) -> Result<()> {
        debug!("clearing progressive metadata at {}", self.metadata_path.display());
        self.data = MetadataFile::default();
        self.save()
    }

    /// Reload from disk, tolerating corruption the same way `load` does.
    pub fn refresh(&mut self) {
        let reloaded = Self::load(&self.metadata_path);
        if reloaded.metadata_path.exists() {
            self.data = reloaded.data;
        } else {
            warn!("metadata file vanished, keeping in-memory state");
        }
    }
}
