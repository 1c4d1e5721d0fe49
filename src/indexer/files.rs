//! File discovery for indexing.
//!
//! Walks the codebase with gitignore semantics (via the `ignore` crate),
//! filters by configured extensions and excluded directories, and returns
//! stable sorted orderings so progress numbers stay comparable across runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use tracing::debug;

use crate::config::IndexingSection;
use crate::constants::ALWAYS_EXCLUDED;

pub struct FileFinder {
    root: PathBuf,
    extensions: HashSet<String>,
    excluded_dirs: HashSet<String>,
    max_file_size: Option<u64>,
}

impl FileFinder {
    pub fn new(root: impl Into<PathBuf>, config: &IndexingSection) -> Self {
        let extensions = config
            .file_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let mut excluded_dirs: HashSet<String> =
            ALWAYS_EXCLUDED.iter().map(|d| d.to_string()).collect();
        excluded_dirs.extend(config.exclude_dirs.iter().cloned());

        Self {
            root: root.into(),
            extensions,
            excluded_dirs,
            max_file_size: config.max_file_size_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True when a path has an indexable extension and is outside every
    /// excluded directory. Used by the watch handler on event paths.
    pub fn is_indexable(&self, path: &Path) -> bool {
        if path
            .components()
            .any(|c| match c.as_os_str().to_str() {
                Some(name) => self.excluded_dirs.contains(name),
                None => false,
            })
        {
            return false;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.contains(&ext.to_lowercase()),
            None => false,
        }
    }

    /// All indexable files under the root, sorted for stable ordering.
    pub fn find_files(&self) -> Vec<PathBuf> {
        let mut walker = WalkBuilder::new(&self.root);
        walker.hidden(false).follow_links(false);

        let excluded = self.excluded_dirs.clone();
        walker.filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            !excluded.contains(name.as_ref())
        });

        let mut files = Vec::new();
        for entry in walker.build().flatten() {
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            if !self.is_indexable(path) {
                continue;
            }
            if let Some(max) = self.max_file_size {
                if entry.metadata().map(|m| m.len() > max).unwrap_or(false) {
                    continue;
                }
            }
            files.push(path.to_path_buf());
        }

        files.sort();
        debug!("discovered {} indexable files under {}", files.len(), self.root.display());
        files
    }

    /// Files modified at or after `since` (epoch seconds), same ordering
    /// guarantees as [`find_files`](Self::find_files).
    pub fn find_modified_files(&self, since: f64) -> Vec<PathBuf> {
        self.find_files()
            .into_iter()
            .filter(|path| file_mtime(path).map(|m| m >= since).unwrap_or(false))
            .collect()
    }
}

/// Filesystem mtime as epoch seconds.
pub fn file_mtime(path: &Path) -> Option<f64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}
