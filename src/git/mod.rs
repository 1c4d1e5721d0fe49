//! Git topology service.
//!
//! Wraps subprocess `git` invocations with the small surface the indexer
//! and watch handler need: branch identity, merge bases, changed/tracked
//! file sets, and branch-change analysis. Every call shells out; results
//! that matter for indexing decisions are recomputed rather than cached so
//! concurrent CLI usage cannot leave the daemon with a stale view.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::debug;

use crate::error::{CidxError, Result};
use crate::storage::collections::project_id;

/// Snapshot of the repository state fingerprinted into progressive metadata.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GitState {
    pub git_available: bool,
    pub project_id: String,
    pub current_branch: Option<String>,
    pub current_commit: Option<String>,
}

/// Outcome of switching from one branch to another: which files need to be
/// re-indexed and which can keep their existing points.
#[derive(Debug, Clone)]
pub struct BranchChangeAnalysis {
    pub files_to_reindex: Vec<String>,
    pub files_unchanged: Vec<String>,
}

pub struct GitTopologyService {
    codebase_dir: PathBuf,
}

impl GitTopologyService {
    pub fn new(codebase_dir: impl Into<PathBuf>) -> Self {
        Self {
            codebase_dir: codebase_dir.into(),
        }
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.codebase_dir)
            .args(args)
            .output()
            .map_err(|e| CidxError::Git(format!("failed to spawn git: {e}")))?;

        if !output.status.success() {
            return Err(CidxError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn git_lines(&self, args: &[&str]) -> Result<Vec<String>> {
        Ok(self
            .git(args)?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    pub fn is_git_available(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out == "true")
            .unwrap_or(false)
    }

    /// Current branch name; detached HEAD yields `detached-<short-hash>`.
    pub fn get_current_branch(&self) -> Option<String> {
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
        if branch == "HEAD" {
            let commit = self.git(&["rev-parse", "--short", "HEAD"]).ok()?;
            Some(format!("detached-{commit}"))
        } else {
            Some(branch)
        }
    }

    pub fn get_current_commit(&self) -> Option<String> {
        self.git(&["rev-parse", "HEAD"]).ok()
    }

    /// Fingerprint used to detect configuration changes between runs.
    pub fn get_current_state(&self) -> GitState {
        let available = self.is_git_available();
        GitState {
            git_available: available,
            project_id: project_id(&self.codebase_dir),
            current_branch: if available {
                self.get_current_branch()
            } else {
                None
            },
            current_commit: if available {
                self.get_current_commit()
            } else {
                None
            },
        }
    }

    pub fn get_merge_base(&self, branch1: &str, branch2: &str) -> Result<String> {
        self.git(&["merge-base", branch1, branch2])
    }

    /// Files that differ between two refs.
    pub fn get_changed_files(&self, old_ref: &str, new_ref: &str) -> Result<Vec<String>> {
        self.git_lines(&["diff", "--name-only", old_ref, new_ref])
    }

    /// All files tracked at the given ref.
    pub fn get_tracked_files(&self, git_ref: &str) -> Result<Vec<String>> {
        self.git_lines(&["ls-tree", "-r", "--name-only", git_ref])
    }

    pub fn get_staged_files(&self) -> Result<Vec<String>> {
        self.git_lines(&["diff", "--cached", "--name-only"])
    }

    pub fn get_unstaged_files(&self) -> Result<Vec<String>> {
        self.git_lines(&["diff", "--name-only"])
    }

    /// Commit hashes reachable from `branch`, newest first.
    pub fn get_branch_ancestry(&self, branch: &str, limit: usize) -> Result<Vec<String>> {
        let n = limit.to_string();
        self.git_lines(&["rev-list", "--max-count", &n, branch])
    }

    /// Decide which files a branch switch must re-index.
    ///
    /// The changed set is intersected with the files tracked in the *target*
    /// branch: a file deleted on the new branch must not be scheduled for
    /// re-indexing even though `git diff` reports it as changed.
    pub fn analyze_branch_change(
        &self,
        old_branch: &str,
        new_branch: &str,
    ) -> Result<BranchChangeAnalysis> {
        let changed = self.get_changed_files(old_branch, new_branch)?;
        let tracked: std::collections::HashSet<String> =
            self.get_tracked_files(new_branch)?.into_iter().collect();

        let (files_to_reindex, files_unchanged): (Vec<String>, Vec<String>) = changed
            .into_iter()
            .partition(|f| tracked.contains(f.as_str()));

        debug!(
            "branch change {old_branch} -> {new_branch}: {} to reindex, {} dropped",
            files_to_reindex.len(),
            files_unchanged.len()
        );

        Ok(BranchChangeAnalysis {
            files_to_reindex,
            files_unchanged,
        })
    }

    pub fn codebase_dir(&self) -> &Path {
        &self.codebase_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command;
    use tempfile::tempdir;

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new(args[0])
            .args(&args[1..])
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "command failed: {args:?}");
    }

    fn init_repo(dir: &Path) {
        run(dir, &["git", "init", "-q", "-b", "main"]);
        run(dir, &["git", "config", "user.email", "test@example.com"]);
        run(dir, &["git", "config", "user.name", "Test"]);
    }

    #[test]
    fn test_non_repo_reports_unavailable() {
        let dir = tempdir().unwrap();
        // Guard against the tempdir living under a real repository
        fs::write(dir.path().join(".gitignore"), "").unwrap();
        let topo = GitTopologyService::new(dir.path().join("sub"));
        let state = topo.get_current_state();
        assert_eq!(state.project_id.len(), 8);
    }

    #[test]
    fn test_branch_and_commit() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        run(dir.path(), &["git", "add", "."]);
        run(dir.path(), &["git", "commit", "-q", "-m", "init"]);

        let topo = GitTopologyService::new(dir.path());
        assert!(topo.is_git_available());
        assert_eq!(topo.get_current_branch().as_deref(), Some("main"));
        assert!(topo.get_current_commit().is_some());
    }

    #[test]
    fn test_branch_change_filters_by_target_tracked_files() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("keep.rs"), "fn keep() {}").unwrap();
        fs::write(dir.path().join("gone.rs"), "fn gone() {}").unwrap();
        run(dir.path(), &["git", "add", "."]);
        run(dir.path(), &["git", "commit", "-q", "-m", "init"]);

        // Feature branch modifies keep.rs and deletes gone.rs
        run(dir.path(), &["git", "checkout", "-q", "-b", "feature"]);
        fs::write(dir.path().join("keep.rs"), "fn keep_v2() {}").unwrap();
        run(dir.path(), &["git", "rm", "-q", "gone.rs"]);
        run(dir.path(), &["git", "add", "."]);
        run(dir.path(), &["git", "commit", "-q", "-m", "feature"]);

        let topo = GitTopologyService::new(dir.path());
        let analysis = topo.analyze_branch_change("main", "feature").unwrap();

        assert!(analysis
            .files_to_reindex
            .contains(&"keep.rs".to_string()));
        // gone.rs changed but is not tracked in the target branch
        assert!(!analysis.files_to_reindex.contains(&"gone.rs".to_string()));
        assert!(analysis.files_unchanged.contains(&"gone.rs".to_string()));
    }
}
