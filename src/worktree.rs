//! Git worktree manager
//!
//! Provides a checked-out directory on a named branch for a pipeline run.
//! Every mutation (`prune`, `add`, `remove`) runs under the repository lock;
//! a stale worktree directory whose metadata is gone is discarded at the
//! start of every `create`.

use crate::repo_lock::{RepoLockError, RepoLockRegistry};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("branch '{0}' is already checked out in another worktree")]
    BranchAlreadyCheckedOut(String),

    #[error("git {op} failed: {stderr}")]
    Git { op: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Lock(#[from] RepoLockError),
}

/// Creates and removes worktrees for one repository root.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    locks: Arc<RepoLockRegistry>,
}

impl WorktreeManager {
    pub fn new(repo_root: PathBuf, locks: Arc<RepoLockRegistry>) -> Self {
        Self { repo_root, locks }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Create (or recover) a worktree for `branch` at `target`.
    ///
    /// Under the repo lock: prune stale metadata, discard a stale directory,
    /// then `git worktree add`, creating the branch when it does not exist.
    pub async fn create(&self, branch: &str, target: &Path) -> Result<PathBuf, WorktreeError> {
        let _guard = self.locks.acquire(&self.repo_root).await?;

        // Drop metadata for worktrees whose directories are gone.
        self.git(&["worktree", "prune"]).await?;

        // A leftover directory without git metadata would make `add` fail.
        if target.exists() && !target.join(".git").exists() {
            debug!(target = %target.display(), "discarding stale worktree directory");
            std::fs::remove_dir_all(target)?;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let target_str = target.display().to_string();

        // Try creating the branch; fall back to checking out an existing one.
        let created = self
            .git(&["worktree", "add", "-b", branch, &target_str])
            .await;
        match created {
            Ok(_) => Ok(target.to_path_buf()),
            Err(WorktreeError::Git { stderr, .. })
                if stderr.contains("already exists") || stderr.contains("already used") =>
            {
                let out = self.git(&["worktree", "add", &target_str, branch]).await;
                match out {
                    Ok(_) => Ok(target.to_path_buf()),
                    Err(WorktreeError::Git { stderr, .. })
                        if stderr.contains("already checked out")
                            || stderr.contains("already used by worktree") =>
                    {
                        Err(WorktreeError::BranchAlreadyCheckedOut(branch.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            Err(WorktreeError::Git { stderr, .. })
                if stderr.contains("already checked out")
                    || stderr.contains("already used by worktree") =>
            {
                Err(WorktreeError::BranchAlreadyCheckedOut(branch.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a worktree, tolerating one that git no longer recognizes.
    pub async fn remove(&self, worktree: &Path) -> Result<(), WorktreeError> {
        let _guard = self.locks.acquire(&self.repo_root).await?;

        let path_str = worktree.display().to_string();
        match self
            .git(&["worktree", "remove", "--force", &path_str])
            .await
        {
            Ok(_) => Ok(()),
            Err(WorktreeError::Git { stderr, .. })
                if stderr.contains("not a working tree") || stderr.contains("is not a working") =>
            {
                warn!(path = %worktree.display(), "worktree unknown to git, removing directory");
                if worktree.exists() {
                    std::fs::remove_dir_all(worktree)?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn git(&self, args: &[&str]) -> Result<Output, WorktreeError> {
        let output = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo_root)
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(WorktreeError::Git {
                op: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
