//! Process-wide repository lock registry
//!
//! Serializes all git worktree mutations targeting the same repository while
//! unrelated repositories proceed in parallel. Keys are canonicalized
//! (symlink-resolved, absolute) repo roots, so distinct raw paths to one repo
//! share one lock. Entries are created atomically on first use and never
//! removed; the table is bounded by the number of distinct repositories the
//! process touches.
//!
//! The lock is held only around git operations, never across adapter
//! execution.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Default acquisition timeout
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// The process-wide lock table. Entries are created on first use and never
/// removed; every registry instance shares this map so serialization holds
/// across independent executors in one process.
static LOCK_TABLE: Lazy<DashMap<PathBuf, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

#[derive(Debug, Error)]
pub enum RepoLockError {
    #[error("timed out after {waited:?} acquiring repository lock for '{repo}'")]
    AcquisitionTimeout { repo: String, waited: Duration },

    #[error("cancelled while waiting for repository lock for '{repo}'")]
    Cancelled { repo: String },

    #[error("cannot canonicalize repository path '{path}': {source}")]
    Canonicalize {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Held repository lock; released on drop (idempotent, panic-safe).
#[derive(Debug)]
pub struct RepoLockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Handle onto the process-wide canonical-path → single-slot lock table.
/// Only the acquisition timeout is per-instance.
#[derive(Debug)]
pub struct RepoLockRegistry {
    timeout: Duration,
}

impl Default for RepoLockRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ACQUIRE_TIMEOUT)
    }
}

impl RepoLockRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve a repo path to its lock key.
    pub fn canonicalize(path: &Path) -> Result<PathBuf, RepoLockError> {
        std::fs::canonicalize(path).map_err(|source| RepoLockError::Canonicalize {
            path: path.display().to_string(),
            source,
        })
    }

    fn slot(&self, canonical: PathBuf) -> Arc<Mutex<()>> {
        // DashMap entry API: atomic load-or-store, no duplicate locks under
        // concurrent first use.
        LOCK_TABLE
            .entry(canonical)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the single slot for `repo`, waiting at most the configured
    /// timeout.
    pub async fn acquire(&self, repo: &Path) -> Result<RepoLockGuard, RepoLockError> {
        let canonical = Self::canonicalize(repo)?;
        let slot = self.slot(canonical);
        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(RepoLockGuard { _guard: guard }),
            Err(_) => Err(RepoLockError::AcquisitionTimeout {
                repo: repo.display().to_string(),
                waited: self.timeout,
            }),
        }
    }

    /// Acquire, racing the timeout against a cancellation token.
    pub async fn acquire_cancellable(
        &self,
        repo: &Path,
        cancel: &CancellationToken,
    ) -> Result<RepoLockGuard, RepoLockError> {
        let canonical = Self::canonicalize(repo)?;
        let slot = self.slot(canonical);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RepoLockError::Cancelled {
                repo: repo.display().to_string(),
            }),
            acquired = tokio::time::timeout(self.timeout, slot.lock_owned()) => {
                match acquired {
                    Ok(guard) => Ok(RepoLockGuard { _guard: guard }),
                    Err(_) => Err(RepoLockError::AcquisitionTimeout {
                        repo: repo.display().to_string(),
                        waited: self.timeout,
                    }),
                }
            }
        }
    }

    /// Number of distinct repositories the process has locked so far.
    pub fn len(&self) -> usize {
        LOCK_TABLE.len()
    }

    pub fn is_empty(&self) -> bool {
        LOCK_TABLE.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[tokio::test]
    async fn same_repo_serializes() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(RepoLockRegistry::default());
        let in_section = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            let path = dir.path().to_path_buf();
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire(&path).await.unwrap();
                let now = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "slot is single-capacity");
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn distinct_repos_do_not_block_each_other() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let registry = RepoLockRegistry::default();

        let _ga = registry.acquire(a.path()).await.unwrap();
        // Held lock on `a` must not stall `b`.
        let gb = tokio::time::timeout(Duration::from_millis(200), registry.acquire(b.path()))
            .await
            .expect("acquire on unrelated repo should not wait");
        assert!(gb.is_ok());
    }

    #[tokio::test]
    async fn acquisition_times_out_when_held() {
        let dir = TempDir::new().unwrap();
        let registry = RepoLockRegistry::new(Duration::from_millis(50));

        let _held = registry.acquire(dir.path()).await.unwrap();
        let err = registry.acquire(dir.path()).await.unwrap_err();
        assert!(matches!(err, RepoLockError::AcquisitionTimeout { .. }));
    }

    #[tokio::test]
    async fn release_on_drop_frees_slot() {
        let dir = TempDir::new().unwrap();
        let registry = RepoLockRegistry::new(Duration::from_millis(200));

        {
            let _guard = registry.acquire(dir.path()).await.unwrap();
        }
        assert!(registry.acquire(dir.path()).await.is_ok());
    }

    #[tokio::test]
    async fn cancellation_interrupts_wait() {
        let dir = TempDir::new().unwrap();
        let registry = RepoLockRegistry::new(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let _held = registry.acquire(dir.path()).await.unwrap();
        cancel.cancel();
        let err = registry
            .acquire_cancellable(dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RepoLockError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinked_paths_share_one_lock() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("repo");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("repo-link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let registry = RepoLockRegistry::new(Duration::from_millis(50));
        let _guard = registry.acquire(&real).await.unwrap();
        let err = registry.acquire(&link).await.unwrap_err();
        assert!(
            matches!(err, RepoLockError::AcquisitionTimeout { .. }),
            "symlink must resolve to the same lock key"
        );
    }

    #[tokio::test]
    async fn missing_path_fails_canonicalize() {
        let registry = RepoLockRegistry::default();
        let err = registry.acquire(Path::new("/definitely/not/here")).await;
        assert!(matches!(err, Err(RepoLockError::Canonicalize { .. })));
    }
}
