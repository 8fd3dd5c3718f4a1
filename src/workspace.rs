//! Workspace builder and artifact injection
//!
//! Produces a step's working directory with exactly the inputs it is
//! permitted to see: a mounted source (read-only or read-write), injected
//! artifacts under `artifacts/<alias>`, and scratch space. Worktree-kind
//! workspaces reference a git worktree created by the executor under the
//! repository lock.

use crate::artifact::ArtifactStore;
use crate::pipeline::{AccessMode, InjectArtifact, Step, WorkspaceKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("IO error building workspace: {0}")]
    Io(#[from] std::io::Error),

    #[error("required artifact '{name}' from step '{from_step}' is missing")]
    MissingRequiredArtifact { from_step: String, name: String },

    #[error(
        "artifact '{name}' from step '{from_step}' is '{actual}' but '{expected}' was declared"
    )]
    ArtifactTypeMismatch {
        from_step: String,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("mount source '{0}' does not exist")]
    MountSourceMissing(String),
}

/// A step's working directory
#[derive(Debug, Clone)]
pub struct Workspace {
    /// `<workspace_root>/<run-id>/<step-instance>`
    pub dir: PathBuf,
    /// Injected artifacts land here, one entry per alias
    pub artifacts_dir: PathBuf,
    /// Symlink to the mounted source, when mount-kind
    pub source: Option<PathBuf>,
    pub access: AccessMode,
    /// Checked-out worktree directory, when worktree-kind
    pub worktree: Option<PathBuf>,
}

impl Workspace {
    /// Directory whose mutations count as the step's file deltas.
    pub fn write_surface(&self) -> &Path {
        if let Some(wt) = &self.worktree {
            return wt;
        }
        if self.access == AccessMode::ReadWrite {
            if let Some(src) = &self.source {
                return src;
            }
        }
        &self.dir
    }
}

/// One materialized injection
#[derive(Debug, Clone)]
pub struct InjectedArtifact {
    pub alias: String,
    /// `None` when the artifact was optional and absent
    pub path: Option<PathBuf>,
    pub def: InjectArtifact,
}

/// Builds per-step directories beneath the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    ws_root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(ws_root: PathBuf) -> Self {
        Self { ws_root }
    }

    pub fn step_dir(&self, run_id: &str, step_instance: &str) -> PathBuf {
        self.ws_root.join(run_id).join(step_instance)
    }

    /// Create the step directory and bind its source.
    ///
    /// `step_instance` is the step id, or `<step-id>/worker-<n>` for matrix
    /// workers. `worktree` is the run's checked-out branch directory when the
    /// step requests worktree kind (created by the executor under the repo
    /// lock before this call).
    pub fn build(
        &self,
        run_id: &str,
        step_instance: &str,
        step: &Step,
        worktree: Option<PathBuf>,
    ) -> Result<Workspace, WorkspaceError> {
        let dir = self.step_dir(run_id, step_instance);
        let artifacts_dir = dir.join("artifacts");
        std::fs::create_dir_all(&artifacts_dir)?;

        let (source, access) = match &step.workspace {
            WorkspaceKind::Worktree { .. } => (None, AccessMode::ReadWrite),
            WorkspaceKind::Mount {
                source, access, ..
            } => {
                let canonical = std::fs::canonicalize(source).map_err(|_| {
                    WorkspaceError::MountSourceMissing(source.display().to_string())
                })?;
                let link = dir.join("source");
                if !link.exists() {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&canonical, &link)?;
                    #[cfg(not(unix))]
                    std::fs::create_dir_all(&link)?;
                }
                (Some(canonical), *access)
            }
        };

        debug!(run = run_id, step = step_instance, dir = %dir.display(), "workspace ready");
        Ok(Workspace {
            dir,
            artifacts_dir,
            source,
            access,
            worktree,
        })
    }

    /// Materialize the step's `inject_artifacts` into the workspace.
    ///
    /// Existence and declared-type checks run here, before the adapter
    /// starts; schema checks follow via the contract validator.
    pub fn inject(
        &self,
        workspace: &Workspace,
        run_id: &str,
        step: &Step,
        store: &ArtifactStore,
    ) -> Result<Vec<InjectedArtifact>, WorkspaceError> {
        let mut injected = Vec::with_capacity(step.inject_artifacts.len());

        for def in &step.inject_artifacts {
            let record = store.get(run_id, &def.from_step, &def.name);
            let record = match record {
                Some(r) if r.path.exists() => r,
                _ if def.optional => {
                    injected.push(InjectedArtifact {
                        alias: def.alias().to_string(),
                        path: None,
                        def: def.clone(),
                    });
                    continue;
                }
                _ => {
                    return Err(WorkspaceError::MissingRequiredArtifact {
                        from_step: def.from_step.clone(),
                        name: def.name.clone(),
                    });
                }
            };

            if let Some(expected) = def.expected_type {
                if expected != record.artifact_type {
                    return Err(WorkspaceError::ArtifactTypeMismatch {
                        from_step: def.from_step.clone(),
                        name: def.name.clone(),
                        expected: expected.as_str().to_string(),
                        actual: record.artifact_type.as_str().to_string(),
                    });
                }
            }

            let local = workspace.artifacts_dir.join(def.alias());
            std::fs::copy(&record.path, &local)?;
            injected.push(InjectedArtifact {
                alias: def.alias().to_string(),
                path: Some(local),
                def: def.clone(),
            });
        }

        Ok(injected)
    }
}
