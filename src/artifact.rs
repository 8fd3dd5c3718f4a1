//! Artifact store
//!
//! File- and stdout-sourced artifacts live at
//! `<workspace_root>/artifacts/<run-id>/<step-id>/<name>`. Writes are atomic:
//! bytes land in a `.tmp` sibling and are renamed into place only when the
//! producing step succeeds, so a failed step leaves no artifact behind. The
//! in-process registry is keyed by (run, step, name) and survives until the
//! operator runs `wave clean`.

use crate::pipeline::{ArtifactSource, ArtifactType, OutputArtifactDef};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("step '{step}' declared file artifact '{name}' but '{path}' does not exist")]
    OutputMissing {
        step: String,
        name: String,
        path: String,
    },
}

/// Metadata for one committed artifact
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub run_id: String,
    pub step_id: String,
    pub name: String,
    pub artifact_type: ArtifactType,
    pub source: ArtifactSource,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

type Key = (String, String, String);

/// Single-writer (producing step), many-reader artifact store.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    root: PathBuf,
    registry: DashMap<Key, ArtifactRecord>,
}

impl ArtifactStore {
    /// `workspace_root` is the runtime workspace root; artifacts live under
    /// its `artifacts/` subtree.
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            root: workspace_root.join("artifacts"),
            registry: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resident path for an artifact.
    pub fn path_for(&self, run_id: &str, step_id: &str, name: &str) -> PathBuf {
        self.root.join(run_id).join(step_id).join(name)
    }

    /// Atomically persist bytes as a step output and register it.
    pub fn commit_bytes(
        &self,
        run_id: &str,
        step_id: &str,
        def: &OutputArtifactDef,
        bytes: &[u8],
    ) -> Result<ArtifactRecord, ArtifactError> {
        let final_path = self.path_for(run_id, step_id, &def.name);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = final_path.with_file_name(format!(".{}.tmp", def.name));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &final_path)?;

        let record = ArtifactRecord {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            name: def.name.clone(),
            artifact_type: def.artifact_type,
            source: def.source,
            path: final_path,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };
        self.register(record.clone());
        Ok(record)
    }

    /// Persist a file the step wrote in its workspace.
    pub fn commit_file(
        &self,
        run_id: &str,
        step_id: &str,
        def: &OutputArtifactDef,
        source_path: &Path,
    ) -> Result<ArtifactRecord, ArtifactError> {
        if !source_path.exists() {
            return Err(ArtifactError::OutputMissing {
                step: step_id.to_string(),
                name: def.name.clone(),
                path: source_path.display().to_string(),
            });
        }
        let bytes = std::fs::read(source_path)?;
        self.commit_bytes(run_id, step_id, def, &bytes)
    }

    /// Register a record directly (resume reuses on-disk artifacts).
    pub fn register(&self, record: ArtifactRecord) {
        self.registry.insert(
            (
                record.run_id.clone(),
                record.step_id.clone(),
                record.name.clone(),
            ),
            record,
        );
    }

    pub fn get(&self, run_id: &str, step_id: &str, name: &str) -> Option<ArtifactRecord> {
        self.registry
            .get(&(run_id.to_string(), step_id.to_string(), name.to_string()))
            .map(|r| r.clone())
    }

    /// Read an artifact's content as UTF-8.
    pub fn read_string(&self, record: &ArtifactRecord) -> Result<String, ArtifactError> {
        Ok(std::fs::read_to_string(&record.path)?)
    }

    /// All registered artifacts for a run.
    pub fn list_run(&self, run_id: &str) -> Vec<ArtifactRecord> {
        let mut records: Vec<ArtifactRecord> = self
            .registry
            .iter()
            .filter(|e| e.key().0 == run_id)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| (&a.step_id, &a.name).cmp(&(&b.step_id, &b.name)));
        records
    }
}
