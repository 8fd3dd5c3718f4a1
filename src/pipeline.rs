//! # Wave Pipeline Types
//!
//! Core types for `.wave.yaml` pipeline files: a named DAG of steps, each
//! binding a persona to a workspace, injected input artifacts, declared
//! output artifacts, and a handover contract.
//!
//! ```yaml
//! kind: WavePipeline
//! metadata:
//!   name: review
//! input:
//!   source: text
//! steps:
//!   - id: plan
//!     persona: navigator
//!     exec:
//!       source: "Survey the repo and plan: {{ input }}"
//!     output_artifacts:
//!       - name: tasks
//!         source: stdout
//!         type: json
//!     handover:
//!       contract:
//!         type: json_schema
//!         schema_path: schemas/tasks.json
//!   - id: execute
//!     persona: craftsman
//!     depends_on: [plan]
//!     strategy:
//!       type: matrix
//!       items_source: plan/tasks
//!       item_key: tasks
//!     exec:
//!       source: "Do this task: {{ task }}"
//! ```
//!
//! Closed sets (workspace kinds, artifact sources, contract types,
//! strategies) are tagged serde enums handled exhaustively; there is no
//! stringly-typed dispatch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error reading pipeline: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("pipeline kind must be 'WavePipeline', got '{0}'")]
    WrongKind(String),
}

/// Root pipeline structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub kind: String,
    pub metadata: PipelineMeta,
    #[serde(default)]
    pub input: InputDef,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InputDef {
    pub source: String,
}

impl Default for InputDef {
    fn default() -> Self {
        Self {
            source: "text".to_string(),
        }
    }
}

// ============================================================================
// STEP
// ============================================================================

/// One persona execution within one workspace
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub id: String,
    pub persona: String,

    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub workspace: WorkspaceKind,

    /// Always fresh: steps never inherit prior conversation state.
    #[serde(default)]
    pub memory: MemoryStrategy,

    pub exec: ExecDef,

    #[serde(default)]
    pub inject_artifacts: Vec<InjectArtifact>,

    #[serde(default)]
    pub output_artifacts: Vec<OutputArtifactDef>,

    #[serde(default)]
    pub handover: Option<Handover>,

    #[serde(default)]
    pub strategy: Option<Strategy>,

    #[serde(default)]
    pub timeout_minutes: Option<u64>,

    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Step {
    /// The step's handover contract, if declared.
    pub fn contract(&self) -> Option<&Contract> {
        self.handover.as_ref().map(|h| &h.contract)
    }

    /// Matrix strategy, if this step fans out.
    pub fn matrix(&self) -> Option<&MatrixDef> {
        match &self.strategy {
            Some(Strategy::Matrix(m)) => Some(m),
            None => None,
        }
    }

    /// Declared output artifact by name.
    pub fn output_artifact(&self, name: &str) -> Option<&OutputArtifactDef> {
        self.output_artifacts.iter().find(|a| a.name == name)
    }

    /// The stdout-sourced output artifact, if any (at most one is honored).
    pub fn stdout_artifact(&self) -> Option<&OutputArtifactDef> {
        self.output_artifacts
            .iter()
            .find(|a| a.source == ArtifactSource::Stdout)
    }
}

/// Prompt template for the step
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecDef {
    pub source: String,
}

/// Step workspace flavor
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkspaceKind {
    /// Source tree mounted into the workspace (read-only by default)
    Mount {
        #[serde(default = "default_mount_source")]
        source: PathBuf,
        #[serde(default)]
        access: AccessMode,
    },
    /// Git worktree on a branch named after the pipeline run id, shared by
    /// the run's steps that request it
    Worktree {
        #[serde(default)]
        repo: Option<PathBuf>,
    },
}

fn default_mount_source() -> PathBuf {
    PathBuf::from(".")
}

impl Default for WorkspaceKind {
    fn default() -> Self {
        WorkspaceKind::Mount {
            source: default_mount_source(),
            access: AccessMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Only fresh memory exists; the variant set is closed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    #[default]
    Fresh,
}

// ============================================================================
// ARTIFACTS
// ============================================================================

/// Artifact type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Json,
    #[default]
    Text,
    Markdown,
    Binary,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Json => "json",
            ArtifactType::Text => "text",
            ArtifactType::Markdown => "markdown",
            ArtifactType::Binary => "binary",
        }
    }
}

/// Where an output artifact's bytes come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    /// A file the step wrote inside its workspace
    #[default]
    File,
    /// The adapter's captured stdout
    Stdout,
}

/// Declared step output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputArtifactDef {
    pub name: String,
    /// Workspace-relative path for file-sourced artifacts
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub source: ArtifactSource,
    #[serde(default, rename = "type")]
    pub artifact_type: ArtifactType,
}

/// Declared step input, resolved from a dependency's output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InjectArtifact {
    pub from_step: String,
    pub name: String,
    /// Local alias beneath `<workspace>/artifacts/`; defaults to `name`
    #[serde(default)]
    pub alias: Option<String>,
    /// When declared, must equal the producer's declared type
    #[serde(default, rename = "type")]
    pub expected_type: Option<ArtifactType>,
    /// When declared, content must validate against this JSON Schema
    #[serde(default)]
    pub schema_path: Option<PathBuf>,
    #[serde(default)]
    pub optional: bool,
}

impl InjectArtifact {
    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

// ============================================================================
// HANDOVER CONTRACT
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Handover {
    pub contract: Contract,
}

/// Declarative rule applied to a step boundary
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Contract {
    #[serde(flatten)]
    pub kind: ContractKind,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub must_pass: bool,
}

impl Contract {
    /// `must_pass` escalates `warn` to `fail`.
    pub fn effective_on_failure(&self) -> OnFailure {
        match self.on_failure {
            OnFailure::Warn if self.must_pass => OnFailure::Fail,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractKind {
    /// Draft-07 JSON Schema over the primary output artifact
    JsonSchema { schema_path: PathBuf },
    /// Shell command run in the workspace; exit 0 passes
    TestSuite { command: String },
    /// Structural markdown check: required headings present
    MarkdownSpec { required_sections: Vec<String> },
    /// Content shape by regex pattern
    Format { pattern: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Retry,
    Fail,
    Warn,
}

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Strategy {
    Matrix(MatrixDef),
}

/// Fan out one worker per item of an array extracted from a dependency's
/// JSON artifact.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixDef {
    /// `<step_id>/<artifact_name>` of the JSON holding the items
    pub items_source: String,
    /// Key of the array inside that JSON
    pub item_key: String,
    #[serde(default = "default_matrix_concurrency")]
    pub max_concurrency: usize,
}

fn default_matrix_concurrency() -> usize {
    4
}

impl MatrixDef {
    /// Split `items_source` into (producing step, artifact name).
    pub fn source_parts(&self) -> Option<(&str, &str)> {
        self.items_source.split_once('/')
    }
}

// ============================================================================
// LOADING & RUN IDS
// ============================================================================

impl Pipeline {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let pipeline: Pipeline = serde_yaml::from_str(raw)?;
        if pipeline.kind != "WavePipeline" {
            return Err(PipelineError::WrongKind(pipeline.kind));
        }
        Ok(pipeline)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// `{pipeline-name}-{8 hex of crypto-random}`. UUIDv4 bytes come from the
    /// OS RNG; eight hex digits keep workspace paths short while making
    /// collisions between concurrent runs negligible.
    pub fn new_run_id(&self) -> String {
        let hex = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.metadata.name, &hex[..8])
    }
}
