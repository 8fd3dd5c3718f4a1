//! # Wave Manifest
//!
//! Process-wide configuration: the named set of adapters (external LLM CLI
//! binaries), the named set of personas (adapter + system prompt + permission
//! set), and runtime settings.
//!
//! The manifest is loaded once per process and never mutated during
//! execution. Loading fails fast: every persona must reference a declared
//! adapter and an existing system prompt file.
//!
//! ```yaml
//! apiVersion: wave/v1
//! kind: WaveManifest
//! metadata:
//!   name: my-project
//! adapters:
//!   claude:
//!     binary: claude
//!     mode: stream_json
//! personas:
//!   craftsman:
//!     adapter: claude
//!     system_prompt_file: personas/craftsman.md
//!     permissions:
//!       allowed_tools: ["Read", "Edit", "Bash(git:*)"]
//!       deny: ["Bash(rm:*)"]
//! runtime:
//!   workspace_root: .wave/workspace
//!   max_concurrent_workers: 4
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default bound for captured stdout artifacts (10 MiB)
pub const DEFAULT_MAX_STDOUT_SIZE: usize = 10 * 1024 * 1024;

/// Default persona context budget when unspecified (tokens)
pub const DEFAULT_CONTEXT_BUDGET: u64 = 200_000;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("IO error reading manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("manifest parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("manifest kind must be 'WaveManifest', got '{0}'")]
    WrongKind(String),

    #[error("persona '{persona}' references unknown adapter '{adapter}'")]
    UnknownAdapter { persona: String, adapter: String },

    #[error("persona '{persona}' system prompt file not found: {path}")]
    MissingPromptFile { persona: String, path: String },

    #[error("relay summarizer persona '{0}' is not defined")]
    UnknownSummarizer(String),
}

/// Root manifest structure
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMeta,
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterDef>,
    #[serde(default)]
    pub personas: BTreeMap<String, PersonaDef>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Optional label-routing table consulted when no pipeline is named.
    #[serde(default)]
    pub routing: Option<RoutingConfig>,

    /// Directory the manifest was loaded from; prompt paths resolve here.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Label-based pipeline selection rules
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<crate::router::RouterRule>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestMeta {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// How an adapter binary is invoked and how its output is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterMode {
    /// Prompt as argument, plain stdout, token usage estimated
    Oneshot,
    /// NDJSON event stream with per-turn usage blocks
    #[default]
    StreamJson,
    /// No subprocess; echoes the prompt with deterministic token counts
    Mock,
}

/// External LLM CLI tool declaration
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterDef {
    /// Binary name or path
    pub binary: String,
    #[serde(default)]
    pub mode: AdapterMode,
    /// Invocation arguments. `{prompt}` and `{settings}` are substituted;
    /// when `{prompt}` is absent the prompt is appended as the last argument.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Named identity: one adapter + system prompt + permission set
#[derive(Debug, Clone, Deserialize)]
pub struct PersonaDef {
    pub adapter: String,
    pub system_prompt_file: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub hooks: Option<HookSet>,
    /// Context window budget in tokens; relay triggers against this.
    #[serde(default)]
    pub context_budget: Option<u64>,
}

impl PersonaDef {
    pub fn context_budget(&self) -> u64 {
        self.context_budget.unwrap_or(DEFAULT_CONTEXT_BUDGET)
    }
}

/// Per-persona tool permission boundary. Denies beat allows; a non-empty
/// allow list means everything unlisted is denied.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Shell hooks run around a step (recorded in the audit log)
#[derive(Debug, Clone, Deserialize)]
pub struct HookSet {
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

// ============================================================================
// RUNTIME SETTINGS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub workspace_root: PathBuf,
    pub state_root: PathBuf,
    pub max_concurrent_workers: usize,
    pub default_timeout_minutes: u64,
    pub default_max_retries: u32,
    pub repo_lock_timeout_secs: u64,
    pub relay: RelayConfig,
    pub artifacts: ArtifactsConfig,
    pub audit: AuditConfig,
    pub sandbox: SandboxConfig,
    pub meta_pipeline: MetaPipelineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(".wave/workspace"),
            state_root: PathBuf::from(".wave/state"),
            max_concurrent_workers: 4,
            default_timeout_minutes: 30,
            default_max_retries: 2,
            repo_lock_timeout_secs: 30,
            relay: RelayConfig::default(),
            artifacts: ArtifactsConfig::default(),
            audit: AuditConfig::default(),
            sandbox: SandboxConfig::default(),
            meta_pipeline: MetaPipelineConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Percent of the persona's context budget at which compaction triggers
    pub token_threshold_percent: u8,
    /// Persona used to produce the checkpoint document
    pub summarizer_persona: Option<String>,
    /// Hard token cap for the summarizer itself
    pub summarizer_token_cap: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token_threshold_percent: 80,
            summarizer_persona: None,
            summarizer_token_cap: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub max_stdout_size: usize,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            max_stdout_size: DEFAULT_MAX_STDOUT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub log_dir: Option<PathBuf>,
    pub log_all_tool_calls: bool,
    pub log_all_file_operations: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub default_allowed_domains: Vec<String>,
    /// Host environment variables forwarded to adapter subprocesses
    pub env_passthrough: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetaPipelineConfig {
    pub max_depth: u32,
    pub max_total_steps: usize,
    pub max_total_tokens: u64,
    pub timeout_minutes: u64,
}

impl Default for MetaPipelineConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_total_steps: 12,
            max_total_tokens: 2_000_000,
            timeout_minutes: 120,
        }
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl Manifest {
    /// Load a manifest from a YAML or JSON file and verify all references.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path)?;
        let mut manifest: Manifest = serde_yaml::from_str(&raw)?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        manifest.verify()?;
        Ok(manifest)
    }

    /// Parse from a string (base dir = cwd). Used by tests and meta pipelines.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_yaml::from_str(raw)?;
        manifest.base_dir = base_dir.to_path_buf();
        manifest.verify()?;
        Ok(manifest)
    }

    /// Invariant: every persona's adapter and prompt file resolve at load time.
    fn verify(&self) -> Result<(), ManifestError> {
        if self.kind != "WaveManifest" {
            return Err(ManifestError::WrongKind(self.kind.clone()));
        }
        for (name, persona) in &self.personas {
            if !self.adapters.contains_key(&persona.adapter) {
                return Err(ManifestError::UnknownAdapter {
                    persona: name.clone(),
                    adapter: persona.adapter.clone(),
                });
            }
            let prompt_path = self.prompt_path(persona);
            if !prompt_path.exists() {
                return Err(ManifestError::MissingPromptFile {
                    persona: name.clone(),
                    path: prompt_path.display().to_string(),
                });
            }
        }
        if let Some(summarizer) = &self.runtime.relay.summarizer_persona {
            if !self.personas.contains_key(summarizer) {
                return Err(ManifestError::UnknownSummarizer(summarizer.clone()));
            }
        }
        Ok(())
    }

    /// Absolute path of a persona's system prompt file.
    pub fn prompt_path(&self, persona: &PersonaDef) -> PathBuf {
        let p = Path::new(&persona.system_prompt_file);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    pub fn persona(&self, name: &str) -> Option<&PersonaDef> {
        self.personas.get(name)
    }

    pub fn adapter_for(&self, persona: &PersonaDef) -> &AdapterDef {
        // verify() guarantees presence
        &self.adapters[&persona.adapter]
    }

    /// Read a persona's system prompt content.
    pub fn system_prompt(&self, persona: &PersonaDef) -> Result<String, ManifestError> {
        Ok(std::fs::read_to_string(self.prompt_path(persona))?)
    }
}
