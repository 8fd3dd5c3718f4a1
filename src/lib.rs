//! # Wave
//!
//! Wave orchestrates multiple isolated invocations of external LLM
//! command-line tools ("adapters") through declared multi-step pipelines,
//! enforcing per-step identities ("personas"), permission boundaries,
//! artifact-based handover under contract validation, context-window relay,
//! and safe concurrent execution across independent runs of the same
//! repository.
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`manifest`] | Process config: adapters, personas, runtime settings |
//! | [`pipeline`] | Pipeline/step YAML model (tagged variants throughout) |
//! | [`dag`] | Acyclicity + reference lint, execution graph |
//! | [`repo_lock`] | Canonical-path repository lock registry |
//! | [`worktree`] | Git worktree create/remove under the repo lock |
//! | [`workspace`] | Per-step directories, mounts, artifact injection |
//! | [`artifact`] | Atomic artifact store and handover registry |
//! | [`template`] | Single-pass prompt template resolver |
//! | [`driver`] | Adapter subprocess supervision and stream parsing |
//! | [`contract`] | JSON Schema / test-suite / markdown / format contracts |
//! | [`retry`] | Error classification, backoff, prompt enhancement |
//! | [`relay`] | Token-threshold context compaction |
//! | [`executor`] | Ready-set scheduling, matrix fan-out, resume |
//! | [`router`] | Label routing, ad-hoc and meta pipelines |
//! | [`state`] | Crash-safe SQLite state store |
//! | [`events`] | NDJSON/human/broadcast progress events |
//! | [`security`] | Sanitization, path validation, credential scrubbing |
//! | [`audit`] | Per-run NDJSON audit log |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wave::{Manifest, Pipeline, PipelineExecutor, StateStore, EventEmitter};
//!
//! let manifest = Arc::new(Manifest::load("wave.yaml".as_ref())?);
//! let store = Arc::new(StateStore::open(&manifest.runtime.state_root)?);
//! let emitter = EventEmitter::new(wave::security::Redactor::from_env());
//!
//! let pipeline = Pipeline::load("pipelines/review.wave.yaml".as_ref())?;
//! let executor = PipelineExecutor::new(manifest, store, emitter);
//! let outcome = executor
//!     .run(&pipeline, "fix the login bug", Default::default(), Default::default())
//!     .await?;
//! println!("{}: {:?}", outcome.run_id, outcome.status);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod artifact;
pub mod audit;
pub mod contract;
pub mod dag;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod init;
pub mod manifest;
pub mod pipeline;
pub mod relay;
pub mod repo_lock;
pub mod retry;
pub mod router;
pub mod security;
pub mod state;
pub mod template;
pub mod workspace;
pub mod worktree;

pub use artifact::{ArtifactRecord, ArtifactStore};
pub use driver::{AdapterDriver, AdapterInvocation, AdapterResult};
pub use error::WaveError;
pub use events::{Event, EventEmitter, EventKind};
pub use executor::{PipelineExecutor, ResumeSpec, RunLimits, RunOptions, RunOutcome};
pub use init::{init_project, InitResult};
pub use manifest::{AdapterDef, AdapterMode, Manifest, PersonaDef, Permissions};
pub use pipeline::{Contract, ContractKind, Pipeline, Step};
pub use repo_lock::RepoLockRegistry;
pub use router::{adhoc_pipeline, validate_meta, Router, RouterRule};
pub use state::{RunStatus, StateStore, StepState};
pub use worktree::WorktreeManager;
