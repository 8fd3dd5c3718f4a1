//! # Pipeline Executor
//!
//! Drives a validated pipeline to completion: schedules ready steps up to the
//! concurrency cap, builds workspaces, injects and validates artifacts,
//! renders prompts, supervises adapters (with relay interposition), persists
//! every state transition, retries under the step's contract policy, fans
//! matrix steps out one worker per item, and cleans worktrees up on every
//! exit path.
//!
//! ## Ordering guarantees
//!
//! - A dependent launches only after all of its dependencies reach Completed
//!   (or warn-completed); its injected artifacts exist on disk by then.
//! - Worktree mutations on one repository are serialized by the repo lock.
//! - Matrix workers are unordered among themselves; a path written by two or
//!   more workers aborts the pipeline at the join.

use crate::artifact::{ArtifactRecord, ArtifactStore};
use crate::audit::{AuditEntry, AuditEntryType, AuditLog};
use crate::contract::{error_envelope, ContractValidator, OutputCheck};
use crate::dag::{self, DagError};
use crate::driver::{AdapterDriver, AdapterInvocation, DriverEvent};
use crate::events::{EventEmitter, EventKind};
use crate::manifest::Manifest;
use crate::pipeline::{ArtifactSource, OnFailure, Pipeline, Step, WorkspaceKind};
use crate::relay::{resume_prompt, RelaySupervisor};
use crate::repo_lock::RepoLockRegistry;
use crate::retry::{
    classify, enhance_prompt, BackoffConfig, EnhancementLevel, ErrorClass, StepError,
};
use crate::security::{self, SecurityError};
use crate::state::{RunRecord, RunStatus, StateError, StateStore, StepRecord, StepState};
use crate::template::{self, ArtifactText, TemplateContext};
use crate::workspace::{Workspace, WorkspaceBuilder};
use crate::worktree::WorktreeManager;
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Relay attempts per step before giving up
const MAX_RELAYS_PER_STEP: u32 = 8;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("unknown run id '{0}'")]
    UnknownRun(String),

    #[error("step '{0}' not found in pipeline")]
    UnknownStep(String),
}

/// Caps applied to a whole run (meta pipelines)
#[derive(Debug, Clone, Default)]
pub struct RunLimits {
    pub max_total_tokens: Option<u64>,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct ResumeSpec {
    pub run_id: String,
    pub from_step: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub labels: BTreeMap<String, String>,
    pub limits: RunLimits,
    pub resume: Option<ResumeSpec>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub total_tokens: u64,
}

/// Typed worktree registry entry, owned by the run for cleanup.
#[derive(Debug, Clone)]
pub struct WorktreeEntry {
    pub step_id: String,
    pub path: PathBuf,
    pub repo_root: PathBuf,
}

#[derive(Debug, Clone)]
struct StepSuccess {
    tokens: u64,
    warned: bool,
}

/// Everything a spawned step task needs, shared by Arc.
struct StepCtx {
    run_id: String,
    input: String,
    manifest: Arc<Manifest>,
    store: Arc<StateStore>,
    artifacts: Arc<ArtifactStore>,
    emitter: EventEmitter,
    validator: Arc<ContractValidator>,
    relay: RelaySupervisor,
    backoff: BackoffConfig,
    ws_builder: WorkspaceBuilder,
    audit: Arc<AuditLog>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

/// One unit of adapter work: the scalar step itself, or a matrix worker.
#[derive(Debug, Clone)]
struct InstanceSpec {
    /// Workspace directory name under the run (`<step>` or `<step>/worker-N`)
    instance_id: String,
    worker: Option<usize>,
    task: Option<Value>,
    worktree: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct InstanceSuccess {
    tokens: u64,
    warned: bool,
    files_changed: Vec<PathBuf>,
}

pub struct PipelineExecutor {
    manifest: Arc<Manifest>,
    store: Arc<StateStore>,
    artifacts: Arc<ArtifactStore>,
    emitter: EventEmitter,
    locks: Arc<RepoLockRegistry>,
    validator: Arc<ContractValidator>,
    relay: RelaySupervisor,
    backoff: BackoffConfig,
    ws_builder: WorkspaceBuilder,
}

impl PipelineExecutor {
    pub fn new(manifest: Arc<Manifest>, store: Arc<StateStore>, emitter: EventEmitter) -> Self {
        let runtime = &manifest.runtime;
        let locks = Arc::new(RepoLockRegistry::new(Duration::from_secs(
            runtime.repo_lock_timeout_secs,
        )));
        Self {
            artifacts: Arc::new(ArtifactStore::new(&runtime.workspace_root)),
            validator: Arc::new(ContractValidator::new(manifest.base_dir.clone())),
            relay: RelaySupervisor::new(runtime.relay.clone()),
            ws_builder: WorkspaceBuilder::new(runtime.workspace_root.clone()),
            backoff: BackoffConfig::default(),
            locks,
            manifest,
            store,
            emitter,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Run a pipeline to a terminal status.
    ///
    /// Validation problems return `Err` (configuration failures, exit 2);
    /// step and contract failures resolve to `Ok` with a failed status.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        input: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, ExecError> {
        security::sanitize_input(input)?;
        let graph = dag::validate(pipeline, &self.manifest)?;

        let started = Instant::now();
        let deadline = options.limits.deadline.map(|d| started + d);

        let (run_id, mut completed) = self.prepare_run(pipeline, input, &options)?;
        let audit = Arc::new(AuditLog::open(
            &self.manifest.runtime.audit,
            &run_id,
            &pipeline.metadata.name,
            crate::security::Redactor::from_env(),
        ));

        let event = self.emitter.emit(
            &run_id,
            None,
            None,
            EventKind::PipelineStarted {
                pipeline: pipeline.metadata.name.clone(),
            },
        );
        self.store.record_event(&event).ok();

        let ctx = Arc::new(StepCtx {
            run_id: run_id.clone(),
            input: input.to_string(),
            manifest: Arc::clone(&self.manifest),
            store: Arc::clone(&self.store),
            artifacts: Arc::clone(&self.artifacts),
            emitter: self.emitter.clone(),
            validator: Arc::clone(&self.validator),
            relay: self.relay.clone(),
            backoff: self.backoff.clone(),
            ws_builder: self.ws_builder.clone(),
            audit,
            cancel: cancel.clone(),
            semaphore: Arc::new(Semaphore::new(
                self.manifest.runtime.max_concurrent_workers.max(1),
            )),
        });

        // Dependency bookkeeping, with already-completed steps pre-satisfied.
        let mut remaining: HashMap<String, usize> = pipeline
            .steps
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .map(|s| {
                let open = s
                    .depends_on
                    .iter()
                    .filter(|d| !completed.contains(d.as_str()))
                    .count();
                (s.id.clone(), open)
            })
            .collect();

        let mut launched: HashSet<String> = HashSet::new();
        let mut join_set: JoinSet<(String, Result<StepSuccess, StepError>)> = JoinSet::new();
        let worktrees: Arc<parking_lot::Mutex<Vec<WorktreeEntry>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut pipeline_error: Option<String> = None;
        let mut tokens_seen: u64 = 0;

        loop {
            // Launch everything ready, unless the run is already doomed.
            if pipeline_error.is_none() && !cancel.is_cancelled() {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        pipeline_error = Some("run wall-clock limit exceeded".to_string());
                    }
                }
            }
            let mut completed_inline = false;
            if pipeline_error.is_none() && !cancel.is_cancelled() {
                let ready: Vec<Step> = graph
                    .order
                    .iter()
                    .filter(|id| {
                        !completed.contains(*id)
                            && !launched.contains(*id)
                            && remaining.get(*id).copied() == Some(0)
                    })
                    .filter_map(|id| pipeline.step(id).cloned())
                    .collect();

                for step in ready {
                    launched.insert(step.id.clone());

                    let worktree = match self
                        .prepare_worktree(&ctx, &step, &worktrees)
                        .await
                    {
                        Ok(wt) => wt,
                        Err(e) => {
                            self.record_step_failure(&ctx, &step.id, &e);
                            pipeline_error = Some(format!("step '{}': {e}", step.id));
                            continue;
                        }
                    };

                    let items = match self.matrix_items(&ctx, &step) {
                        Ok(items) => items,
                        Err(e) => {
                            self.record_step_failure(&ctx, &step.id, &e);
                            pipeline_error = Some(format!("step '{}': {e}", step.id));
                            continue;
                        }
                    };

                    // A matrix step with zero items completes immediately,
                    // spawning no workers.
                    if step.matrix().is_some() && items.as_ref().is_some_and(Vec::is_empty) {
                        info!(step = %step.id, "matrix fan-out over zero items");
                        self.store
                            .upsert_step(
                                &ctx.run_id,
                                &StepRecord {
                                    step_id: step.id.clone(),
                                    state: StepState::Completed,
                                    retry_count: 0,
                                    tokens_used: 0,
                                    workspace_path: None,
                                    error_message: None,
                                    started_at: Some(Utc::now()),
                                    completed_at: Some(Utc::now()),
                                },
                            )
                            .ok();
                        let event = ctx.emitter.emit(
                            &ctx.run_id,
                            Some(&step.id),
                            None,
                            EventKind::StepCompleted {
                                tokens_used: 0,
                                duration_ms: 0,
                                artifacts: vec![],
                            },
                        );
                        self.store.record_event(&event).ok();
                        finish_step(&step.id, &mut completed, &mut remaining, &graph.dependents);
                        completed_inline = true;
                        continue;
                    }

                    let task_ctx = Arc::clone(&ctx);
                    join_set.spawn(async move {
                        let id = step.id.clone();
                        let result = match items {
                            Some(items) => run_matrix(task_ctx, step, items, worktree).await,
                            None => run_scalar(task_ctx, step, worktree).await,
                        };
                        (id, result)
                    });
                }
            }

            // A synchronously-completed step may have unblocked dependents;
            // go launch them before waiting on in-flight work.
            if completed_inline {
                continue;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((step_id, Ok(success))) => {
                    tokens_seen += success.tokens;
                    if success.warned {
                        debug!(step = %step_id, "step completed with contract warning");
                    }
                    finish_step(&step_id, &mut completed, &mut remaining, &graph.dependents);

                    if let Some(cap) = options.limits.max_total_tokens {
                        if tokens_seen > cap {
                            pipeline_error =
                                Some(format!("token budget exceeded ({tokens_seen} > {cap})"));
                        }
                    }
                }
                Ok((step_id, Err(StepError::Cancelled))) => {
                    debug!(step = %step_id, "step cancelled");
                }
                Ok((step_id, Err(e))) => {
                    if pipeline_error.is_none() {
                        pipeline_error = Some(format!("step '{step_id}': {e}"));
                    }
                }
                Err(join_err) => {
                    // A panicking task is a terminal step failure, isolated
                    // from its siblings.
                    error!(error = %join_err, "step task panicked");
                    if pipeline_error.is_none() {
                        pipeline_error = Some(format!("step task panicked: {join_err}"));
                    }
                }
            }
        }

        self.cleanup_worktrees(&worktrees).await;

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if pipeline_error.is_some() {
            RunStatus::Failed
        } else if completed.len() == pipeline.steps.len() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let total_tokens = self.store.finish_run(&run_id, status)?;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.store
            .record_metric(&run_id, None, "pipeline_duration_ms", duration_ms as f64)
            .ok();

        let terminal = match status {
            RunStatus::Completed => EventKind::PipelineCompleted {
                total_tokens,
                duration_ms,
            },
            RunStatus::Cancelled => EventKind::PipelineCancelled,
            _ => EventKind::PipelineFailed {
                message: pipeline_error.unwrap_or_else(|| "pipeline failed".to_string()),
            },
        };
        let event = self.emitter.emit(&run_id, None, None, terminal);
        self.store.record_event(&event).ok();

        Ok(RunOutcome {
            run_id,
            status,
            total_tokens,
        })
    }

    /// Execute a persona-generated pipeline: semantic meta validation first,
    /// then a normal run bounded by the manifest's meta caps. Constraint
    /// violations refuse execution.
    pub async fn run_meta(
        &self,
        generated_yaml: &str,
        input: &str,
        depth: u32,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, crate::error::WaveError> {
        let pipeline = Pipeline::parse(generated_yaml)?;
        let limits = &self.manifest.runtime.meta_pipeline;
        crate::router::validate_meta(&pipeline, &self.manifest, limits, depth)?;

        let options = RunOptions {
            limits: RunLimits {
                max_total_tokens: Some(limits.max_total_tokens),
                deadline: Some(Duration::from_secs(limits.timeout_minutes * 60)),
            },
            ..Default::default()
        };
        Ok(self.run(&pipeline, input, options, cancel).await?)
    }

    /// Create the run row (fresh run) or rebuild prior state (resume).
    /// Returns the run id and the set of steps to treat as already complete.
    fn prepare_run(
        &self,
        pipeline: &Pipeline,
        input: &str,
        options: &RunOptions,
    ) -> Result<(String, HashSet<String>), ExecError> {
        match &options.resume {
            None => {
                let run_id = pipeline.new_run_id();
                self.store.create_run(&RunRecord {
                    run_id: run_id.clone(),
                    pipeline_name: pipeline.metadata.name.clone(),
                    status: RunStatus::Running,
                    input: input.to_string(),
                    labels: options.labels.clone(),
                    current_step: None,
                    total_tokens: 0,
                    started_at: Utc::now(),
                    completed_at: None,
                })?;
                for step in &pipeline.steps {
                    self.store.upsert_step(
                        &run_id,
                        &StepRecord {
                            step_id: step.id.clone(),
                            state: StepState::Pending,
                            retry_count: 0,
                            tokens_used: 0,
                            workspace_path: None,
                            error_message: None,
                            started_at: None,
                            completed_at: None,
                        },
                    )?;
                }
                Ok((run_id, HashSet::new()))
            }
            Some(spec) => {
                let run = self
                    .store
                    .get_run(&spec.run_id)?
                    .ok_or_else(|| ExecError::UnknownRun(spec.run_id.clone()))?;
                // Interrupted steps re-run from scratch.
                let demoted = self.store.demote_interrupted(&run.run_id)?;
                if !demoted.is_empty() {
                    info!(steps = ?demoted, "demoted interrupted steps to failed");
                }

                let completed = match &spec.from_step {
                    Some(from) => {
                        if pipeline.step(from).is_none() {
                            return Err(ExecError::UnknownStep(from.clone()));
                        }
                        ancestors_of(pipeline, from)
                    }
                    None => self
                        .store
                        .steps_for_run(&run.run_id)?
                        .into_iter()
                        .filter(|s| s.state == StepState::Completed)
                        .map(|s| s.step_id)
                        .collect(),
                };

                // Completed steps keep their artifacts; re-register from disk.
                for step in pipeline.steps.iter().filter(|s| completed.contains(&s.id)) {
                    for def in &step.output_artifacts {
                        let path = self.artifacts.path_for(&run.run_id, &step.id, &def.name);
                        if let Ok(meta) = std::fs::metadata(&path) {
                            self.artifacts.register(ArtifactRecord {
                                run_id: run.run_id.clone(),
                                step_id: step.id.clone(),
                                name: def.name.clone(),
                                artifact_type: def.artifact_type,
                                source: def.source,
                                path,
                                size_bytes: meta.len(),
                                created_at: Utc::now(),
                            });
                        }
                    }
                }

                self.store
                    .update_run_status(&run.run_id, RunStatus::Running, None)?;
                Ok((run.run_id, completed))
            }
        }
    }

    /// Ensure the run's shared worktree exists when a step asks for one.
    /// Runs in the (sequential) scheduler, so a branch is created once per
    /// run even when several worktree steps become ready together.
    async fn prepare_worktree(
        &self,
        ctx: &Arc<StepCtx>,
        step: &Step,
        worktrees: &Arc<parking_lot::Mutex<Vec<WorktreeEntry>>>,
    ) -> Result<Option<PathBuf>, StepError> {
        let WorkspaceKind::Worktree { repo } = &step.workspace else {
            return Ok(None);
        };
        let repo_root = RepoLockRegistry::canonicalize(
            repo.as_deref().unwrap_or_else(|| std::path::Path::new(".")),
        )?;

        if let Some(entry) = worktrees
            .lock()
            .iter()
            .find(|e| e.repo_root == repo_root)
        {
            return Ok(Some(entry.path.clone()));
        }

        let target = self
            .manifest
            .runtime
            .workspace_root
            .join(&ctx.run_id)
            .join("worktree");
        let manager = WorktreeManager::new(repo_root.clone(), Arc::clone(&self.locks));
        let path = manager.create(&ctx.run_id, &target).await?;

        worktrees.lock().push(WorktreeEntry {
            step_id: step.id.clone(),
            path: path.clone(),
            repo_root,
        });
        Ok(Some(path))
    }

    /// Remove every worktree the run created. Failures are logged and do not
    /// mask the run's outcome.
    async fn cleanup_worktrees(&self, worktrees: &Arc<parking_lot::Mutex<Vec<WorktreeEntry>>>) {
        let entries: Vec<WorktreeEntry> = worktrees.lock().drain(..).collect();
        for entry in entries {
            let manager = WorktreeManager::new(entry.repo_root.clone(), Arc::clone(&self.locks));
            if let Err(e) = manager.remove(&entry.path).await {
                warn!(
                    step = %entry.step_id,
                    path = %entry.path.display(),
                    error = %e,
                    "worktree cleanup failed"
                );
            }
        }
    }

    /// Load the item array for a matrix step at scheduling time.
    fn matrix_items(
        &self,
        ctx: &Arc<StepCtx>,
        step: &Step,
    ) -> Result<Option<Vec<Value>>, StepError> {
        let Some(matrix) = step.matrix() else {
            return Ok(None);
        };
        let (src_step, src_name) = matrix
            .source_parts()
            .expect("validated at pipeline load");
        let record = self
            .artifacts
            .get(&ctx.run_id, src_step, src_name)
            .ok_or_else(|| {
                StepError::Workspace(crate::workspace::WorkspaceError::MissingRequiredArtifact {
                    from_step: src_step.to_string(),
                    name: src_name.to_string(),
                })
            })?;
        let content = self.artifacts.read_string(&record)?;
        let value: Value = serde_json::from_str(&content).map_err(|e| {
            StepError::ContractValidation {
                errors: vec![format!("matrix items source is not valid JSON: {e}")],
            }
        })?;
        let items = value
            .get(&matrix.item_key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| StepError::ContractValidation {
                errors: vec![format!(
                    "matrix items source has no array at key '{}'",
                    matrix.item_key
                )],
            })?;
        Ok(Some(items))
    }

    fn record_step_failure(&self, ctx: &Arc<StepCtx>, step_id: &str, error: &StepError) {
        self.store
            .upsert_step(
                &ctx.run_id,
                &StepRecord {
                    step_id: step_id.to_string(),
                    state: StepState::Failed,
                    retry_count: 0,
                    tokens_used: 0,
                    workspace_path: None,
                    error_message: Some(error.to_string()),
                    started_at: Some(Utc::now()),
                    completed_at: Some(Utc::now()),
                },
            )
            .ok();
        let event = self.emitter.emit(
            &ctx.run_id,
            Some(step_id),
            None,
            EventKind::StepFailed {
                message: error.to_string(),
                duration_ms: 0,
            },
        );
        self.store.record_event(&event).ok();
    }
}

/// Mark a step complete and unblock its dependents.
fn finish_step(
    step_id: &str,
    completed: &mut HashSet<String>,
    remaining: &mut HashMap<String, usize>,
    dependents: &HashMap<String, Vec<String>>,
) {
    completed.insert(step_id.to_string());
    if let Some(deps) = dependents.get(step_id) {
        for d in deps {
            if let Some(open) = remaining.get_mut(d) {
                *open = open.saturating_sub(1);
            }
        }
    }
}

/// Strict ancestors of `step_id` (`--from-step` treats them as Completed).
fn ancestors_of(pipeline: &Pipeline, step_id: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = pipeline
        .step(step_id)
        .map(|s| s.depends_on.iter().map(String::as_str).collect())
        .unwrap_or_default();
    while let Some(id) = stack.pop() {
        if seen.insert(id.to_string()) {
            if let Some(s) = pipeline.step(id) {
                stack.extend(s.depends_on.iter().map(String::as_str));
            }
        }
    }
    seen
}

// ============================================================================
// SCALAR STEP
// ============================================================================

async fn run_scalar(
    ctx: Arc<StepCtx>,
    step: Step,
    worktree: Option<PathBuf>,
) -> Result<StepSuccess, StepError> {
    let _permit = Arc::clone(&ctx.semaphore)
        .acquire_owned()
        .await
        .map_err(|_| StepError::Cancelled)?;

    let started = Instant::now();
    let started_at = Utc::now();
    let persona = step.persona.clone();
    ctx.store
        .update_run_status(&ctx.run_id, RunStatus::Running, Some(&step.id))
        .ok();
    ctx.store.upsert_step(
        &ctx.run_id,
        &StepRecord {
            step_id: step.id.clone(),
            state: StepState::Running,
            retry_count: 0,
            tokens_used: 0,
            workspace_path: Some(ctx.ws_builder.step_dir(&ctx.run_id, &step.id).display().to_string()),
            error_message: None,
            started_at: Some(started_at),
            completed_at: None,
        },
    ).ok();
    let event = ctx.emitter.emit(
        &ctx.run_id,
        Some(&step.id),
        None,
        EventKind::StepStarted {
            persona: persona.clone(),
        },
    );
    ctx.store.record_event(&event).ok();

    let spec = InstanceSpec {
        instance_id: step.id.clone(),
        worker: None,
        task: None,
        worktree,
    };
    let (attempts, result) = run_instance(&ctx, &step, spec).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(success) => {
            ctx.store.upsert_step(
                &ctx.run_id,
                &StepRecord {
                    step_id: step.id.clone(),
                    state: StepState::Completed,
                    retry_count: attempts,
                    tokens_used: success.tokens,
                    workspace_path: Some(
                        ctx.ws_builder.step_dir(&ctx.run_id, &step.id).display().to_string(),
                    ),
                    error_message: None,
                    started_at: Some(started_at),
                    completed_at: Some(Utc::now()),
                },
            ).ok();
            ctx.store
                .record_metric(&ctx.run_id, Some(&step.id), "step_duration_ms", duration_ms as f64)
                .ok();
            let names: Vec<String> = step.output_artifacts.iter().map(|a| a.name.clone()).collect();
            let event = ctx.emitter.emit(
                &ctx.run_id,
                Some(&step.id),
                None,
                EventKind::StepCompleted {
                    tokens_used: success.tokens,
                    duration_ms,
                    artifacts: names,
                },
            );
            ctx.store.record_event(&event).ok();
            Ok(StepSuccess {
                tokens: success.tokens,
                warned: success.warned,
            })
        }
        Err(StepError::Cancelled) => Err(StepError::Cancelled),
        Err(e) => {
            ctx.store.upsert_step(
                &ctx.run_id,
                &StepRecord {
                    step_id: step.id.clone(),
                    state: StepState::Failed,
                    retry_count: attempts,
                    tokens_used: 0,
                    workspace_path: None,
                    error_message: Some(ctx.emitter.redact(&e.to_string())),
                    started_at: Some(started_at),
                    completed_at: Some(Utc::now()),
                },
            ).ok();
            let event = ctx.emitter.emit(
                &ctx.run_id,
                Some(&step.id),
                None,
                EventKind::StepFailed {
                    message: e.to_string(),
                    duration_ms,
                },
            );
            ctx.store.record_event(&event).ok();
            Err(e)
        }
    }
}

// ============================================================================
// MATRIX STEP
// ============================================================================

async fn run_matrix(
    ctx: Arc<StepCtx>,
    step: Step,
    items: Vec<Value>,
    worktree: Option<PathBuf>,
) -> Result<StepSuccess, StepError> {
    let matrix = step.matrix().expect("matrix step").clone();
    let started = Instant::now();
    let started_at = Utc::now();

    ctx.store.upsert_step(
        &ctx.run_id,
        &StepRecord {
            step_id: step.id.clone(),
            state: StepState::Running,
            retry_count: 0,
            tokens_used: 0,
            workspace_path: None,
            error_message: None,
            started_at: Some(started_at),
            completed_at: None,
        },
    ).ok();
    let event = ctx.emitter.emit(
        &ctx.run_id,
        Some(&step.id),
        None,
        EventKind::StepStarted {
            persona: step.persona.clone(),
        },
    );
    ctx.store.record_event(&event).ok();

    let worker_gate = Arc::new(Semaphore::new(matrix.max_concurrency.max(1)));
    let mut workers: JoinSet<(usize, Result<InstanceSuccess, StepError>)> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let ctx = Arc::clone(&ctx);
        let step = step.clone();
        let worker_gate = Arc::clone(&worker_gate);
        let worktree = worktree.clone();
        workers.spawn(async move {
            let Ok(_local) = worker_gate.acquire_owned().await else {
                return (index, Err(StepError::Cancelled));
            };
            let Ok(_global) = Arc::clone(&ctx.semaphore).acquire_owned().await else {
                return (index, Err(StepError::Cancelled));
            };
            let spec = InstanceSpec {
                instance_id: format!("{}/worker-{index}", step.id),
                worker: Some(index),
                task: Some(item),
                worktree,
            };
            let (_attempts, result) = run_instance(&ctx, &step, spec).await;
            (index, result)
        });
    }

    // Join phase: every worker finishes its adapter call before conflicts
    // are judged.
    let mut touched: HashMap<PathBuf, Vec<usize>> = HashMap::new();
    let mut tokens = 0u64;
    let mut warned = false;
    let mut first_error: Option<StepError> = None;

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((index, Ok(success))) => {
                tokens += success.tokens;
                warned |= success.warned;
                for path in success.files_changed {
                    touched.entry(path).or_default().push(index);
                }
            }
            Ok((_, Err(e))) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(StepError::AdapterCrash {
                        exit_code: None,
                        message: format!("matrix worker panicked: {join_err}"),
                    });
                }
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;

    let result: Result<StepSuccess, StepError> = if let Some(e) = first_error {
        Err(e)
    } else if let Some((path, mut workers)) = touched
        .iter()
        .find(|(_, workers)| workers.len() >= 2)
        .map(|(p, w)| (p.clone(), w.clone()))
    {
        workers.sort_unstable();
        Err(StepError::MatrixConflict {
            path: path.display().to_string(),
            workers,
        })
    } else {
        Ok(StepSuccess { tokens, warned })
    };

    match &result {
        Ok(success) => {
            ctx.store.upsert_step(
                &ctx.run_id,
                &StepRecord {
                    step_id: step.id.clone(),
                    state: StepState::Completed,
                    retry_count: 0,
                    tokens_used: success.tokens,
                    workspace_path: None,
                    error_message: None,
                    started_at: Some(started_at),
                    completed_at: Some(Utc::now()),
                },
            ).ok();
            let event = ctx.emitter.emit(
                &ctx.run_id,
                Some(&step.id),
                None,
                EventKind::StepCompleted {
                    tokens_used: success.tokens,
                    duration_ms,
                    artifacts: vec![],
                },
            );
            ctx.store.record_event(&event).ok();
        }
        Err(StepError::Cancelled) => {}
        Err(e) => {
            ctx.store.upsert_step(
                &ctx.run_id,
                &StepRecord {
                    step_id: step.id.clone(),
                    state: StepState::Failed,
                    retry_count: 0,
                    tokens_used: tokens,
                    workspace_path: None,
                    error_message: Some(ctx.emitter.redact(&e.to_string())),
                    started_at: Some(started_at),
                    completed_at: Some(Utc::now()),
                },
            ).ok();
            let event = ctx.emitter.emit(
                &ctx.run_id,
                Some(&step.id),
                None,
                EventKind::StepFailed {
                    message: e.to_string(),
                    duration_ms,
                },
            );
            ctx.store.record_event(&event).ok();
        }
    }

    result
}

// ============================================================================
// INSTANCE (one adapter execution with retries and relay)
// ============================================================================

/// Returns the retry count used alongside the instance outcome.
async fn run_instance(
    ctx: &Arc<StepCtx>,
    step: &Step,
    spec: InstanceSpec,
) -> (u32, Result<InstanceSuccess, StepError>) {
    let mut attempts = 0;
    let result = run_instance_inner(ctx, step, spec, &mut attempts).await;
    (attempts, result)
}

async fn run_instance_inner(
    ctx: &Arc<StepCtx>,
    step: &Step,
    spec: InstanceSpec,
    attempts_out: &mut u32,
) -> Result<InstanceSuccess, StepError> {
    let persona = ctx
        .manifest
        .persona(&step.persona)
        .expect("validated at pipeline load");
    let adapter = ctx.manifest.adapter_for(persona).clone();
    let system_prompt = persona_prompt(ctx, step)?;

    // Workspace + injection + input contracts, all before the adapter runs.
    let workspace = ctx
        .ws_builder
        .build(&ctx.run_id, &spec.instance_id, step, spec.worktree.clone())?;
    let injected = ctx
        .ws_builder
        .inject(&workspace, &ctx.run_id, step, &ctx.artifacts)?;

    let mut artifact_texts: HashMap<String, ArtifactText> = HashMap::new();
    for artifact in &injected {
        match &artifact.path {
            None => {
                artifact_texts.insert(artifact.alias.clone(), ArtifactText::OptionalMissing);
            }
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(StepError::Io)?;
                if artifact.def.schema_path.is_some() {
                    let check = ctx.validator.check_input(&artifact.def, &content)?;
                    if let OutputCheck::Failed { errors } = check {
                        ctx.audit.record(AuditEntry::new(
                            &ctx.run_id,
                            &step.id,
                            &step.persona,
                            AuditEntryType::ContractValidation,
                        ).with_result(format!("input '{}' rejected", artifact.alias)));
                        return Err(StepError::InputContractViolation { errors });
                    }
                }
                // Substituted values are data; score them but never execute.
                let risk = security::risk_score(&content);
                if risk > 0 {
                    warn!(artifact = %artifact.alias, risk, "injected content matches injection patterns");
                }
                artifact_texts.insert(artifact.alias.clone(), ArtifactText::Inline(content));
            }
        }
    }

    let template_ctx = TemplateContext {
        input: &ctx.input,
        pipeline_id: &ctx.run_id,
        project: Some(&ctx.manifest.metadata.labels),
        artifacts: artifact_texts,
        task: spec.task.as_ref(),
    };
    let base_prompt = template::render(&step.exec.source, &template_ctx)?;

    run_hook(ctx, step, &workspace, persona.hooks.as_ref().and_then(|h| h.before.as_deref())).await;

    let timeout = Duration::from_secs(
        step.timeout_minutes
            .unwrap_or(ctx.manifest.runtime.default_timeout_minutes)
            * 60,
    );
    let capture_stdout = step
        .stdout_artifact()
        .map(|_| ctx.manifest.runtime.artifacts.max_stdout_size);
    let contract = step.contract();
    let max_retries = step
        .max_retries
        .or(contract.and_then(|c| c.max_retries))
        .unwrap_or(ctx.manifest.runtime.default_max_retries);
    let schema_excerpt = contract.and_then(|c| match &c.kind {
        crate::pipeline::ContractKind::JsonSchema { schema_path } => {
            let resolved = if schema_path.is_absolute() {
                schema_path.clone()
            } else {
                ctx.manifest.base_dir.join(schema_path)
            };
            std::fs::read_to_string(resolved).ok()
        }
        _ => None,
    });

    let mut invocation = AdapterInvocation {
        persona_name: step.persona.clone(),
        adapter,
        system_prompt,
        prompt: base_prompt.clone(),
        permissions: effective_permissions(persona, &workspace),
        temperature: persona.temperature,
        env_passthrough: ctx.manifest.runtime.sandbox.env_passthrough.clone(),
        workdir: workspace.dir.clone(),
        timeout,
        capture_stdout,
        scan_root: Some(workspace.write_surface().to_path_buf()),
        attempt: 0,
    };

    let mut contract_errors: Vec<String> = Vec::new();
    let mut last_raw: Option<String> = None;
    let mut attempt: u32 = 0;

    let outcome = loop {
        invocation.attempt = attempt;
        invocation.prompt = if attempt == 0 {
            base_prompt.clone()
        } else {
            enhance_prompt(
                &base_prompt,
                EnhancementLevel::for_attempt(attempt - 1),
                &contract_errors,
                schema_excerpt.as_deref(),
            )
        };

        let attempt_result =
            supervised_attempt(ctx, step, &spec, &workspace, &invocation, persona.context_budget())
                .await;

        let failure = match attempt_result {
            Ok(result) => {
                match check_and_commit(ctx, step, &spec, &workspace, result).await {
                    Ok(success) => break Ok(success),
                    Err(CheckFailure { error, raw }) => {
                        if raw.is_some() {
                            last_raw = raw;
                        }
                        error
                    }
                }
            }
            Err(e) => e,
        };

        if ctx.cancel.is_cancelled() {
            break Err(StepError::Cancelled);
        }

        // Contract policy decides whether a validation failure may retry.
        let policy = contract.map(|c| c.effective_on_failure());
        if let StepError::ContractValidation { errors } = &failure {
            contract_errors = errors.clone();
            if policy == Some(OnFailure::Fail) {
                break Err(failure);
            }
        }

        if classify(&failure) != ErrorClass::Retryable || attempt >= max_retries {
            break Err(failure);
        }

        attempt += 1;
        *attempts_out = attempt;
        let delay = ctx.backoff.delay_for(attempt - 1);
        let event = ctx.emitter.emit(
            &ctx.run_id,
            Some(&step.id),
            spec.worker,
            EventKind::StepRetry {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );
        ctx.store.record_event(&event).ok();
        ctx.store.upsert_step(
            &ctx.run_id,
            &StepRecord {
                step_id: step.id.clone(),
                state: StepState::Retrying,
                retry_count: attempt,
                tokens_used: 0,
                workspace_path: Some(workspace.dir.display().to_string()),
                error_message: Some(ctx.emitter.redact(&failure.to_string())),
                started_at: None,
                completed_at: None,
            },
        ).ok();

        tokio::select! {
            _ = ctx.cancel.cancelled() => break Err(StepError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        ctx.store.upsert_step(
            &ctx.run_id,
            &StepRecord {
                step_id: step.id.clone(),
                state: StepState::Running,
                retry_count: attempt,
                tokens_used: 0,
                workspace_path: Some(workspace.dir.display().to_string()),
                error_message: None,
                started_at: None,
                completed_at: None,
            },
        ).ok();
    };

    match &outcome {
        Ok(_) => {
            run_hook(ctx, step, &workspace, persona.hooks.as_ref().and_then(|h| h.after.as_deref()))
                .await;
        }
        Err(StepError::ContractValidation { errors }) if spec.worker.is_none() => {
            // Terminal degradation: a structured error report for operator
            // inspection. Never enters the handover registry.
            write_error_report(ctx, step, last_raw.as_deref().unwrap_or(""), attempt + 1, errors);
        }
        Err(_) => {}
    }
    outcome
}

/// One adapter execution under relay supervision. Returns the final
/// (post-relay) adapter result with accumulated token usage.
async fn supervised_attempt(
    ctx: &Arc<StepCtx>,
    step: &Step,
    spec: &InstanceSpec,
    workspace: &Workspace,
    invocation: &AdapterInvocation,
    context_budget: u64,
) -> Result<crate::driver::AdapterResult, StepError> {
    let mut invocation = invocation.clone();
    let original_prompt = invocation.prompt.clone();
    let mut relay_count: u32 = 0;
    let mut tokens_accum: u64 = 0;

    loop {
        let attempt_token = ctx.cancel.child_token();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<DriverEvent>();
        let transcript: Arc<parking_lot::Mutex<Vec<String>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let last_tokens = Arc::new(AtomicU64::new(0));
        let relay_requested = Arc::new(AtomicBool::new(false));

        let monitor = {
            let emitter = ctx.emitter.clone();
            let relay = ctx.relay.clone();
            let run_id = ctx.run_id.clone();
            let step_id = step.id.clone();
            let worker = spec.worker;
            let transcript = Arc::clone(&transcript);
            let last_tokens = Arc::clone(&last_tokens);
            let relay_requested = Arc::clone(&relay_requested);
            let attempt_token = attempt_token.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        DriverEvent::Line(line) => transcript.lock().push(line),
                        DriverEvent::Tokens(tokens) => {
                            last_tokens.store(tokens, Ordering::SeqCst);
                            emitter.emit(
                                &run_id,
                                Some(&step_id),
                                worker,
                                EventKind::StepProgress {
                                    tokens_used: tokens,
                                },
                            );
                            if relay.should_relay(tokens, context_budget)
                                && !relay_requested.swap(true, Ordering::SeqCst)
                            {
                                attempt_token.cancel();
                            }
                        }
                    }
                }
            })
        };

        let result = AdapterDriver.run(&invocation, &attempt_token, Some(tx)).await;
        monitor.await.ok();

        match result {
            Err(StepError::Cancelled)
                if relay_requested.load(Ordering::SeqCst) && !ctx.cancel.is_cancelled() =>
            {
                relay_count += 1;
                if relay_count > MAX_RELAYS_PER_STEP {
                    return Err(StepError::RelayOverflow);
                }
                let paused_tokens = last_tokens.load(Ordering::SeqCst);
                tokens_accum += paused_tokens;

                let event = ctx.emitter.emit(
                    &ctx.run_id,
                    Some(&step.id),
                    spec.worker,
                    EventKind::CompactionTriggered {
                        tokens_used: paused_tokens,
                    },
                );
                ctx.store.record_event(&event).ok();

                let lines = transcript.lock().clone();
                let (checkpoint, summarizer_tokens) = ctx
                    .relay
                    .checkpoint(&ctx.manifest, &lines, &workspace.dir, &ctx.cancel)
                    .await?;
                tokens_accum += summarizer_tokens;

                let event = ctx.emitter.emit(
                    &ctx.run_id,
                    Some(&step.id),
                    spec.worker,
                    EventKind::CompactionCompleted,
                );
                ctx.store.record_event(&event).ok();

                // Only the latest checkpoint rides along; no chain.
                invocation.prompt = resume_prompt(&checkpoint, &original_prompt);
                let event = ctx.emitter.emit(
                    &ctx.run_id,
                    Some(&step.id),
                    spec.worker,
                    EventKind::ResumedFromRelay { relay_count },
                );
                ctx.store.record_event(&event).ok();
            }
            Ok(mut r) => {
                r.tokens_used += tokens_accum;
                for tool in &r.denied_tools {
                    ctx.audit.record(
                        AuditEntry::new(
                            &ctx.run_id,
                            &step.id,
                            &step.persona,
                            AuditEntryType::PermissionDenied,
                        )
                        .with_tool(tool.clone()),
                    );
                }
                return Ok(r);
            }
            Err(e) => return Err(e),
        }
    }
}

/// A failed output check, carrying the raw content for the error report.
struct CheckFailure {
    error: StepError,
    raw: Option<String>,
}

/// Validate the attempt's output against the handover contract and, on
/// success, atomically commit the step's declared artifacts (scalar steps
/// only; matrix workers report file deltas instead).
async fn check_and_commit(
    ctx: &Arc<StepCtx>,
    step: &Step,
    spec: &InstanceSpec,
    workspace: &Workspace,
    result: crate::driver::AdapterResult,
) -> Result<InstanceSuccess, CheckFailure> {
    let stdout_content = result
        .stdout
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned());

    // Primary content for content-shaped contracts: captured stdout, else the
    // first declared file artifact, else the transcript.
    let primary = match (&stdout_content, step.output_artifacts.first()) {
        (Some(content), _) => content.clone(),
        (None, Some(def)) if def.source == ArtifactSource::File => {
            let rel = def.path.clone().unwrap_or_else(|| PathBuf::from(&def.name));
            std::fs::read_to_string(workspace.dir.join(&rel))
                .or_else(|_| std::fs::read_to_string(workspace.write_surface().join(&rel)))
                .unwrap_or_default()
        }
        _ => result.transcript.join("\n"),
    };

    let mut warned = false;
    let mut committed_stdout: Option<String> = stdout_content.clone();

    if let Some(contract) = step.contract() {
        let check = ctx
            .validator
            .check_output(contract, &primary, &workspace.dir)
            .await
            .map_err(|e| CheckFailure {
                error: StepError::Contract(e),
                raw: Some(primary.clone()),
            })?;

        ctx.audit.record(AuditEntry::new(
            &ctx.run_id,
            &step.id,
            &step.persona,
            AuditEntryType::ContractValidation,
        ).with_result(if check.passed() { "passed" } else { "failed" }.to_string()));

        match check {
            OutputCheck::Passed { recovered } => {
                // Recovery is additive: raw output that satisfied the
                // contract commits byte-identical.
                if let Some(fixed) = recovered {
                    if stdout_content.is_some() {
                        committed_stdout = Some(fixed);
                    }
                }
                let event = ctx.emitter.emit(
                    &ctx.run_id,
                    Some(&step.id),
                    spec.worker,
                    EventKind::ContractPassed,
                );
                ctx.store.record_event(&event).ok();
            }
            OutputCheck::Failed { errors } => {
                let message = errors.join("; ");
                match contract.effective_on_failure() {
                    OnFailure::Warn => {
                        warned = true;
                        let event = ctx.emitter.emit(
                            &ctx.run_id,
                            Some(&step.id),
                            spec.worker,
                            EventKind::ContractSoftFailure { message },
                        );
                        ctx.store.record_event(&event).ok();
                    }
                    _ => {
                        let event = ctx.emitter.emit(
                            &ctx.run_id,
                            Some(&step.id),
                            spec.worker,
                            EventKind::ContractFailed { message },
                        );
                        ctx.store.record_event(&event).ok();
                        return Err(CheckFailure {
                            error: StepError::ContractValidation { errors },
                            raw: Some(primary),
                        });
                    }
                }
            }
        }
    }

    // Commit declared outputs now that the handover is accepted.
    if spec.worker.is_none() {
        for def in &step.output_artifacts {
            let record = match def.source {
                ArtifactSource::Stdout => {
                    let bytes = committed_stdout
                        .as_deref()
                        .map(str::as_bytes)
                        .unwrap_or_default();
                    ctx.artifacts
                        .commit_bytes(&ctx.run_id, &step.id, def, bytes)
                }
                ArtifactSource::File => {
                    let rel = def.path.clone().unwrap_or_else(|| PathBuf::from(&def.name));
                    let source = {
                        let in_dir = workspace.dir.join(&rel);
                        if in_dir.exists() {
                            in_dir
                        } else {
                            workspace.write_surface().join(&rel)
                        }
                    };
                    ctx.artifacts
                        .commit_file(&ctx.run_id, &step.id, def, &source)
                }
            };
            match record {
                Ok(record) => {
                    ctx.store.record_artifact(&record).ok();
                    if ctx.manifest.runtime.audit.log_all_file_operations {
                        ctx.audit.record(
                            AuditEntry::new(
                                &ctx.run_id,
                                &step.id,
                                &step.persona,
                                AuditEntryType::FileWrite,
                            )
                            .with_result(record.path.display().to_string()),
                        );
                    }
                }
                Err(e) => {
                    return Err(CheckFailure {
                        error: StepError::Artifact(e),
                        raw: None,
                    })
                }
            }
        }
    }

    Ok(InstanceSuccess {
        tokens: result.tokens_used,
        warned,
        files_changed: result.files_changed,
    })
}

/// Write the post-exhaustion error report next to the step's artifacts. It
/// is recorded in the state store for inspection but never registered for
/// handover.
fn write_error_report(
    ctx: &Arc<StepCtx>,
    step: &Step,
    raw: &str,
    attempts: u32,
    errors: &[String],
) {
    let name = step
        .output_artifacts
        .first()
        .map(|a| a.name.as_str())
        .unwrap_or("output");
    let report_name = format!("{name}.error.json");
    let path = ctx.artifacts.path_for(&ctx.run_id, &step.id, &report_name);
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let envelope = error_envelope(raw, attempts, errors);
    if std::fs::write(&path, serde_json::to_string_pretty(&envelope).unwrap_or_default()).is_ok() {
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        ctx.store
            .record_artifact(&ArtifactRecord {
                run_id: ctx.run_id.clone(),
                step_id: step.id.clone(),
                name: report_name,
                artifact_type: crate::pipeline::ArtifactType::Json,
                source: ArtifactSource::File,
                path,
                size_bytes: size,
                created_at: Utc::now(),
            })
            .ok();
    }
}

fn persona_prompt(ctx: &Arc<StepCtx>, step: &Step) -> Result<String, StepError> {
    let persona = ctx
        .manifest
        .persona(&step.persona)
        .expect("validated at pipeline load");
    ctx.manifest
        .system_prompt(persona)
        .map_err(|e| StepError::Io(std::io::Error::other(e.to_string())))
}

/// Read-only mounts additionally deny write tools; the settings file and
/// prologue both carry the result.
fn effective_permissions(
    persona: &crate::manifest::PersonaDef,
    workspace: &Workspace,
) -> crate::manifest::Permissions {
    let mut permissions = persona.permissions.clone();
    if workspace.worktree.is_none() && workspace.access == crate::pipeline::AccessMode::ReadOnly {
        for tool in ["Write", "Edit"] {
            if !permissions.deny.iter().any(|d| d == tool) {
                permissions.deny.push(tool.to_string());
            }
        }
    }
    permissions
}

async fn run_hook(ctx: &Arc<StepCtx>, step: &Step, workspace: &Workspace, hook: Option<&str>) {
    let Some(command) = hook else {
        return;
    };
    let started = Instant::now();
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&workspace.dir)
        .output()
        .await;
    let result = match &output {
        Ok(o) if o.status.success() => "ok".to_string(),
        Ok(o) => format!("exit {}", o.status.code().unwrap_or(-1)),
        Err(e) => format!("spawn failed: {e}"),
    };
    ctx.audit.record(
        AuditEntry::new(&ctx.run_id, &step.id, &step.persona, AuditEntryType::HookExecuted)
            .with_tool(command.to_string())
            .with_result(result)
            .with_duration(started.elapsed().as_millis() as u64),
    );
}
