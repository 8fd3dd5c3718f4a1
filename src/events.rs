//! Structured progress events
//!
//! Every externally visible state change emits one [`Event`], synchronously,
//! from the component causing it. Sinks: NDJSON on stdout for machine
//! consumers, an optional human renderer on stderr, and a broadcast channel
//! for live fanout. Sequence numbers are per-process monotonic; events from
//! different steps may interleave.
//!
//! Credential scrubbing runs on every serialized line before it leaves the
//! process.

use crate::security::Redactor;
use chrono::{DateTime, Utc};
use colored::Colorize;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Closed event type set, tagged by `state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EventKind {
    PipelineStarted {
        pipeline: String,
    },
    StepStarted {
        persona: String,
    },
    StepProgress {
        tokens_used: u64,
    },
    ContractPassed,
    ContractFailed {
        message: String,
    },
    ContractSoftFailure {
        message: String,
    },
    CompactionTriggered {
        tokens_used: u64,
    },
    CompactionCompleted,
    ResumedFromRelay {
        relay_count: u32,
    },
    StepRetry {
        attempt: u32,
        delay_ms: u64,
    },
    StepCompleted {
        tokens_used: u64,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        artifacts: Vec<String>,
    },
    StepFailed {
        message: String,
        duration_ms: u64,
    },
    PipelineCompleted {
        total_tokens: u64,
        duration_ms: u64,
    },
    PipelineFailed {
        message: String,
    },
    PipelineCancelled,
}

impl EventKind {
    /// Short name matching the serialized `state` tag.
    pub fn state_name(&self) -> &'static str {
        match self {
            EventKind::PipelineStarted { .. } => "pipeline_started",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepProgress { .. } => "step_progress",
            EventKind::ContractPassed => "contract_passed",
            EventKind::ContractFailed { .. } => "contract_failed",
            EventKind::ContractSoftFailure { .. } => "contract_soft_failure",
            EventKind::CompactionTriggered { .. } => "compaction_triggered",
            EventKind::CompactionCompleted => "compaction_completed",
            EventKind::ResumedFromRelay { .. } => "resumed_from_relay",
            EventKind::StepRetry { .. } => "step_retry",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::PipelineCompleted { .. } => "pipeline_completed",
            EventKind::PipelineFailed { .. } => "pipeline_failed",
            EventKind::PipelineCancelled => "pipeline_cancelled",
        }
    }
}

/// Fans events out to the configured sinks.
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    seq: AtomicU64,
    redactor: Redactor,
    ndjson_stdout: bool,
    human_stderr: bool,
    broadcast: broadcast::Sender<Event>,
    buffer: RwLock<Vec<Event>>,
}

impl EventEmitter {
    pub fn new(redactor: Redactor) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(EmitterInner {
                seq: AtomicU64::new(0),
                redactor,
                ndjson_stdout: true,
                human_stderr: false,
                broadcast: tx,
                buffer: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Silent emitter retaining only the in-process buffer (tests).
    pub fn buffered(redactor: Redactor) -> Self {
        let mut e = Self::new(redactor);
        let inner = Arc::get_mut(&mut e.inner).expect("fresh emitter");
        inner.ndjson_stdout = false;
        e
    }

    /// Also render a human-readable line per event on stderr.
    pub fn with_human_renderer(mut self) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.human_stderr = true;
        }
        self
    }

    /// Emit one event; returns the stamped event.
    ///
    /// Message payloads are scrubbed here, before any sink (including the
    /// state store) observes them.
    pub fn emit(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        worker_id: Option<usize>,
        kind: EventKind,
    ) -> Event {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            step_id: step_id.map(str::to_string),
            worker_id,
            kind: self.redact_kind(kind),
        };

        if self.inner.ndjson_stdout {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", self.inner.redactor.redact(&line));
            }
        }
        if self.inner.human_stderr {
            eprintln!("{}", self.render_human(&event));
        }
        let _ = self.inner.broadcast.send(event.clone());
        self.inner.buffer.write().push(event.clone());
        event
    }

    fn redact_kind(&self, kind: EventKind) -> EventKind {
        let r = &self.inner.redactor;
        match kind {
            EventKind::ContractFailed { message } => EventKind::ContractFailed {
                message: r.redact(&message),
            },
            EventKind::ContractSoftFailure { message } => EventKind::ContractSoftFailure {
                message: r.redact(&message),
            },
            EventKind::StepFailed {
                message,
                duration_ms,
            } => EventKind::StepFailed {
                message: r.redact(&message),
                duration_ms,
            },
            EventKind::PipelineFailed { message } => EventKind::PipelineFailed {
                message: r.redact(&message),
            },
            other => other,
        }
    }

    /// Scrub arbitrary text with the emitter's redactor (used for anything
    /// headed to the state store outside an event payload).
    pub fn redact(&self, text: &str) -> String {
        self.inner.redactor.redact(text)
    }

    /// Subscribe to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.broadcast.subscribe()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.inner.buffer.read().clone()
    }

    fn render_human(&self, event: &Event) -> String {
        let step = event.step_id.as_deref().unwrap_or("-");
        let body = match &event.kind {
            EventKind::PipelineStarted { pipeline } => {
                format!("{} pipeline {} started", "→".cyan(), pipeline.bold())
            }
            EventKind::StepStarted { persona } => {
                format!("{} step {} ({})", "→".cyan(), step.bold(), persona)
            }
            EventKind::StepProgress { tokens_used } => {
                format!("  step {step} … {tokens_used} tokens")
            }
            EventKind::ContractPassed => format!("{} step {} contract passed", "✓".green(), step),
            EventKind::ContractFailed { message } => {
                format!("{} step {} contract failed: {}", "✗".red(), step, message)
            }
            EventKind::ContractSoftFailure { message } => {
                format!("{} step {} contract warning: {}", "!".yellow(), step, message)
            }
            EventKind::CompactionTriggered { tokens_used } => format!(
                "{} step {} compacting context at {} tokens",
                "↺".yellow(),
                step,
                tokens_used
            ),
            EventKind::CompactionCompleted => {
                format!("{} step {} checkpoint written", "↺".yellow(), step)
            }
            EventKind::ResumedFromRelay { relay_count } => {
                format!("{} step {} resumed (relay #{})", "↺".yellow(), step, relay_count)
            }
            EventKind::StepRetry { attempt, delay_ms } => format!(
                "{} step {} retry #{} in {}ms",
                "!".yellow(),
                step,
                attempt,
                delay_ms
            ),
            EventKind::StepCompleted {
                tokens_used,
                duration_ms,
                ..
            } => format!(
                "{} step {} completed ({} tokens, {}ms)",
                "✓".green(),
                step.bold(),
                tokens_used,
                duration_ms
            ),
            EventKind::StepFailed { message, .. } => {
                format!("{} step {} failed: {}", "✗".red(), step.bold(), message)
            }
            EventKind::PipelineCompleted {
                total_tokens,
                duration_ms,
            } => format!(
                "{} pipeline completed ({} tokens, {}ms)",
                "✓".green().bold(),
                total_tokens,
                duration_ms
            ),
            EventKind::PipelineFailed { message } => {
                format!("{} pipeline failed: {}", "✗".red().bold(), message)
            }
            EventKind::PipelineCancelled => format!("{} pipeline cancelled", "✗".yellow()),
        };
        self.inner.redactor.redact(&body)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("emitted", &self.inner.buffer.read().len())
            .finish()
    }
}
