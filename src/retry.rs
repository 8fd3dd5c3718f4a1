//! Retry policy: error classification, backoff, prompt enhancement
//!
//! Every step-producing operation resolves to a [`StepError`]; classification
//! splits those into retryable (schema violations, malformed output,
//! transient adapter trouble, timeouts) and fatal (permission denials,
//! conflicting worktrees, operator cancellation). Retry delays are
//! exponential with jitter, bounded to `[base, max]`. Each retry re-runs the
//! adapter with a progressively enhanced prompt layered over the original.

use crate::artifact::ArtifactError;
use crate::contract::ContractError;
use crate::repo_lock::RepoLockError;
use crate::security::SecurityError;
use crate::template::TemplateError;
use crate::workspace::WorkspaceError;
use crate::worktree::WorktreeError;
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Terminal description of why a step attempt failed
#[derive(Debug, Error)]
pub enum StepError {
    #[error("contract validation failed: {}", errors.join("; "))]
    ContractValidation { errors: Vec<String> },

    #[error("adapter exited abnormally ({}): {message}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "killed".into()))]
    AdapterCrash {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("captured stdout exceeded the {limit}-byte artifact cap")]
    StdoutArtifactTooLarge { limit: usize },

    #[error("relay summarizer exceeded its token cap")]
    RelayOverflow,

    #[error("adapter attempted denied tool '{0}'")]
    PermissionDenied(String),

    #[error("injected input failed its contract: {}", errors.join("; "))]
    InputContractViolation { errors: Vec<String> },

    #[error("matrix workers {workers:?} both modified '{path}'")]
    MatrixConflict { path: String, workers: Vec<usize> },

    #[error("cancelled by operator")]
    Cancelled,

    #[error(transparent)]
    RepoLock(#[from] RepoLockError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Decide whether an attempt may be retried.
pub fn classify(error: &StepError) -> ErrorClass {
    match error {
        StepError::ContractValidation { .. }
        | StepError::AdapterCrash { .. }
        | StepError::Timeout(_) => ErrorClass::Retryable,
        // Lock contention resolves itself; try again.
        StepError::RepoLock(RepoLockError::AcquisitionTimeout { .. }) => ErrorClass::Retryable,
        StepError::RepoLock(_) => ErrorClass::Fatal,
        StepError::Worktree(_)
        | StepError::Workspace(_)
        | StepError::InputContractViolation { .. }
        | StepError::MatrixConflict { .. }
        | StepError::StdoutArtifactTooLarge { .. }
        | StepError::RelayOverflow
        | StepError::PermissionDenied(_)
        | StepError::Cancelled
        | StepError::Template(_)
        | StepError::Artifact(_)
        | StepError::Contract(_)
        | StepError::Security(_)
        | StepError::Io(_) => ErrorClass::Fatal,
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponential backoff bounds with a jitter factor (0.0 = none, 1.0 = full).
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry `attempt` (0-based): `base * 2^attempt`, jittered,
    /// clamped to `[base, max]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.max);

        if self.jitter <= 0.0 {
            return exp.max(self.base);
        }

        let mut rng = rand::thread_rng();
        let factor = 1.0 - self.jitter + rng.gen::<f64>() * 2.0 * self.jitter;
        let millis = (exp.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(millis).clamp(self.base, self.max)
    }
}

// ============================================================================
// PROMPT ENHANCEMENT
// ============================================================================

/// Escalating corrective layers, indexed by retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnhancementLevel {
    Minimal,
    Moderate,
    Aggressive,
    Maximal,
}

impl EnhancementLevel {
    pub fn for_attempt(attempt: u32) -> Self {
        match attempt {
            0 => EnhancementLevel::Minimal,
            1 => EnhancementLevel::Moderate,
            2 => EnhancementLevel::Aggressive,
            _ => EnhancementLevel::Maximal,
        }
    }
}

/// Build the retry prompt: the original `exec.source` rendering plus the
/// corrective layer for this attempt. Additive only; the original prompt text
/// is preserved verbatim.
pub fn enhance_prompt(
    original: &str,
    level: EnhancementLevel,
    prior_errors: &[String],
    schema_excerpt: Option<&str>,
) -> String {
    let mut prompt = String::with_capacity(original.len() + 512);

    if level >= EnhancementLevel::Maximal {
        prompt.push_str(
            "EMERGENCY: this is the final attempt. Another validation failure \
             aborts the whole pipeline. Produce ONLY the required output.\n\n",
        );
    }

    prompt.push_str(original);
    prompt.push_str("\n\n---\nYour previous output failed validation.");

    if level >= EnhancementLevel::Moderate && !prior_errors.is_empty() {
        prompt.push_str("\nValidation errors from the last attempt:\n");
        for err in prior_errors {
            prompt.push_str("- ");
            prompt.push_str(err);
            prompt.push('\n');
        }
    }

    if level >= EnhancementLevel::Aggressive {
        if let Some(schema) = schema_excerpt {
            prompt.push_str("\nThe output MUST validate against this JSON Schema:\n");
            prompt.push_str(schema);
            prompt.push('\n');
        }
        prompt.push_str(
            "\nRespond with the required format only. No prose, no markdown fences, \
             no explanations.\n",
        );
    }

    prompt
}
