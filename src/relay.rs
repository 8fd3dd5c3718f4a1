//! Relay supervisor (context compaction)
//!
//! Watches a running step's cumulative token usage; when it crosses the
//! configured percentage of the persona's context budget, the step's adapter
//! is killed, a summarizer persona produces a checkpoint document from the
//! session transcript, and a fresh instance of the original persona restarts
//! with that checkpoint as primary context.
//!
//! Each relay receives only the most recent checkpoint; checkpoints never
//! chain. The summarizer has its own hard token cap and failing to fit under
//! it fails the step with a relay-overflow error rather than recursing.

use crate::driver::{AdapterDriver, AdapterInvocation};
use crate::manifest::{Manifest, Permissions, RelayConfig};
use crate::retry::StepError;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Tools the summarizer may use: strictly read-only.
const SUMMARIZER_TOOLS: [&str; 3] = ["Read", "Grep", "Glob"];

/// Required checkpoint sections, in order.
const CHECKPOINT_SECTIONS: [&str; 5] = [
    "Completed actions",
    "Current state",
    "Modified files",
    "Remaining work",
    "Resume instructions",
];

#[derive(Debug, Clone)]
pub struct RelaySupervisor {
    config: RelayConfig,
}

impl RelaySupervisor {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    /// Relay only works with a configured summarizer persona.
    pub fn enabled(&self) -> bool {
        self.config.summarizer_persona.is_some()
    }

    /// True when usage has crossed the threshold percentage of the budget.
    pub fn should_relay(&self, tokens_used: u64, context_budget: u64) -> bool {
        self.enabled()
            && context_budget > 0
            && tokens_used.saturating_mul(100)
                >= context_budget.saturating_mul(u64::from(self.config.token_threshold_percent))
    }

    /// Run the summarizer over the transcript; returns the checkpoint
    /// document and the tokens the summarizer itself consumed.
    pub async fn checkpoint(
        &self,
        manifest: &Manifest,
        transcript: &[String],
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, u64), StepError> {
        let persona_name = self
            .config
            .summarizer_persona
            .as_deref()
            .ok_or(StepError::RelayOverflow)?;
        let persona = manifest
            .persona(persona_name)
            .ok_or(StepError::RelayOverflow)?;
        let adapter = manifest.adapter_for(persona).clone();
        let system_prompt = manifest
            .system_prompt(persona)
            .map_err(|e| StepError::Io(std::io::Error::other(e.to_string())))?;

        let prompt = summarizer_prompt(transcript);
        let invocation = AdapterInvocation {
            persona_name: persona_name.to_string(),
            adapter,
            system_prompt,
            prompt,
            permissions: Permissions {
                allowed_tools: SUMMARIZER_TOOLS.iter().map(|s| s.to_string()).collect(),
                deny: Vec::new(),
            },
            temperature: persona.temperature,
            env_passthrough: Vec::new(),
            workdir: workdir.to_path_buf(),
            timeout: Duration::from_secs(300),
            capture_stdout: Some(1024 * 1024),
            scan_root: None,
            attempt: 0,
        };

        let result = AdapterDriver.run(&invocation, cancel, None).await?;
        if result.tokens_used > self.config.summarizer_token_cap {
            return Err(StepError::RelayOverflow);
        }

        let checkpoint = result
            .stdout
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        if checkpoint.trim().is_empty() {
            return Err(StepError::RelayOverflow);
        }
        info!(summarizer = persona_name, bytes = checkpoint.len(), "checkpoint produced");
        Ok((checkpoint, result.tokens_used))
    }
}

/// Summarizer instruction over the session transcript.
fn summarizer_prompt(transcript: &[String]) -> String {
    let mut prompt = String::from(
        "The session below must be handed over to a fresh instance with no \
         memory of it. Write a checkpoint document with exactly these \
         markdown sections:\n",
    );
    for section in CHECKPOINT_SECTIONS {
        prompt.push_str("## ");
        prompt.push_str(section);
        prompt.push('\n');
    }
    prompt.push_str("\nSession transcript:\n");
    for line in transcript {
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt
}

/// Prompt for the restarted persona: the latest checkpoint is the primary
/// context, followed by the original instruction.
pub fn resume_prompt(checkpoint: &str, original_prompt: &str) -> String {
    format!(
        "You are resuming interrupted work. A previous instance produced this \
         checkpoint; treat it as ground truth and continue from it.\n\n\
         {checkpoint}\n\n---\nOriginal instruction:\n{original_prompt}"
    )
}
