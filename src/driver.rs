//! Adapter driver
//!
//! Executes one persona-authored step: spawns the adapter subprocess with a
//! curated environment and projected permissions, streams its structured
//! output, enforces the per-step timeout, and returns stdout, token usage,
//! and file deltas.
//!
//! ## Permission projection
//!
//! The persona's `{allowed_tools, deny}` set is emitted twice: as a settings
//! file the adapter consumes (`--settings`-style flag via the `{settings}`
//! arg placeholder) and as a human-readable restriction prologue prepended to
//! the prompt. Denies take precedence; a non-empty allow list means anything
//! unlisted is denied.
//!
//! ## Token accounting
//!
//! `stream_json` adapters emit NDJSON with per-turn
//! `usage.{input_tokens, output_tokens, cache_read_input_tokens,
//! cache_creation_input_tokens}` blocks; these are summed into a running
//! cumulative count and the terminal event's figure is authoritative.
//! Adapters without structured usage fall back to `len(output) / 4`.

use crate::manifest::{AdapterDef, AdapterMode, Permissions};
use crate::retry::StepError;
use crate::security::curated_env;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Availability probe timeout, matching the interactive CLI check
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Live signal from a running adapter
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// Cumulative token usage after a usage-bearing stream event
    Tokens(u64),
    /// One raw output line (the transcript feed for relay)
    Line(String),
}

/// Everything needed to run one adapter attempt
#[derive(Debug, Clone)]
pub struct AdapterInvocation {
    pub persona_name: String,
    pub adapter: AdapterDef,
    pub system_prompt: String,
    pub prompt: String,
    pub permissions: Permissions,
    pub temperature: Option<f32>,
    pub env_passthrough: Vec<String>,
    /// Subprocess working directory (the step workspace)
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// `Some(cap)` when the step declares a stdout-sourced artifact
    pub capture_stdout: Option<usize>,
    /// Directory tree whose mutations count as the step's file deltas
    pub scan_root: Option<PathBuf>,
    /// Retry attempt index; scripted mock adapters key responses off it
    pub attempt: u32,
}

/// Outcome of one adapter attempt
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub exit_code: i32,
    pub tokens_used: u64,
    /// Captured stdout, present only when requested
    pub stdout: Option<Vec<u8>>,
    /// Raw output lines (the session transcript, relay input)
    pub transcript: Vec<String>,
    /// Paths modified beneath `scan_root` during the attempt
    pub files_changed: Vec<PathBuf>,
    /// Tools the adapter asked for and was denied
    pub denied_tools: Vec<String>,
}

/// Stateless subprocess supervisor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterDriver;

impl AdapterDriver {
    /// Check that an adapter binary responds to `--version` within 5s.
    pub fn is_available(adapter: &AdapterDef) -> bool {
        use wait_timeout::ChildExt;

        if adapter.mode == AdapterMode::Mock {
            return true;
        }
        std::process::Command::new(&adapter.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .and_then(|mut child| match child.wait_timeout(AVAILABILITY_TIMEOUT)? {
                Some(status) => Ok(status.success()),
                None => {
                    let _ = child.kill();
                    Ok(false)
                }
            })
            .unwrap_or(false)
    }

    /// Run one attempt.
    ///
    /// `progress` receives transcript lines and cumulative token counts as
    /// the adapter streams.
    pub async fn run(
        &self,
        invocation: &AdapterInvocation,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<DriverEvent>>,
    ) -> Result<AdapterResult, StepError> {
        if invocation.adapter.mode == AdapterMode::Mock {
            return Ok(self.run_mock(invocation, &progress));
        }

        let before = invocation.scan_root.as_deref().map(snapshot_tree);
        let settings_path = self.write_settings(invocation)?;
        let full_prompt = self.build_prompt(invocation);
        let args = substitute_args(&invocation.adapter.args, &full_prompt, &settings_path);

        let mut std_cmd = std::process::Command::new(&invocation.adapter.binary);
        std_cmd
            .args(&args)
            .current_dir(&invocation.workdir)
            .env_clear()
            .envs(curated_env(&invocation.env_passthrough))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so a kill reaches adapter-spawned grandchildren.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut child = tokio::process::Command::from(std_cmd)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::AdapterCrash {
                exit_code: None,
                message: format!(
                    "failed to spawn adapter '{}': {e}",
                    invocation.adapter.binary
                ),
            })?;
        let pid = child.id();

        let stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let stream = self.consume_stdout(stdout, invocation, progress);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_group(&mut child, pid).await;
                return Err(StepError::Cancelled);
            }
            streamed = tokio::time::timeout(invocation.timeout, stream) => {
                match streamed {
                    Ok(result) => result,
                    Err(_) => {
                        kill_group(&mut child, pid).await;
                        return Err(StepError::Timeout(invocation.timeout));
                    }
                }
            }
        };
        let streamed = outcome?;

        // Stream is drained; the wait itself is bounded by a short grace.
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .map_err(|_| StepError::Timeout(invocation.timeout))?
            .map_err(StepError::Io)?;

        if !status.success() {
            let mut err_buf = String::new();
            let _ = stderr.read_to_string(&mut err_buf).await;
            return Err(StepError::AdapterCrash {
                exit_code: status.code(),
                message: truncate(err_buf.trim(), 2000),
            });
        }

        let files_changed = match (before, invocation.scan_root.as_deref()) {
            (Some(before), Some(root)) => diff_tree(&before, root),
            _ => Vec::new(),
        };

        Ok(AdapterResult {
            exit_code: status.code().unwrap_or(0),
            tokens_used: streamed.tokens_used,
            stdout: streamed.captured,
            transcript: streamed.transcript,
            files_changed,
            denied_tools: streamed.denied_tools,
        })
    }

    /// Mock mode: no subprocess. Scripted responses come from the adapter's
    /// `args`, one per attempt (last entry repeats); with no script the
    /// prompt echoes back. Token counts are deterministic.
    fn run_mock(
        &self,
        invocation: &AdapterInvocation,
        progress: &Option<mpsc::UnboundedSender<DriverEvent>>,
    ) -> AdapterResult {
        let output = if invocation.adapter.args.is_empty() {
            invocation.prompt.clone()
        } else {
            let idx = (invocation.attempt as usize).min(invocation.adapter.args.len() - 1);
            invocation.adapter.args[idx].clone()
        };
        let tokens_used = ((invocation.prompt.len() + output.len()) / 4) as u64;
        if let Some(tx) = progress {
            let _ = tx.send(DriverEvent::Line(output.clone()));
            let _ = tx.send(DriverEvent::Tokens(tokens_used));
        }

        AdapterResult {
            exit_code: 0,
            tokens_used,
            stdout: invocation
                .capture_stdout
                .map(|_| output.clone().into_bytes()),
            transcript: vec![output],
            files_changed: Vec::new(),
            denied_tools: Vec::new(),
        }
    }

    async fn consume_stdout(
        &self,
        stdout: tokio::process::ChildStdout,
        invocation: &AdapterInvocation,
        progress: Option<mpsc::UnboundedSender<DriverEvent>>,
    ) -> Result<StreamedOutput, StepError> {
        let mut lines = LinesStream::new(BufReader::new(stdout).lines());
        let mut out = StreamedOutput::default();
        let mut captured_len = 0usize;
        let stream_json = invocation.adapter.mode == AdapterMode::StreamJson;

        while let Some(line) = lines.next().await {
            let line = line.map_err(StepError::Io)?;
            if let Some(cap) = invocation.capture_stdout {
                captured_len += line.len() + 1;
                if captured_len > cap {
                    return Err(StepError::StdoutArtifactTooLarge { limit: cap });
                }
                let buf = out.captured.get_or_insert_with(Vec::new);
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
            }

            if stream_json {
                if let Ok(value) = serde_json::from_str::<Value>(&line) {
                    self.ingest_event(&value, &mut out, &progress);
                }
            }
            if let Some(tx) = &progress {
                let _ = tx.send(DriverEvent::Line(line.clone()));
            }
            out.transcript.push(line);
        }

        if out.tokens_used == 0 {
            // No structured usage seen: estimate from output volume.
            let total: usize = out.transcript.iter().map(|l| l.len() + 1).sum();
            out.tokens_used = (total / 4) as u64;
        }

        // Trailing newline from line-splitting is not part of the artifact.
        if let Some(buf) = &mut out.captured {
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
        }
        Ok(out)
    }

    fn ingest_event(
        &self,
        event: &Value,
        out: &mut StreamedOutput,
        progress: &Option<mpsc::UnboundedSender<DriverEvent>>,
    ) {
        let usage = event
            .get("usage")
            .or_else(|| event.pointer("/message/usage"));
        if let Some(usage) = usage {
            let turn: u64 = [
                "input_tokens",
                "output_tokens",
                "cache_read_input_tokens",
                "cache_creation_input_tokens",
            ]
            .iter()
            .filter_map(|k| usage.get(*k).and_then(Value::as_u64))
            .sum();

            let is_terminal = event.get("type").and_then(Value::as_str) == Some("result");
            if is_terminal {
                // The terminal event carries the authoritative total.
                out.tokens_used = turn.max(out.tokens_used);
            } else {
                out.tokens_used += turn;
            }
            if let Some(tx) = progress {
                let _ = tx.send(DriverEvent::Tokens(out.tokens_used));
            }
        }

        if event.get("type").and_then(Value::as_str) == Some("permission_denied") {
            if let Some(tool) = event.get("tool").and_then(Value::as_str) {
                warn!(tool, "adapter tool request denied");
                out.denied_tools.push(tool.to_string());
            }
        }
    }

    /// Settings file the adapter consumes to enforce the permission set.
    fn write_settings(&self, invocation: &AdapterInvocation) -> Result<PathBuf, StepError> {
        let dir = invocation.workdir.join(".wave");
        std::fs::create_dir_all(&dir).map_err(StepError::Io)?;
        let path = dir.join("settings.json");

        let mut settings = serde_json::json!({
            "permissions": {
                "allow": invocation.permissions.allowed_tools,
                "deny": invocation.permissions.deny,
            }
        });
        if let Some(t) = invocation.temperature {
            settings["temperature"] = serde_json::json!(t);
        }
        std::fs::write(&path, serde_json::to_string_pretty(&settings).unwrap_or_default())
            .map_err(StepError::Io)?;
        debug!(path = %path.display(), "wrote adapter settings");
        Ok(path)
    }

    /// System prompt, restriction prologue, then the step prompt. The
    /// prologue mirrors the settings file rules (defense in depth).
    fn build_prompt(&self, invocation: &AdapterInvocation) -> String {
        let mut full = String::new();
        if !invocation.system_prompt.is_empty() {
            full.push_str(&invocation.system_prompt);
            full.push_str("\n\n");
        }
        let prologue = restriction_prologue(&invocation.permissions);
        if !prologue.is_empty() {
            full.push_str(&prologue);
            full.push_str("\n\n");
        }
        full.push_str(&invocation.prompt);
        full
    }
}

#[derive(Debug, Default)]
struct StreamedOutput {
    tokens_used: u64,
    captured: Option<Vec<u8>>,
    transcript: Vec<String>,
    denied_tools: Vec<String>,
}

/// Render the permission set as prompt text.
pub fn restriction_prologue(permissions: &Permissions) -> String {
    if permissions.allowed_tools.is_empty() && permissions.deny.is_empty() {
        return String::new();
    }
    let mut text = String::from("Tool restrictions for this session:\n");
    if !permissions.allowed_tools.is_empty() {
        text.push_str(&format!(
            "- You may ONLY use these tools: {}. Anything else is denied.\n",
            permissions.allowed_tools.join(", ")
        ));
    }
    if !permissions.deny.is_empty() {
        text.push_str(&format!(
            "- These tools are explicitly denied and take precedence: {}.\n",
            permissions.deny.join(", ")
        ));
    }
    text
}

/// Substitute `{prompt}` / `{settings}` placeholders; append the prompt when
/// no placeholder consumes it.
fn substitute_args(args: &[String], prompt: &str, settings: &Path) -> Vec<String> {
    let mut had_prompt = false;
    let mut out: Vec<String> = args
        .iter()
        .map(|a| {
            if a.contains("{prompt}") {
                had_prompt = true;
                a.replace("{prompt}", prompt)
            } else {
                a.replace("{settings}", &settings.display().to_string())
            }
        })
        .collect();
    if !had_prompt {
        out.push(prompt.to_string());
    }
    out
}

async fn kill_group(child: &mut tokio::process::Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child is its own group leader; signal the whole group.
        let _ = tokio::process::Command::new("kill")
            .arg("-9")
            .arg(format!("-{pid}"))
            .output()
            .await;
    }
    let _ = child.kill().await;
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ============================================================================
// FILE DELTA SNAPSHOTS
// ============================================================================

type TreeSnapshot = HashMap<PathBuf, (u64, u64)>;

/// Record (mtime, size) for every file beneath `root`, skipping `.git` and
/// the driver's own `.wave` settings directory.
fn snapshot_tree(root: &Path) -> TreeSnapshot {
    let mut snapshot = HashMap::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".git" && name != ".wave"
        })
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Ok(meta) = entry.metadata() {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            snapshot.insert(entry.into_path(), (mtime, meta.len()));
        }
    }
    snapshot
}

/// Files created or modified since `before` was taken.
fn diff_tree(before: &TreeSnapshot, root: &Path) -> Vec<PathBuf> {
    let after = snapshot_tree(root);
    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, meta)| before.get(*path) != Some(meta))
        .map(|(path, _)| path.clone())
        .collect();
    changed.sort();
    changed
}
