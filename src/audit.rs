//! Audit log
//!
//! Per-run NDJSON file at `<log_dir>/<run-id>-<pipeline>-<ts>.ndjson`.
//! Records tool calls, file operations, permission denials, hook executions,
//! and contract validations. Credential-pattern values are replaced with
//! `[REDACTED]` before anything reaches disk.

use crate::manifest::AuditConfig;
use crate::security::Redactor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryType {
    ToolCall,
    FileRead,
    FileWrite,
    FileDelete,
    PermissionDenied,
    HookExecuted,
    ContractValidation,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub pipeline_id: String,
    pub step_id: String,
    pub persona: String,
    #[serde(rename = "type")]
    pub entry_type: AuditEntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    pub fn new(
        pipeline_id: &str,
        step_id: &str,
        persona: &str,
        entry_type: AuditEntryType,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            pipeline_id: pipeline_id.to_string(),
            step_id: step_id.to_string(),
            persona: persona.to_string(),
            entry_type,
            tool: None,
            args: None,
            result: None,
            duration_ms: None,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Append-only per-run audit sink. A disabled log swallows entries.
pub struct AuditLog {
    inner: Option<Mutex<std::fs::File>>,
    redactor: Redactor,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Open the run's audit file per policy; disabled when no log dir is
    /// configured.
    pub fn open(
        config: &AuditConfig,
        run_id: &str,
        pipeline_name: &str,
        redactor: Redactor,
    ) -> Self {
        let Some(dir) = &config.log_dir else {
            return Self::disabled(redactor);
        };
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!(error = %e, "cannot create audit log dir, auditing disabled");
            return Self::disabled(redactor);
        }

        let ts = Utc::now().format("%Y%m%dT%H%M%S");
        let path = dir.join(format!("{run_id}-{pipeline_name}-{ts}.ndjson"));
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(file) => Self {
                inner: Some(Mutex::new(file)),
                redactor,
                path: Some(path),
            },
            Err(e) => {
                warn!(error = %e, "cannot open audit log, auditing disabled");
                Self::disabled(redactor)
            }
        }
    }

    pub fn disabled(redactor: Redactor) -> Self {
        Self {
            inner: None,
            redactor,
            path: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Append one entry; IO failures are logged, never fatal.
    pub fn record(&self, entry: AuditEntry) {
        let Some(file) = &self.inner else {
            return;
        };
        let Ok(line) = serde_json::to_string(&entry) else {
            return;
        };
        let line = self.redactor.redact(&line);
        let mut file = file.lock();
        if let Err(e) = writeln!(file, "{line}") {
            warn!(error = %e, "audit write failed");
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("enabled", &self.enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn disabled_without_log_dir() {
        let log = AuditLog::open(
            &AuditConfig::default(),
            "run-1",
            "review",
            Redactor::default(),
        );
        assert!(!log.enabled());
        // Recording into a disabled log is a no-op, not a panic.
        log.record(AuditEntry::new("run-1", "s", "p", AuditEntryType::ToolCall));
    }

    #[test]
    fn records_ndjson_entries() {
        let dir = TempDir::new().unwrap();
        let config = AuditConfig {
            log_dir: Some(dir.path().to_path_buf()),
            log_all_tool_calls: true,
            log_all_file_operations: true,
        };
        let log = AuditLog::open(&config, "run-1", "review", Redactor::default());
        assert!(log.enabled());

        log.record(
            AuditEntry::new("run-1", "plan", "navigator", AuditEntryType::ToolCall)
                .with_tool("Read")
                .with_duration(12),
        );
        log.record(AuditEntry::new(
            "run-1",
            "plan",
            "navigator",
            AuditEntryType::ContractValidation,
        ));

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "tool_call");
        assert_eq!(first["tool"], "Read");
        assert_eq!(first["duration_ms"], 12);
    }

    #[test]
    fn file_name_includes_run_and_pipeline() {
        let dir = TempDir::new().unwrap();
        let config = AuditConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let log = AuditLog::open(&config, "review-ab12cd34", "review", Redactor::default());
        let name = log.path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("review-ab12cd34-review-"));
        assert!(name.ends_with(".ndjson"));
    }

    #[test]
    fn credentials_are_redacted_in_entries() {
        let dir = TempDir::new().unwrap();
        let config = AuditConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let redactor = Redactor::with_values(vec!["sk-verysecret123".to_string()]);
        let log = AuditLog::open(&config, "r", "p", redactor);

        log.record(
            AuditEntry::new("r", "s", "p", AuditEntryType::ToolCall)
                .with_result("called api with sk-verysecret123"),
        );

        let content = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(!content.contains("sk-verysecret123"));
        assert!(content.contains("[REDACTED]"));
    }
}
