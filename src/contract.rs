//! Handover contract validation
//!
//! Enforces artifact shape and behavior at step boundaries, on both inputs
//! (injected artifacts) and outputs. Contract kinds are a closed set:
//! draft-07 JSON Schema, test-suite command, markdown structure, and format
//! pattern.
//!
//! ## JSON recovery discipline
//!
//! When a produced artifact is invalid JSON a bounded, content-preserving
//! recovery pass runs before revalidation: markdown fences are stripped, the
//! outermost JSON value is extracted from mixed prose, trailing commas are
//! dropped, single-quoted strings become double-quoted, and whitespace is
//! normalized line-wise. Nothing inside string literals is ever touched, and
//! JSON that is valid as-is returns byte-identical immediately.

use crate::pipeline::{Contract, ContractKind, InjectArtifact};
use dashmap::DashMap;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("cannot load schema '{path}': {message}")]
    SchemaLoad { path: String, message: String },

    #[error("format pattern '{pattern}' is invalid: {message}")]
    BadPattern { pattern: String, message: String },

    #[error("failed to run test-suite command: {0}")]
    CommandFailed(#[from] std::io::Error),
}

/// Result of one contract check
#[derive(Debug, Clone)]
pub enum OutputCheck {
    Passed {
        /// Recovered JSON replacing the raw artifact content; `None` when the
        /// raw output already satisfied the contract (byte-identical commit).
        recovered: Option<String>,
    },
    Failed {
        errors: Vec<String>,
    },
}

impl OutputCheck {
    pub fn passed(&self) -> bool {
        matches!(self, OutputCheck::Passed { .. })
    }
}

/// Compiles and caches schemas; evaluates contracts.
#[derive(Default)]
pub struct ContractValidator {
    base_dir: PathBuf,
    cache: DashMap<PathBuf, Arc<JSONSchema>>,
}

impl ContractValidator {
    /// Relative schema paths resolve against `base_dir` (the manifest dir).
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            cache: DashMap::new(),
        }
    }

    fn compiled(&self, schema_path: &Path) -> Result<Arc<JSONSchema>, ContractError> {
        let resolved = if schema_path.is_absolute() {
            schema_path.to_path_buf()
        } else {
            self.base_dir.join(schema_path)
        };
        if let Some(hit) = self.cache.get(&resolved) {
            return Ok(Arc::clone(&hit));
        }

        let raw = std::fs::read_to_string(&resolved).map_err(|e| ContractError::SchemaLoad {
            path: resolved.display().to_string(),
            message: e.to_string(),
        })?;
        let schema: Value =
            serde_json::from_str(&raw).map_err(|e| ContractError::SchemaLoad {
                path: resolved.display().to_string(),
                message: e.to_string(),
            })?;
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema)
            .map_err(|e| ContractError::SchemaLoad {
                path: resolved.display().to_string(),
                message: e.to_string(),
            })?;

        let compiled = Arc::new(compiled);
        self.cache.insert(resolved, Arc::clone(&compiled));
        Ok(compiled)
    }

    fn schema_errors(schema: &JSONSchema, value: &Value) -> Vec<String> {
        match schema.validate(value) {
            Ok(()) => Vec::new(),
            Err(errors) => errors
                .map(|e| format!("{}: {}", e.instance_path, e))
                .collect(),
        }
    }

    /// Validate an output artifact's content against its contract.
    pub async fn check_output(
        &self,
        contract: &Contract,
        content: &str,
        workspace_dir: &Path,
    ) -> Result<OutputCheck, ContractError> {
        match &contract.kind {
            ContractKind::JsonSchema { schema_path } => {
                let schema = self.compiled(schema_path)?;

                // Raw output first: a satisfied contract never rewrites it.
                if let Ok(value) = serde_json::from_str::<Value>(content) {
                    let errors = Self::schema_errors(&schema, &value);
                    return Ok(if errors.is_empty() {
                        OutputCheck::Passed { recovered: None }
                    } else {
                        OutputCheck::Failed { errors }
                    });
                }

                let recovered = recover_json(content);
                match serde_json::from_str::<Value>(&recovered) {
                    Ok(value) => {
                        let errors = Self::schema_errors(&schema, &value);
                        Ok(if errors.is_empty() {
                            OutputCheck::Passed {
                                recovered: Some(recovered.into_owned()),
                            }
                        } else {
                            OutputCheck::Failed { errors }
                        })
                    }
                    Err(e) => Ok(OutputCheck::Failed {
                        errors: vec![format!("output is not valid JSON: {e}")],
                    }),
                }
            }

            ContractKind::TestSuite { command } => {
                let output = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .current_dir(workspace_dir)
                    .output()
                    .await?;
                if output.status.success() {
                    Ok(OutputCheck::Passed { recovered: None })
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    Ok(OutputCheck::Failed {
                        errors: vec![format!(
                            "test suite '{command}' exited {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        )],
                    })
                }
            }

            ContractKind::MarkdownSpec { required_sections } => {
                let missing: Vec<String> = required_sections
                    .iter()
                    .filter(|section| !has_heading(content, section))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Ok(OutputCheck::Passed { recovered: None })
                } else {
                    Ok(OutputCheck::Failed {
                        errors: missing
                            .into_iter()
                            .map(|s| format!("missing required section '{s}'"))
                            .collect(),
                    })
                }
            }

            ContractKind::Format { pattern } => {
                let re = regex::Regex::new(pattern).map_err(|e| ContractError::BadPattern {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })?;
                if re.is_match(content) {
                    Ok(OutputCheck::Passed { recovered: None })
                } else {
                    Ok(OutputCheck::Failed {
                        errors: vec![format!("output does not match pattern '{pattern}'")],
                    })
                }
            }
        }
    }

    /// Validate an injected artifact against its declared schema, if any.
    pub fn check_input(
        &self,
        inject: &InjectArtifact,
        content: &str,
    ) -> Result<OutputCheck, ContractError> {
        let Some(schema_path) = &inject.schema_path else {
            return Ok(OutputCheck::Passed { recovered: None });
        };
        let schema = self.compiled(schema_path)?;
        let value: Value = match serde_json::from_str(content) {
            Ok(v) => v,
            Err(e) => {
                return Ok(OutputCheck::Failed {
                    errors: vec![format!(
                        "injected artifact '{}' is not valid JSON: {e}",
                        inject.name
                    )],
                })
            }
        };
        let errors = Self::schema_errors(&schema, &value);
        Ok(if errors.is_empty() {
            OutputCheck::Passed { recovered: None }
        } else {
            OutputCheck::Failed { errors }
        })
    }
}

fn has_heading(content: &str, section: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with('#') && trimmed.trim_start_matches('#').trim() == section
    })
}

// ============================================================================
// JSON RECOVERY
// ============================================================================

/// Bounded, content-preserving JSON repair.
///
/// Valid input returns borrowed and unmodified. String literal content is
/// never mutated.
pub fn recover_json(raw: &str) -> Cow<'_, str> {
    if serde_json::from_str::<Value>(raw).is_ok() {
        return Cow::Borrowed(raw);
    }

    let defenced = strip_fences(raw);
    let extracted = extract_json(defenced).unwrap_or(defenced);
    let repaired = repair_outside_strings(extracted);
    Cow::Owned(repaired)
}

/// Strip a surrounding ```json ... ``` (or bare ```) fence.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return raw;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => return raw,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Extract the outermost balanced JSON object/array from mixed prose.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let open = raw.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, b) in raw.bytes().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// One scanner pass applying the outside-string fixes: trailing comma
/// removal, single→double quote rewriting, and line-wise space collapsing.
fn repair_outside_strings(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_space = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                last_space = false;
                out.push(c);
            }
            // Single-quoted string: rewrite delimiters, keep content intact.
            '\'' => {
                last_space = false;
                out.push('"');
                while let Some(sc) = chars.next() {
                    match sc {
                        '\\' => {
                            if let Some(&next) = chars.peek() {
                                if next == '\'' {
                                    chars.next();
                                    out.push('\'');
                                    continue;
                                }
                            }
                            out.push('\\');
                        }
                        '\'' => break,
                        '"' => out.push_str("\\\""),
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            ',' => {
                // Trailing comma: look ahead past whitespace for a closer.
                let mut lookahead = chars.clone();
                let mut next_meaningful = None;
                for la in lookahead.by_ref() {
                    if !la.is_whitespace() {
                        next_meaningful = Some(la);
                        break;
                    }
                }
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    // Drop the comma.
                } else {
                    out.push(',');
                }
                last_space = false;
            }
            ' ' | '\t' => {
                // Collapse runs within a line only.
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
            '\n' => {
                last_space = false;
                out.push('\n');
            }
            other => {
                last_space = false;
                out.push(other);
            }
        }
    }
    out
}

/// Structured report written after retries exhaust. Preserves the raw output
/// verbatim for operator inspection; never fed back into validation.
pub fn error_envelope(raw: &str, attempts: u32, errors: &[String]) -> Value {
    serde_json::json!({
        "error": "contract validation failed",
        "attempts": attempts,
        "validation_errors": errors,
        "raw_output": raw,
    })
}
