//! Single-pass prompt template resolver
//!
//! Substitutes the closed placeholder set into a step's `exec.source`:
//!
//! | Placeholder | Source |
//! |---|---|
//! | `{{ input }}` | pipeline input text |
//! | `{{ pipeline_id }}` | run id |
//! | `{{ project.<key> }}` | manifest metadata labels |
//! | `{{ artifacts.<name> }}` | injected artifact content (UTF-8, inlined) |
//! | `{{ task }}` | matrix per-item value |
//!
//! Substitution is one pass over the template; substituted values are data
//! and are never re-expanded.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown template placeholder '{{{{ {0} }}}}'")]
    UnknownPlaceholder(String),

    #[error("template references artifact '{0}' which was not injected")]
    MissingArtifact(String),

    #[error("template references unknown project key '{0}'")]
    MissingProjectKey(String),

    #[error("'{{{{ task }}}}' used outside a matrix step")]
    TaskUnavailable,
}

/// Injected artifact content as seen by the template
#[derive(Debug, Clone)]
pub enum ArtifactText {
    Inline(String),
    /// Declared `optional: true` and absent: renders as the empty string
    OptionalMissing,
}

/// Everything a template may draw from
#[derive(Debug, Default)]
pub struct TemplateContext<'a> {
    pub input: &'a str,
    pub pipeline_id: &'a str,
    pub project: Option<&'a BTreeMap<String, String>>,
    pub artifacts: HashMap<String, ArtifactText>,
    pub task: Option<&'a serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Literal(Range<usize>),
    Placeholder(String),
}

/// Tokenize a template: literals plus `{{ ... }}` spans. A `{{` without a
/// closing `}}` is treated as literal text.
fn tokenize(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'{' && bytes[i + 1] == b'{' {
            match template[i + 2..].find("}}") {
                Some(rel_end) => {
                    if i > literal_start {
                        tokens.push(Token::Literal(literal_start..i));
                    }
                    let inner = template[i + 2..i + 2 + rel_end].trim().to_string();
                    tokens.push(Token::Placeholder(inner));
                    i += 2 + rel_end + 2;
                    literal_start = i;
                }
                None => break,
            }
        } else {
            i += 1;
        }
    }

    if literal_start < template.len() {
        tokens.push(Token::Literal(literal_start..template.len()));
    }
    tokens
}

/// Render a template against the context.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());

    for token in tokenize(template) {
        match token {
            Token::Literal(range) => out.push_str(&template[range]),
            Token::Placeholder(name) => out.push_str(&resolve(&name, ctx)?),
        }
    }
    Ok(out)
}

fn resolve(name: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    match name {
        "input" => Ok(ctx.input.to_string()),
        "pipeline_id" => Ok(ctx.pipeline_id.to_string()),
        "task" => {
            let task = ctx.task.ok_or(TemplateError::TaskUnavailable)?;
            Ok(match task {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
        _ => {
            if let Some(key) = name.strip_prefix("project.") {
                let value = ctx
                    .project
                    .and_then(|p| p.get(key))
                    .ok_or_else(|| TemplateError::MissingProjectKey(key.to_string()))?;
                return Ok(value.clone());
            }
            if let Some(artifact) = name.strip_prefix("artifacts.") {
                return match ctx.artifacts.get(artifact) {
                    Some(ArtifactText::Inline(content)) => Ok(content.clone()),
                    Some(ArtifactText::OptionalMissing) => Ok(String::new()),
                    None => Err(TemplateError::MissingArtifact(artifact.to_string())),
                };
            }
            Err(TemplateError::UnknownPlaceholder(name.to_string()))
        }
    }
}
