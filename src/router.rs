//! Router, ad-hoc generation, meta-pipeline validation
//!
//! The router selects a pipeline by matching labeled input against rules
//! (first match wins, optional default). Ad-hoc turns free text into a
//! minimal in-memory navigator → craftsman pipeline. Meta validates a
//! persona-generated pipeline against the semantic constraints that bound
//! runtime self-extension.

use crate::manifest::{Manifest, MetaPipelineConfig};
use crate::pipeline::{
    ArtifactSource, ArtifactType, ExecDef, InjectArtifact, InputDef, OutputArtifactDef, Pipeline,
    PipelineMeta, Step,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Default persona for the ad-hoc execution step
pub const DEFAULT_EXECUTE_PERSONA: &str = "craftsman";

/// Persona for the ad-hoc exploration step
pub const NAVIGATOR_PERSONA: &str = "navigator";

/// Tools a navigator-capable persona may hold
const READ_ONLY_TOOLS: [&str; 4] = ["Read", "Grep", "Glob", "WebFetch"];

// ============================================================================
// ROUTER
// ============================================================================

/// One routing rule: all `match_labels` must be present with equal values.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterRule {
    pub match_labels: BTreeMap<String, String>,
    pub pipeline: String,
}

/// Label-based pipeline selection, first match wins.
#[derive(Debug, Clone, Default)]
pub struct Router {
    rules: Vec<RouterRule>,
    default: Option<String>,
}

impl Router {
    pub fn new(rules: Vec<RouterRule>, default: Option<String>) -> Self {
        Self { rules, default }
    }

    pub fn select(&self, labels: &BTreeMap<String, String>) -> Option<&str> {
        for rule in &self.rules {
            let matches = rule
                .match_labels
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v));
            if matches {
                return Some(&rule.pipeline);
            }
        }
        self.default.as_deref()
    }
}

// ============================================================================
// AD-HOC
// ============================================================================

/// Build the minimal two-step pipeline for free-text input: a read-only
/// navigator survey feeding an execution step. Not persisted unless the
/// caller saves it.
pub fn adhoc_pipeline(execute_persona: Option<&str>) -> Pipeline {
    let execute_persona = execute_persona.unwrap_or(DEFAULT_EXECUTE_PERSONA);

    let navigate = Step {
        id: "navigate".to_string(),
        persona: NAVIGATOR_PERSONA.to_string(),
        depends_on: vec![],
        workspace: Default::default(),
        memory: Default::default(),
        exec: ExecDef {
            source: "Explore the repository without modifying anything and write a \
                     concise survey of everything relevant to this request:\n{{ input }}"
                .to_string(),
        },
        inject_artifacts: vec![],
        output_artifacts: vec![OutputArtifactDef {
            name: "survey".to_string(),
            path: None,
            source: ArtifactSource::Stdout,
            artifact_type: ArtifactType::Markdown,
        }],
        handover: None,
        strategy: None,
        timeout_minutes: None,
        max_retries: None,
    };

    let execute = Step {
        id: "execute".to_string(),
        persona: execute_persona.to_string(),
        depends_on: vec!["navigate".to_string()],
        workspace: Default::default(),
        memory: Default::default(),
        exec: ExecDef {
            source: "Request:\n{{ input }}\n\nRepository survey from a prior \
                     exploration pass:\n{{ artifacts.survey }}\n\nCarry out the request."
                .to_string(),
        },
        inject_artifacts: vec![InjectArtifact {
            from_step: "navigate".to_string(),
            name: "survey".to_string(),
            alias: None,
            expected_type: Some(ArtifactType::Markdown),
            schema_path: None,
            optional: false,
        }],
        output_artifacts: vec![],
        handover: None,
        strategy: None,
        timeout_minutes: None,
        max_retries: None,
    };

    Pipeline {
        kind: "WavePipeline".to_string(),
        metadata: PipelineMeta {
            name: "adhoc".to_string(),
            labels: BTreeMap::new(),
        },
        input: InputDef::default(),
        steps: vec![navigate, execute],
    }
}

// ============================================================================
// META
// ============================================================================

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("meta pipeline depth {depth} exceeds max_depth {max}")]
    TooDeep { depth: u32, max: u32 },

    #[error("meta pipeline has {steps} steps, exceeding max_total_steps {max}")]
    TooManySteps { steps: usize, max: usize },

    #[error("meta pipeline step '{0}' has no handover contract")]
    MissingContract(String),

    #[error("meta pipeline first step '{step}' persona '{persona}' is not navigator-capable (read-only tools required)")]
    FirstStepNotNavigator { step: String, persona: String },

    #[error("meta pipeline references unknown persona '{0}'")]
    UnknownPersona(String),

    #[error("meta pipeline has no steps")]
    Empty,
}

/// Navigator-capable: a non-empty allow list drawn entirely from the
/// read-only tool set.
fn is_navigator_capable(manifest: &Manifest, persona_name: &str) -> bool {
    let Some(persona) = manifest.persona(persona_name) else {
        return false;
    };
    let allowed = &persona.permissions.allowed_tools;
    !allowed.is_empty()
        && allowed
            .iter()
            .all(|t| READ_ONLY_TOOLS.contains(&t.as_str()))
}

/// Semantic constraints for persona-generated pipelines, checked before
/// execution on top of regular DAG validation. Token and wall-clock caps are
/// enforced at runtime by the executor's run limits.
pub fn validate_meta(
    pipeline: &Pipeline,
    manifest: &Manifest,
    limits: &MetaPipelineConfig,
    depth: u32,
) -> Result<(), MetaError> {
    if depth > limits.max_depth {
        return Err(MetaError::TooDeep {
            depth,
            max: limits.max_depth,
        });
    }
    if pipeline.steps.is_empty() {
        return Err(MetaError::Empty);
    }
    if pipeline.steps.len() > limits.max_total_steps {
        return Err(MetaError::TooManySteps {
            steps: pipeline.steps.len(),
            max: limits.max_total_steps,
        });
    }

    for step in &pipeline.steps {
        if manifest.persona(&step.persona).is_none() {
            return Err(MetaError::UnknownPersona(step.persona.clone()));
        }
        if step.contract().is_none() {
            return Err(MetaError::MissingContract(step.id.clone()));
        }
    }

    // Fresh memory is guaranteed by the type system; the remaining semantic
    // constraint is a read-only first step.
    let first = &pipeline.steps[0];
    if !is_navigator_capable(manifest, &first.persona) {
        return Err(MetaError::FirstStepNotNavigator {
            step: first.id.clone(),
            persona: first.persona.clone(),
        });
    }

    Ok(())
}
