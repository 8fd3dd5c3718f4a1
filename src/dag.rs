//! DAG validation and execution ordering
//!
//! Runs at pipeline load, before anything touches a workspace:
//! - acyclicity by Kahn's algorithm, reporting the cycle members
//! - reference lint: dependencies, personas, injected artifacts, matrix
//!   sources, contract schemas
//!
//! Produces the [`ExecutionGraph`] the scheduler drives: a topological order
//! plus a dependents index for unblocking.

use crate::manifest::Manifest;
use crate::pipeline::{ContractKind, Pipeline, Step};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dep}'")]
    UnknownDependency { step: String, dep: String },

    #[error("pipeline contains a dependency cycle among: {}", members.join(", "))]
    Cycle { members: Vec<String> },

    #[error("step '{step}' references unknown persona '{persona}'")]
    UnknownPersona { step: String, persona: String },

    #[error("step '{step}' injects artifact '{name}' which step '{from_step}' does not produce")]
    UnknownArtifact {
        step: String,
        from_step: String,
        name: String,
    },

    #[error("step '{step}' injects from '{from_step}' without depending on it")]
    NotAnAncestor { step: String, from_step: String },

    #[error("step '{step}' injects from matrix step '{from_step}'; per-item outputs are not addressable")]
    MatrixOutputInjected { step: String, from_step: String },

    #[error("matrix step '{step}': {message}")]
    MatrixSource { step: String, message: String },

    #[error("step '{step}' contract schema '{path}' is not loadable: {message}")]
    SchemaUnloadable {
        step: String,
        path: String,
        message: String,
    },
}

/// Validated execution graph
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    /// Steps in a valid topological order
    pub order: Vec<String>,
    /// step id -> steps waiting on it
    pub dependents: HashMap<String, Vec<String>>,
    /// step id -> number of unfinished dependencies
    pub in_degree: HashMap<String, usize>,
}

/// Validate the pipeline against the manifest and build the execution graph.
pub fn validate(pipeline: &Pipeline, manifest: &Manifest) -> Result<ExecutionGraph, DagError> {
    let mut ids = HashSet::new();
    for step in &pipeline.steps {
        if !ids.insert(step.id.as_str()) {
            return Err(DagError::DuplicateStep(step.id.clone()));
        }
    }

    for step in &pipeline.steps {
        for dep in &step.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(DagError::UnknownDependency {
                    step: step.id.clone(),
                    dep: dep.clone(),
                });
            }
        }
        if manifest.persona(&step.persona).is_none() {
            return Err(DagError::UnknownPersona {
                step: step.id.clone(),
                persona: step.persona.clone(),
            });
        }
    }

    let graph = toposort(pipeline)?;
    let ancestors = ancestor_sets(pipeline);

    for step in &pipeline.steps {
        lint_injections(pipeline, step, &ancestors)?;
        lint_matrix(pipeline, step, &ancestors)?;
        lint_contract_schema(step, &manifest.base_dir)?;
    }

    Ok(graph)
}

fn toposort(pipeline: &Pipeline) -> Result<ExecutionGraph, DagError> {
    let mut in_degree: HashMap<String, usize> = HashMap::with_capacity(pipeline.steps.len());
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for step in &pipeline.steps {
        in_degree.insert(step.id.clone(), step.depends_on.len());
        for dep in &step.depends_on {
            dependents
                .entry(dep.clone())
                .or_default()
                .push(step.id.clone());
        }
    }

    let mut queue: VecDeque<String> = pipeline
        .steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| s.id.clone())
        .collect();

    let mut remaining = in_degree.clone();
    let mut order = Vec::with_capacity(pipeline.steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(next) = dependents.get(&id) {
            for n in next {
                let deg = remaining.get_mut(n).expect("dependent is a known step");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(n.clone());
                }
            }
        }
    }

    if order.len() != pipeline.steps.len() {
        let mut members: Vec<String> = remaining
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id)
            .collect();
        members.sort();
        return Err(DagError::Cycle { members });
    }

    Ok(ExecutionGraph {
        order,
        dependents,
        in_degree,
    })
}

/// Transitive dependency closure per step.
fn ancestor_sets(pipeline: &Pipeline) -> HashMap<String, HashSet<String>> {
    let by_id: HashMap<&str, &Step> = pipeline.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut sets: HashMap<String, HashSet<String>> = HashMap::new();

    for step in &pipeline.steps {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if seen.insert(id.to_string()) {
                if let Some(s) = by_id.get(id) {
                    stack.extend(s.depends_on.iter().map(String::as_str));
                }
            }
        }
        sets.insert(step.id.clone(), seen);
    }
    sets
}

fn lint_injections(
    pipeline: &Pipeline,
    step: &Step,
    ancestors: &HashMap<String, HashSet<String>>,
) -> Result<(), DagError> {
    for inject in &step.inject_artifacts {
        let producer = pipeline.step(&inject.from_step).ok_or_else(|| {
            DagError::UnknownDependency {
                step: step.id.clone(),
                dep: inject.from_step.clone(),
            }
        })?;

        if !ancestors[&step.id].contains(&inject.from_step) {
            return Err(DagError::NotAnAncestor {
                step: step.id.clone(),
                from_step: inject.from_step.clone(),
            });
        }
        if producer.matrix().is_some() {
            return Err(DagError::MatrixOutputInjected {
                step: step.id.clone(),
                from_step: inject.from_step.clone(),
            });
        }
        if producer.output_artifact(&inject.name).is_none() {
            return Err(DagError::UnknownArtifact {
                step: step.id.clone(),
                from_step: inject.from_step.clone(),
                name: inject.name.clone(),
            });
        }
    }
    Ok(())
}

fn lint_matrix(
    pipeline: &Pipeline,
    step: &Step,
    ancestors: &HashMap<String, HashSet<String>>,
) -> Result<(), DagError> {
    let Some(matrix) = step.matrix() else {
        return Ok(());
    };
    let Some((src_step, src_artifact)) = matrix.source_parts() else {
        return Err(DagError::MatrixSource {
            step: step.id.clone(),
            message: format!(
                "items_source '{}' must be '<step_id>/<artifact_name>'",
                matrix.items_source
            ),
        });
    };
    let Some(producer) = pipeline.step(src_step) else {
        return Err(DagError::MatrixSource {
            step: step.id.clone(),
            message: format!("items_source step '{src_step}' does not exist"),
        });
    };
    if !ancestors[&step.id].contains(src_step) {
        return Err(DagError::MatrixSource {
            step: step.id.clone(),
            message: format!("items_source step '{src_step}' is not a dependency"),
        });
    }
    if producer.output_artifact(src_artifact).is_none() {
        return Err(DagError::MatrixSource {
            step: step.id.clone(),
            message: format!("step '{src_step}' does not produce artifact '{src_artifact}'"),
        });
    }
    if matrix.item_key.is_empty() {
        return Err(DagError::MatrixSource {
            step: step.id.clone(),
            message: "item_key must be non-empty".to_string(),
        });
    }
    Ok(())
}

fn lint_contract_schema(step: &Step, base_dir: &Path) -> Result<(), DagError> {
    let paths = step
        .contract()
        .and_then(|c| match &c.kind {
            ContractKind::JsonSchema { schema_path } => Some(schema_path.clone()),
            _ => None,
        })
        .into_iter()
        .chain(
            step.inject_artifacts
                .iter()
                .filter_map(|i| i.schema_path.clone()),
        );

    for path in paths {
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            base_dir.join(&path)
        };
        let raw = std::fs::read_to_string(&resolved).map_err(|e| DagError::SchemaUnloadable {
            step: step.id.clone(),
            path: resolved.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str::<serde_json::Value>(&raw).map_err(|e| {
            DagError::SchemaUnloadable {
                step: step.id.clone(),
                path: resolved.display().to_string(),
                message: e.to_string(),
            }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use tempfile::TempDir;

    fn manifest_with(dir: &TempDir, personas: &[&str]) -> Manifest {
        std::fs::create_dir_all(dir.path().join("personas")).unwrap();
        std::fs::write(dir.path().join("personas/p.md"), "prompt").unwrap();
        let persona_yaml: String = personas
            .iter()
            .map(|p| {
                format!("  {p}:\n    adapter: mock\n    system_prompt_file: personas/p.md\n")
            })
            .collect();
        let yaml = format!(
            r#"
apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: t
adapters:
  mock:
    binary: "true"
    mode: mock
personas:
{persona_yaml}
"#
        );
        Manifest::parse(&yaml, dir.path()).unwrap()
    }

    fn diamond() -> Pipeline {
        Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: diamond
steps:
  - id: a
    persona: p
    exec: { source: "a" }
  - id: b
    persona: p
    depends_on: [a]
    exec: { source: "b" }
  - id: c
    persona: p
    depends_on: [a]
    exec: { source: "c" }
  - id: d
    persona: p
    depends_on: [b, c]
    exec: { source: "d" }
"#,
        )
        .unwrap()
    }

    #[test]
    fn diamond_orders_dependencies_first() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let graph = validate(&diamond(), &manifest).unwrap();

        let pos = |id: &str| graph.order.iter().position(|s| s == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
        assert_eq!(graph.in_degree["d"], 2);
        assert_eq!(graph.dependents["a"].len(), 2);
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: cyclic
steps:
  - id: a
    persona: p
    depends_on: [b]
    exec: { source: "a" }
  - id: b
    persona: p
    depends_on: [a]
    exec: { source: "b" }
"#,
        )
        .unwrap();

        match validate(&pipeline, &manifest) {
            Err(DagError::Cycle { members }) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_persona_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: a
    persona: ghost
    exec: { source: "a" }
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::UnknownPersona { .. })
        ));
    }

    #[test]
    fn injection_requires_producer_artifact() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: a
    persona: p
    exec: { source: "a" }
  - id: b
    persona: p
    depends_on: [a]
    inject_artifacts:
      - from_step: a
        name: report
    exec: { source: "b" }
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::UnknownArtifact { .. })
        ));
    }

    #[test]
    fn injection_requires_ancestry() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: a
    persona: p
    output_artifacts: [{ name: report }]
    exec: { source: "a" }
  - id: b
    persona: p
    inject_artifacts:
      - from_step: a
        name: report
    exec: { source: "b" }
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::NotAnAncestor { .. })
        ));
    }

    #[test]
    fn matrix_source_must_be_dependency_artifact() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: plan
    persona: p
    output_artifacts: [{ name: tasks, type: json }]
    exec: { source: "plan" }
  - id: fan
    persona: p
    depends_on: [plan]
    strategy:
      type: matrix
      items_source: plan/other
      item_key: tasks
    exec: { source: "{{ task }}" }
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::MatrixSource { .. })
        ));
    }

    #[test]
    fn injecting_matrix_output_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: plan
    persona: p
    output_artifacts: [{ name: tasks, type: json }]
    exec: { source: "plan" }
  - id: fan
    persona: p
    depends_on: [plan]
    output_artifacts: [{ name: result }]
    strategy:
      type: matrix
      items_source: plan/tasks
      item_key: tasks
    exec: { source: "{{ task }}" }
  - id: gather
    persona: p
    depends_on: [fan]
    inject_artifacts:
      - from_step: fan
        name: result
    exec: { source: "gather" }
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::MatrixOutputInjected { .. })
        ));
    }

    #[test]
    fn contract_schema_must_load() {
        let dir = TempDir::new().unwrap();
        let manifest = manifest_with(&dir, &["p"]);
        let pipeline = Pipeline::parse(
            r#"
kind: WavePipeline
metadata:
  name: x
steps:
  - id: a
    persona: p
    exec: { source: "a" }
    handover:
      contract:
        type: json_schema
        schema_path: schemas/missing.json
"#,
        )
        .unwrap();
        assert!(matches!(
            validate(&pipeline, &manifest),
            Err(DagError::SchemaUnloadable { .. })
        ));
    }
}
