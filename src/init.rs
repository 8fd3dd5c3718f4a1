//! Project initialization
//!
//! Scaffolds a Wave project: manifest, a starter pipeline, persona prompt
//! stubs, and a schema for the starter handover contract.

use anyhow::Result;
use std::fs;
use std::path::Path;

/// Initialize a new Wave project
pub fn init_project(name: &str, path: &Path) -> Result<InitResult> {
    let project_dir = if name == "." {
        path.to_path_buf()
    } else {
        path.join(name)
    };

    let manifest_path = project_dir.join("wave.yaml");
    if manifest_path.exists() {
        anyhow::bail!("wave.yaml already exists");
    }

    let pipelines_dir = project_dir.join("pipelines");
    let personas_dir = project_dir.join("personas");
    let schemas_dir = project_dir.join("schemas");
    fs::create_dir_all(&pipelines_dir)?;
    fs::create_dir_all(&personas_dir)?;
    fs::create_dir_all(&schemas_dir)?;

    let manifest_content = MANIFEST_TEMPLATE.replace("{{name}}", &project_name(name, path));
    fs::write(&manifest_path, manifest_content)?;
    fs::write(pipelines_dir.join("review.wave.yaml"), PIPELINE_TEMPLATE)?;
    fs::write(personas_dir.join("navigator.md"), NAVIGATOR_PROMPT)?;
    fs::write(personas_dir.join("craftsman.md"), CRAFTSMAN_PROMPT)?;
    fs::write(personas_dir.join("summarizer.md"), SUMMARIZER_PROMPT)?;
    fs::write(schemas_dir.join("tasks.json"), TASKS_SCHEMA)?;
    fs::write(project_dir.join(".gitignore"), GITIGNORE_TEMPLATE)?;

    Ok(InitResult {
        project_dir: project_dir.display().to_string(),
        files_created: vec![
            "wave.yaml".to_string(),
            "pipelines/review.wave.yaml".to_string(),
            "personas/navigator.md".to_string(),
            "personas/craftsman.md".to_string(),
            "personas/summarizer.md".to_string(),
            "schemas/tasks.json".to_string(),
            ".gitignore".to_string(),
        ],
    })
}

/// Result of project initialization
#[derive(Debug)]
pub struct InitResult {
    pub project_dir: String,
    pub files_created: Vec<String>,
}

fn project_name(name: &str, path: &Path) -> String {
    if name == "." {
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("my-project")
            .to_string()
    } else {
        name.to_string()
    }
}

const MANIFEST_TEMPLATE: &str = r#"apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: {{name}}
adapters:
  claude:
    binary: claude
    mode: stream_json
    args: ["-p", "{prompt}", "--output-format", "stream-json", "--settings", "{settings}"]
  mock:
    binary: "true"
    mode: mock
personas:
  navigator:
    adapter: claude
    system_prompt_file: personas/navigator.md
    permissions:
      allowed_tools: ["Read", "Grep", "Glob"]
      deny: []
  craftsman:
    adapter: claude
    system_prompt_file: personas/craftsman.md
    permissions:
      allowed_tools: ["Read", "Edit", "Write", "Bash(git:*)", "Bash(cargo:*)"]
      deny: ["Bash(rm:*)"]
  summarizer:
    adapter: claude
    system_prompt_file: personas/summarizer.md
    permissions:
      allowed_tools: ["Read", "Grep", "Glob"]
      deny: []
runtime:
  workspace_root: .wave/workspace
  state_root: .wave/state
  max_concurrent_workers: 4
  default_timeout_minutes: 30
  relay:
    token_threshold_percent: 80
    summarizer_persona: summarizer
  artifacts:
    max_stdout_size: 10485760
  sandbox:
    env_passthrough: ["ANTHROPIC_API_KEY"]
"#;

const PIPELINE_TEMPLATE: &str = r#"kind: WavePipeline
metadata:
  name: review
input:
  source: text
steps:
  - id: plan
    persona: navigator
    exec:
      source: |
        Survey this repository and break the following request into
        independent tasks. Respond with JSON: {"tasks": [{"task": "..."}]}

        Request: {{ input }}
    output_artifacts:
      - name: tasks
        source: stdout
        type: json
    handover:
      contract:
        type: json_schema
        schema_path: schemas/tasks.json
        on_failure: retry
        max_retries: 2

  - id: execute
    persona: craftsman
    depends_on: [plan]
    workspace:
      kind: worktree
    strategy:
      type: matrix
      items_source: plan/tasks
      item_key: tasks
      max_concurrency: 2
    exec:
      source: "Carry out this task: {{ task }}"
"#;

const NAVIGATOR_PROMPT: &str = r#"You explore repositories and plan work.
You never modify files. Prefer breadth over depth; report concisely.
"#;

const CRAFTSMAN_PROMPT: &str = r#"You implement well-scoped tasks in an existing codebase.
Match the surrounding style. Keep diffs minimal and verify your work.
"#;

const SUMMARIZER_PROMPT: &str = r#"You write checkpoint documents for interrupted sessions.
Be precise about current state and remaining work; another instance resumes
from your output alone.
"#;

const TASKS_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "type": "object",
  "required": ["tasks"],
  "properties": {
    "tasks": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["task"],
        "properties": {
          "task": { "type": "string" }
        }
      }
    }
  }
}
"#;

const GITIGNORE_TEMPLATE: &str = r#".wave/
"#;
