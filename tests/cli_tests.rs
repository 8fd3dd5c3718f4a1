//! Integration tests for the Wave CLI
//!
//! These tests run the actual binary against throwaway projects.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn wave_cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("wave").unwrap();
    cmd.current_dir(dir);
    cmd
}

/// Minimal project with a mock persona and one echo pipeline.
fn scaffold_mock_project(dir: &Path) {
    fs::create_dir_all(dir.join("personas")).unwrap();
    fs::create_dir_all(dir.join("pipelines")).unwrap();
    fs::write(dir.join("personas/p.md"), "you echo").unwrap();
    fs::write(
        dir.join("wave.yaml"),
        r#"
apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: cli-test
adapters:
  mock:
    binary: "true"
    mode: mock
personas:
  echo:
    adapter: mock
    system_prompt_file: personas/p.md
runtime:
  workspace_root: .wave/workspace
  state_root: .wave/state
  default_timeout_minutes: 1
"#,
    )
    .unwrap();
    fs::write(
        dir.join("pipelines/hello.wave.yaml"),
        r#"
kind: WavePipeline
metadata:
  name: hello
steps:
  - id: greet
    persona: echo
    exec: { source: "greetings: {{ input }}" }
    output_artifacts:
      - name: greeting
        source: stdout
        type: text
"#,
    )
    .unwrap();
}

#[test]
fn help_shows_about() {
    let dir = TempDir::new().unwrap();
    wave_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "pipeline orchestrator for LLM CLI adapters",
        ));
}

#[test]
fn init_scaffolds_a_valid_project() {
    let dir = TempDir::new().unwrap();
    wave_cmd(dir.path())
        .args(["init", "."])
        .assert()
        .success()
        .stdout(predicate::str::contains("wave.yaml"));

    assert!(dir.path().join("wave.yaml").exists());
    assert!(dir.path().join("pipelines/review.wave.yaml").exists());
    assert!(dir.path().join("personas/navigator.md").exists());

    // The scaffold validates against itself.
    wave_cmd(dir.path())
        .args(["validate", "review"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn init_refuses_existing_project() {
    let dir = TempDir::new().unwrap();
    wave_cmd(dir.path()).args(["init", "."]).assert().success();
    wave_cmd(dir.path()).args(["init", "."]).assert().failure();
}

#[test]
fn validate_unknown_pipeline_exits_2() {
    let dir = TempDir::new().unwrap();
    scaffold_mock_project(dir.path());
    wave_cmd(dir.path())
        .args(["validate", "missing"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn validate_cyclic_pipeline_exits_2() {
    let dir = TempDir::new().unwrap();
    scaffold_mock_project(dir.path());
    fs::write(
        dir.path().join("pipelines/cyclic.wave.yaml"),
        r#"
kind: WavePipeline
metadata:
  name: cyclic
steps:
  - id: a
    persona: echo
    depends_on: [b]
    exec: { source: "a" }
  - id: b
    persona: echo
    depends_on: [a]
    exec: { source: "b" }
"#,
    )
    .unwrap();

    wave_cmd(dir.path())
        .args(["validate", "cyclic"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn run_emits_ndjson_and_persists_state() {
    let dir = TempDir::new().unwrap();
    scaffold_mock_project(dir.path());

    let output = wave_cmd(dir.path())
        .args(["run", "hello", "world"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();

    // Every line is one JSON event; the stream ends with pipeline_completed.
    let events: Vec<serde_json::Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).expect("each line is JSON"))
        .collect();
    assert_eq!(events.first().unwrap()["state"], "pipeline_started");
    assert_eq!(events.last().unwrap()["state"], "pipeline_completed");
    let run_id = events[0]["run_id"].as_str().unwrap().to_string();
    assert!(run_id.starts_with("hello-"));

    // The run shows up in list/status/logs/artifacts.
    wave_cmd(dir.path())
        .args(["list", "runs", "--output", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&run_id))
        .stdout(predicate::str::contains("\"completed\""));

    wave_cmd(dir.path())
        .args(["status", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("greet"));

    wave_cmd(dir.path())
        .args(["logs", "--pipeline-id", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("step_completed"));

    wave_cmd(dir.path())
        .args(["artifacts", "--pipeline-id", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("greeting"));

    // The stdout artifact holds the rendered prompt (echo adapter).
    let artifact = dir
        .path()
        .join(".wave/workspace/artifacts")
        .join(&run_id)
        .join("greet/greeting");
    let content = fs::read_to_string(artifact).unwrap();
    assert_eq!(content, "greetings: world");

    // Clean removes workspaces and artifacts for the run.
    wave_cmd(dir.path())
        .args(["clean", &run_id])
        .assert()
        .success();
    assert!(!dir
        .path()
        .join(".wave/workspace/artifacts")
        .join(&run_id)
        .exists());
}

#[test]
fn run_missing_manifest_exits_2() {
    let dir = TempDir::new().unwrap();
    wave_cmd(dir.path())
        .args(["run", "hello", "world"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn status_without_runs_reports_nothing() {
    let dir = TempDir::new().unwrap();
    scaffold_mock_project(dir.path());
    wave_cmd(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no runs recorded"));
}
