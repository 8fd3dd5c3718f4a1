//! End-to-end pipeline execution tests
//!
//! Exercises the executor over mock and shell adapters: dependency ordering,
//! contract retry, stdout artifact capture and atomicity, matrix fan-out and
//! conflict detection, resume after failure.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wave::events::{Event, EventEmitter, EventKind};
use wave::executor::{PipelineExecutor, ResumeSpec, RunOptions};
use wave::manifest::Manifest;
use wave::pipeline::Pipeline;
use wave::retry::BackoffConfig;
use wave::security::Redactor;
use wave::state::{RunStatus, StateStore, StepState};

struct Harness {
    dir: TempDir,
    manifest: Arc<Manifest>,
    store: Arc<StateStore>,
    emitter: EventEmitter,
}

impl Harness {
    /// Build a manifest in a tempdir. `adapters` is extra YAML under
    /// `adapters:` (a `mock` echo adapter is always present); `personas` is
    /// extra YAML under `personas:` (an `echo` persona is always present).
    fn new(adapters: &str, personas: &str) -> Self {
        Self::with_runtime(adapters, personas, "")
    }

    /// `runtime_extra` is appended to the `runtime:` block.
    fn with_runtime(adapters: &str, personas: &str, runtime_extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("personas")).unwrap();
        std::fs::write(dir.path().join("personas/p.md"), "").unwrap();

        let yaml = format!(
            r#"
apiVersion: wave/v1
kind: WaveManifest
metadata:
  name: harness
  labels:
    language: rust
adapters:
  mock:
    binary: "true"
    mode: mock
{adapters}
personas:
  echo:
    adapter: mock
    system_prompt_file: personas/p.md
{personas}
runtime:
  workspace_root: {ws}
  state_root: {state}
  max_concurrent_workers: 4
  default_timeout_minutes: 1
  default_max_retries: 2
{runtime_extra}
"#,
            ws = dir.path().join("ws").display(),
            state = dir.path().join("state").display(),
        );
        let manifest = Arc::new(Manifest::parse(&yaml, dir.path()).unwrap());
        let store = Arc::new(StateStore::open(&manifest.runtime.state_root).unwrap());
        let emitter = EventEmitter::buffered(Redactor::default());
        Self {
            dir,
            manifest,
            store,
            emitter,
        }
    }

    fn executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(
            Arc::clone(&self.manifest),
            Arc::clone(&self.store),
            self.emitter.clone(),
        )
        .with_backoff(BackoffConfig {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        })
    }

    async fn run(&self, pipeline: &Pipeline, input: &str) -> wave::executor::RunOutcome {
        self.executor()
            .run(pipeline, input, RunOptions::default(), CancellationToken::new())
            .await
            .unwrap()
    }

    fn events(&self) -> Vec<Event> {
        self.emitter.events()
    }

    fn seq_of(&self, pred: impl Fn(&Event) -> bool) -> u64 {
        self.events()
            .iter()
            .find(|e| pred(e))
            .map(|e| e.seq)
            .expect("expected event not emitted")
    }

    fn artifact_path(&self, run_id: &str, step: &str, name: &str) -> std::path::PathBuf {
        self.manifest
            .runtime
            .workspace_root
            .join("artifacts")
            .join(run_id)
            .join(step)
            .join(name)
    }
}

fn started(step: &str) -> impl Fn(&Event) -> bool + '_ {
    move |e| {
        e.step_id.as_deref() == Some(step) && matches!(e.kind, EventKind::StepStarted { .. })
    }
}

fn completed(step: &str) -> impl Fn(&Event) -> bool + '_ {
    move |e| {
        e.step_id.as_deref() == Some(step) && matches!(e.kind, EventKind::StepCompleted { .. })
    }
}

// ============================================================================
// DEPENDENCY ORDERING
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn diamond_respects_dependency_ordering() {
    let h = Harness::new("", "");
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: diamond
steps:
  - id: a
    persona: echo
    exec: { source: "step a on {{ input }}" }
  - id: b
    persona: echo
    depends_on: [a]
    exec: { source: "step b" }
  - id: c
    persona: echo
    depends_on: [a]
    exec: { source: "step c" }
  - id: d
    persona: echo
    depends_on: [b, c]
    exec: { source: "step d" }
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "hello").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let a_done = h.seq_of(completed("a"));
    assert!(a_done < h.seq_of(started("b")));
    assert!(a_done < h.seq_of(started("c")));
    let d_start = h.seq_of(started("d"));
    assert!(h.seq_of(completed("b")) < d_start);
    assert!(h.seq_of(completed("c")) < d_start);

    // pipeline_completed is the final event.
    let events = h.events();
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::PipelineCompleted { .. }
    ));

    // total_tokens is the authoritative sum over step rows.
    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let sum: u64 = steps.iter().map(|s| s.tokens_used).sum();
    assert!(sum > 0);
    assert_eq!(outcome.total_tokens, sum);
    let run = h.store.get_run(&outcome.run_id).unwrap().unwrap();
    assert_eq!(run.total_tokens, sum);
}

// ============================================================================
// CONTRACT RETRY
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn contract_retry_succeeds_on_second_attempt() {
    let h = Harness::new(
        r#"  scripted:
    binary: "true"
    mode: mock
    args:
      - '{"count": "three"}'
      - '{"count": 3}'
"#,
        r#"  counter:
    adapter: scripted
    system_prompt_file: personas/p.md
"#,
    );
    std::fs::write(
        h.dir.path().join("count.json"),
        r#"{"$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object", "required": ["count"],
            "properties": {"count": {"type": "integer"}}}"#,
    )
    .unwrap();

    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: retry
steps:
  - id: count
    persona: counter
    exec: { source: "count things" }
    output_artifacts:
      - name: result
        source: stdout
        type: json
    handover:
      contract:
        type: json_schema
        schema_path: count.json
        on_failure: retry
        max_retries: 3
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let events = h.events();
    let failures = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::ContractFailed { .. }))
        .count();
    let retries = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::StepRetry { .. }))
        .count();
    assert_eq!(failures, 1, "exactly one contract failure");
    assert_eq!(retries, 1, "exactly one retry");
    let fail_seq = h.seq_of(|e| matches!(e.kind, EventKind::ContractFailed { .. }));
    let retry_seq = h.seq_of(|e| matches!(e.kind, EventKind::StepRetry { .. }));
    let pass_seq = h.seq_of(|e| matches!(e.kind, EventKind::ContractPassed));
    assert!(fail_seq < retry_seq && retry_seq < pass_seq);

    // The final artifact is the valid JSON, not an error envelope.
    let content =
        std::fs::read_to_string(h.artifact_path(&outcome.run_id, "count", "result")).unwrap();
    assert_eq!(content, r#"{"count": 3}"#);
    assert!(!h.artifact_path(&outcome.run_id, "count", "result.error.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_leave_error_report_not_artifact() {
    let h = Harness::new(
        r#"  stubborn:
    binary: "true"
    mode: mock
    args:
      - 'still not json'
"#,
        r#"  counter:
    adapter: stubborn
    system_prompt_file: personas/p.md
"#,
    );
    std::fs::write(
        h.dir.path().join("count.json"),
        r#"{"type": "object", "required": ["count"]}"#,
    )
    .unwrap();

    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: fail
steps:
  - id: count
    persona: counter
    exec: { source: "count" }
    output_artifacts:
      - name: result
        source: stdout
        type: json
    handover:
      contract:
        type: json_schema
        schema_path: count.json
        on_failure: retry
        max_retries: 1
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Failed);

    // Atomicity: the declared artifact never hit disk.
    assert!(!h.artifact_path(&outcome.run_id, "count", "result").exists());

    // The error report preserves the raw output for the operator.
    let report =
        std::fs::read_to_string(h.artifact_path(&outcome.run_id, "count", "result.error.json"))
            .unwrap();
    let report: serde_json::Value = serde_json::from_str(&report).unwrap();
    assert_eq!(report["raw_output"], "still not json");

    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    assert_eq!(steps[0].state, StepState::Failed);
    assert_eq!(steps[0].retry_count, 1);
}

// ============================================================================
// STDOUT ARTIFACT HANDOVER
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn stdout_artifact_flows_to_downstream_byte_identical() {
    let h = Harness::new("", "");
    std::fs::write(
        h.dir.path().join("ok.json"),
        r#"{"type": "object", "required": ["ok"]}"#,
    )
    .unwrap();

    // The echo persona returns its prompt verbatim, so the producer's prompt
    // IS the artifact content.
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: handover
steps:
  - id: produce
    persona: echo
    exec: { source: '{"ok":true}' }
    output_artifacts:
      - name: report
        source: stdout
        type: json
  - id: consume
    persona: echo
    depends_on: [produce]
    inject_artifacts:
      - from_step: produce
        name: report
        type: json
        schema_path: ok.json
    exec: { source: "got: {{ artifacts.report }}" }
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let bytes = std::fs::read(h.artifact_path(&outcome.run_id, "produce", "report")).unwrap();
    assert_eq!(bytes, b"{\"ok\":true}");
    assert!(h.seq_of(completed("produce")) < h.seq_of(started("consume")));
}

#[tokio::test(flavor = "multi_thread")]
async fn type_mismatch_fails_before_adapter_runs() {
    let h = Harness::new("", "");
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: mismatch
steps:
  - id: produce
    persona: echo
    exec: { source: "text output" }
    output_artifacts:
      - name: report
        source: stdout
        type: text
  - id: consume
    persona: echo
    depends_on: [produce]
    inject_artifacts:
      - from_step: produce
        name: report
        type: json
    exec: { source: "{{ artifacts.report }}" }
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Failed);
    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let consume = steps.iter().find(|s| s.step_id == "consume").unwrap();
    assert_eq!(consume.state, StepState::Failed);
    assert!(consume
        .error_message
        .as_deref()
        .unwrap()
        .contains("'json' was declared"));
    // The consumer's adapter never started.
    assert!(!h.events().iter().any(|e| {
        e.step_id.as_deref() == Some("consume")
            && matches!(e.kind, EventKind::StepProgress { .. })
    }));
}

// ============================================================================
// MATRIX
// ============================================================================

fn matrix_pipeline(extra_step_yaml: &str) -> Pipeline {
    Pipeline::parse(&format!(
        r#"
kind: WavePipeline
metadata:
  name: fanout
steps:
  - id: plan
    persona: echo
    exec: {{ source: '{{"tasks":[{{"task":"A"}},{{"task":"B"}}]}}' }}
    output_artifacts:
      - name: tasks
        source: stdout
        type: json
  - id: work
    persona: echo
    depends_on: [plan]
    strategy:
      type: matrix
      items_source: plan/tasks
      item_key: tasks
      max_concurrency: 2
    exec: {{ source: "do {{{{ task }}}}" }}
{extra_step_yaml}"#,
    ))
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn matrix_spawns_one_worker_per_item() {
    let h = Harness::new("", "");
    let outcome = h.run(&matrix_pipeline(""), "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    // Both workers reported progress under their own worker ids.
    let worker_ids: std::collections::HashSet<usize> = h
        .events()
        .iter()
        .filter(|e| e.step_id.as_deref() == Some("work"))
        .filter_map(|e| e.worker_id)
        .collect();
    assert_eq!(worker_ids, [0, 1].into());

    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let work = steps.iter().find(|s| s.step_id == "work").unwrap();
    assert_eq!(work.state, StepState::Completed);
    assert!(work.tokens_used > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn matrix_with_zero_items_completes_without_workers() {
    let h = Harness::new("", "");
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: empty
steps:
  - id: plan
    persona: echo
    exec: { source: '{"tasks":[]}' }
    output_artifacts:
      - name: tasks
        source: stdout
        type: json
  - id: work
    persona: echo
    depends_on: [plan]
    strategy:
      type: matrix
      items_source: plan/tasks
      item_key: tasks
    exec: { source: "do {{ task }}" }
  - id: after
    persona: echo
    depends_on: [work]
    exec: { source: "after" }
"#,
    )
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let work = steps.iter().find(|s| s.step_id == "work").unwrap();
    assert_eq!(work.state, StepState::Completed);
    assert_eq!(work.tokens_used, 0);
    // No worker ever started.
    assert!(!h
        .events()
        .iter()
        .any(|e| e.step_id.as_deref() == Some("work") && e.worker_id.is_some()));
    // The dependent still ran.
    let after = steps.iter().find(|s| s.step_id == "after").unwrap();
    assert_eq!(after.state, StepState::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn matrix_workers_writing_same_path_abort_at_join() {
    let h = Harness::new(
        r#"  clobber:
    binary: sh
    mode: oneshot
    args: ["-c", "sleep 0.$$; echo $$ > source/shared.txt"]
"#,
        r#"  writer:
    adapter: clobber
    system_prompt_file: personas/p.md
"#,
    );
    let shared = h.dir.path().join("shared-src");
    std::fs::create_dir_all(&shared).unwrap();

    let pipeline = Pipeline::parse(&format!(
        r#"
kind: WavePipeline
metadata:
  name: clash
steps:
  - id: plan
    persona: echo
    exec: {{ source: '{{"tasks":[{{"task":"A"}},{{"task":"B"}}]}}' }}
    output_artifacts:
      - name: tasks
        source: stdout
        type: json
  - id: work
    persona: writer
    depends_on: [plan]
    workspace:
      kind: mount
      source: {shared}
      access: read_write
    strategy:
      type: matrix
      items_source: plan/tasks
      item_key: tasks
      max_concurrency: 2
    exec: {{ source: "write {{{{ task }}}}" }}
"#,
        shared = shared.display(),
    ))
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Failed);

    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let work = steps.iter().find(|s| s.step_id == "work").unwrap();
    assert_eq!(work.state, StepState::Failed);
    let message = work.error_message.as_deref().unwrap();
    assert!(message.contains("shared.txt"), "conflict names the path: {message}");
    assert!(message.contains("[0, 1]"), "conflict names both workers: {message}");
}

// ============================================================================
// RESUME
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn resume_reruns_failed_step_and_continues() {
    let h = Harness::new(
        r#"  flaky:
    binary: sh
    mode: oneshot
    args: ["-c", "test -f source/MARKER && echo recovered || exit 1"]
"#,
        r#"  fragile:
    adapter: flaky
    system_prompt_file: personas/p.md
"#,
    );
    let marker = h.dir.path().join("MARKER");

    let pipeline = Pipeline::parse(&format!(
        r#"
kind: WavePipeline
metadata:
  name: trilogy
steps:
  - id: one
    persona: echo
    exec: {{ source: "first" }}
  - id: two
    persona: fragile
    depends_on: [one]
    max_retries: 0
    workspace:
      kind: mount
      source: {dir}
      access: read_write
    exec: {{ source: "second" }}
  - id: three
    persona: echo
    depends_on: [two]
    exec: {{ source: "third" }}
"#,
        dir = h.dir.path().display(),
    ))
    .unwrap();

    // First run: step two crashes, three never starts.
    let first = h.run(&pipeline, "go").await;
    assert_eq!(first.status, RunStatus::Failed);
    let steps = h.store.steps_for_run(&first.run_id).unwrap();
    let by_id = |id: &str| steps.iter().find(|s| s.step_id == id).unwrap().clone();
    assert_eq!(by_id("one").state, StepState::Completed);
    assert_eq!(by_id("two").state, StepState::Failed);
    assert_eq!(by_id("three").state, StepState::Pending);
    let one_tokens = by_id("one").tokens_used;

    // Fix the world, then resume the same run id.
    std::fs::write(&marker, "").unwrap();
    let options = RunOptions {
        resume: Some(ResumeSpec {
            run_id: first.run_id.clone(),
            from_step: None,
        }),
        ..Default::default()
    };
    let second = h
        .executor()
        .run(&pipeline, "go", options, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.run_id, first.run_id);
    assert_eq!(second.status, RunStatus::Completed);
    let steps = h.store.steps_for_run(&second.run_id).unwrap();
    for id in ["one", "two", "three"] {
        assert_eq!(
            steps.iter().find(|s| s.step_id == id).unwrap().state,
            StepState::Completed,
            "step {id} should be complete after resume"
        );
    }
    // Step one was not re-run: its tokens are unchanged.
    assert_eq!(
        steps.iter().find(|s| s.step_id == "one").unwrap().tokens_used,
        one_tokens
    );
    // Run total is the sum over all persisted steps.
    let sum: u64 = steps.iter().map(|s| s.tokens_used).sum();
    assert_eq!(second.total_tokens, sum);

    // Step one never emitted a second step_started.
    let one_starts = h
        .events()
        .iter()
        .filter(|e| {
            e.step_id.as_deref() == Some("one")
                && matches!(e.kind, EventKind::StepStarted { .. })
        })
        .count();
    assert_eq!(one_starts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_of_completed_run_is_a_noop() {
    let h = Harness::new("", "");
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: simple
steps:
  - id: only
    persona: echo
    exec: { source: "hi" }
"#,
    )
    .unwrap();

    let first = h.run(&pipeline, "x").await;
    assert_eq!(first.status, RunStatus::Completed);
    let events_before = h.events().len();

    let options = RunOptions {
        resume: Some(ResumeSpec {
            run_id: first.run_id.clone(),
            from_step: None,
        }),
        ..Default::default()
    };
    let second = h
        .executor()
        .run(&pipeline, "x", options, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.total_tokens, first.total_tokens);

    // No step re-ran: only pipeline-level events were added.
    let new_events: Vec<Event> = h.events().into_iter().skip(events_before).collect();
    assert!(new_events
        .iter()
        .all(|e| !matches!(e.kind, EventKind::StepStarted { .. })));
}

// ============================================================================
// CONCURRENT RUNS / WORKTREES
// ============================================================================

fn init_git_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let out = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    };
    assert!(std::process::Command::new("git")
        .args(["init", dir.to_str().unwrap()])
        .output()
        .unwrap()
        .status
        .success());
    run(&["config", "user.email", "t@example.com"]);
    run(&["config", "user.name", "T"]);
    run(&["commit", "--allow-empty", "-m", "init"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_runs_on_same_repo_both_succeed() {
    let h = Harness::new("", "");
    let repo = h.dir.path().join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    init_git_repo(&repo);

    let pipeline = Pipeline::parse(&format!(
        r#"
kind: WavePipeline
metadata:
  name: wt
steps:
  - id: touch
    persona: echo
    workspace:
      kind: worktree
      repo: {repo}
    exec: {{ source: "work in the tree" }}
"#,
        repo = repo.display(),
    ))
    .unwrap();

    let exec_a = h.executor();
    let exec_b = h.executor();
    let (a, b) = tokio::join!(
        exec_a.run(&pipeline, "one", RunOptions::default(), CancellationToken::new()),
        exec_b.run(&pipeline, "two", RunOptions::default(), CancellationToken::new()),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.status, RunStatus::Completed);
    assert_eq!(b.status, RunStatus::Completed);
    assert_ne!(a.run_id, b.run_id, "workspace prefixes are distinct");

    // Each run branched under its own id; worktrees are cleaned up.
    let branches = std::process::Command::new("git")
        .args(["-C", repo.to_str().unwrap(), "branch", "--list"])
        .output()
        .unwrap();
    let branches = String::from_utf8_lossy(&branches.stdout).into_owned();
    assert!(branches.contains(&a.run_id));
    assert!(branches.contains(&b.run_id));
    assert!(!h.manifest.runtime.workspace_root.join(&a.run_id).join("worktree").exists());
}

// ============================================================================
// META PIPELINES
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn meta_pipeline_executes_under_caps() {
    let h = Harness::new(
        "",
        r#"  scout:
    adapter: mock
    system_prompt_file: personas/p.md
    permissions:
      allowed_tools: ["Read", "Grep"]
"#,
    );
    let generated = r#"
kind: WavePipeline
metadata:
  name: generated
steps:
  - id: survey
    persona: scout
    exec: { source: "survey {{ input }}" }
    handover:
      contract:
        type: format
        pattern: ".+"
  - id: act
    persona: echo
    depends_on: [survey]
    exec: { source: "act" }
    handover:
      contract:
        type: format
        pattern: ".+"
"#;

    let outcome = h
        .executor()
        .run_meta(generated, "tidy the docs", 1, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn meta_pipeline_with_writer_first_step_is_refused() {
    let h = Harness::new("", "");
    // The echo persona has no read-only allow list, so it cannot lead.
    let generated = r#"
kind: WavePipeline
metadata:
  name: generated
steps:
  - id: first
    persona: echo
    exec: { source: "go" }
    handover:
      contract:
        type: format
        pattern: ".+"
"#;

    let err = h
        .executor()
        .run_meta(generated, "x", 1, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2, "constraint violations refuse execution");
    // Nothing ran: no events beyond none at all.
    assert!(h.events().is_empty());
}

// ============================================================================
// RELAY
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn relay_compacts_and_restarts_the_step() {
    // First attempt burns past the context threshold then stalls; the
    // restarted attempt (RELAYED marker present) finishes cheaply.
    let h = Harness::with_runtime(
        r#"  marathoner:
    binary: sh
    mode: stream_json
    args:
      - "-c"
      - |
        if [ -f source/RELAYED ]; then
          printf '%s\n' '{"type":"result","usage":{"input_tokens":10,"output_tokens":5}}'
        else
          touch source/RELAYED
          printf '%s\n' '{"type":"assistant","message":{"usage":{"input_tokens":900,"output_tokens":100}}}'
          sleep 30
        fi
"#,
        r#"  longhaul:
    adapter: marathoner
    system_prompt_file: personas/p.md
    context_budget: 1000
  summarizer:
    adapter: mock
    system_prompt_file: personas/p.md
"#,
        r#"  relay:
    token_threshold_percent: 80
    summarizer_persona: summarizer
    summarizer_token_cap: 50000
"#,
    );

    let pipeline = Pipeline::parse(&format!(
        r#"
kind: WavePipeline
metadata:
  name: longrun
steps:
  - id: grind
    persona: longhaul
    workspace:
      kind: mount
      source: {dir}
      access: read_write
    exec: {{ source: "grind through the backlog" }}
"#,
        dir = h.dir.path().display(),
    ))
    .unwrap();

    let outcome = h.run(&pipeline, "x").await;
    assert_eq!(outcome.status, RunStatus::Completed);

    let triggered = h.seq_of(|e| matches!(e.kind, EventKind::CompactionTriggered { .. }));
    let completed_seq = h.seq_of(|e| matches!(e.kind, EventKind::CompactionCompleted));
    let resumed = h.seq_of(|e| matches!(e.kind, EventKind::ResumedFromRelay { relay_count: 1 }));
    let done = h.seq_of(completed("grind"));
    assert!(triggered < completed_seq);
    assert!(completed_seq < resumed);
    assert!(resumed < done);

    // The interrupted attempt's usage and the summarizer's usage both count.
    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    assert!(steps[0].tokens_used > 1000, "paused tokens accumulated");
}

// ============================================================================
// RUN LIMITS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn token_budget_halts_the_pipeline() {
    let h = Harness::new("", "");
    let pipeline = Pipeline::parse(
        r#"
kind: WavePipeline
metadata:
  name: budget
steps:
  - id: a
    persona: echo
    exec: { source: "a long enough prompt to cost a few tokens" }
  - id: b
    persona: echo
    depends_on: [a]
    exec: { source: "never reached" }
"#,
    )
    .unwrap();

    let options = RunOptions {
        limits: wave::executor::RunLimits {
            max_total_tokens: Some(1),
            deadline: None,
        },
        ..Default::default()
    };
    let outcome = h
        .executor()
        .run(&pipeline, "x", options, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);

    let steps = h.store.steps_for_run(&outcome.run_id).unwrap();
    let b = steps.iter().find(|s| s.step_id == "b").unwrap();
    assert_eq!(b.state, StepState::Pending, "dependent never launched");
}
