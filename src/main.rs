//! Wave CLI - pipeline orchestrator for LLM command-line adapters

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wave::error::{WaveError, EXIT_FAILURE, EXIT_INTERRUPTED};
use wave::events::EventEmitter;
use wave::executor::{PipelineExecutor, ResumeSpec, RunOptions};
use wave::manifest::Manifest;
use wave::pipeline::Pipeline;
use wave::router::{adhoc_pipeline, Router};
use wave::security::Redactor;
use wave::state::{RunStatus, StateStore};

#[derive(Parser)]
#[command(name = "wave")]
#[command(about = "Wave - pipeline orchestrator for LLM CLI adapters")]
#[command(version)]
struct Cli {
    /// Path to the manifest file
    #[arg(long, global = true, default_value = "wave.yaml")]
    manifest: PathBuf,

    /// Render human-readable progress on stderr alongside NDJSON
    #[arg(long, global = true)]
    human: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new Wave project
    Init {
        /// Project name, or "." for the current directory
        #[arg(default_value = ".")]
        name: String,
    },

    /// Validate a pipeline file against the manifest
    Validate {
        /// Pipeline name or path
        pipeline: String,
    },

    /// Run a pipeline ("auto" consults the manifest routing table)
    Run {
        pipeline: String,
        input: String,

        /// Labels as key=value, also used for routing
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
    },

    /// Run an ad-hoc navigator/execution pipeline from free text
    Do {
        input: String,

        /// Override the execution persona
        #[arg(long)]
        persona: Option<String>,

        /// Persist the generated pipeline to this path
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Resume a prior run from its last completed step
    Resume {
        #[arg(long)]
        pipeline_id: String,

        /// Assume everything upstream of this step completed
        #[arg(long)]
        from_step: Option<String>,
    },

    /// Show a run's status (latest run when omitted)
    Status { run_id: Option<String> },

    /// List resources
    List {
        #[command(subcommand)]
        what: ListWhat,
    },

    /// Print a run's persisted event log
    Logs {
        #[arg(long)]
        pipeline_id: String,
    },

    /// List a run's artifacts
    Artifacts {
        #[arg(long)]
        pipeline_id: String,
    },

    /// Remove workspaces and artifacts
    Clean {
        /// Specific run id; cleans everything when omitted
        run_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum ListWhat {
    /// List pipeline runs
    Runs {
        #[arg(long, default_value = "table")]
        output: String,
    },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label '{raw}' is not key=value"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let exit = match dispatch(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            e.exit_code()
        }
    };
    std::process::exit(exit);
}

async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<i32, WaveError> {
    match cli.command {
        Commands::Init { name } => {
            let result = wave::init_project(&name, Path::new("."))
                .map_err(|e| WaveError::other(e.to_string()))?;
            println!("{} initialized {}", "✓".green(), result.project_dir.bold());
            for file in &result.files_created {
                println!("  {file}");
            }
            Ok(0)
        }

        Commands::Validate { pipeline } => {
            let manifest = Manifest::load(&cli.manifest)?;
            let path = resolve_pipeline_path(&pipeline, &manifest);
            let pipeline = Pipeline::load(&path)?;
            wave::dag::validate(&pipeline, &manifest)?;
            println!(
                "{} pipeline '{}' is valid ({} steps)",
                "✓".green(),
                pipeline.metadata.name,
                pipeline.steps.len()
            );
            Ok(0)
        }

        Commands::Run {
            pipeline,
            input,
            labels,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let labels: BTreeMap<String, String> = labels.into_iter().collect();

            let name = if pipeline == "auto" {
                let routing = manifest.routing.clone().unwrap_or_default();
                let router = Router::new(routing.rules, routing.default);
                router
                    .select(&labels)
                    .ok_or_else(|| WaveError::other("no routing rule matched the labels"))?
                    .to_string()
            } else {
                pipeline
            };

            let path = resolve_pipeline_path(&name, &manifest);
            let pipeline = Pipeline::load(&path)?;
            run_pipeline(manifest, &pipeline, &input, labels, None, cli.human, cancel).await
        }

        Commands::Do {
            input,
            persona,
            save,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let pipeline = adhoc_pipeline(persona.as_deref());
            if let Some(path) = save {
                let yaml = serde_yaml::to_string(&pipeline)
                    .map_err(|e| WaveError::other(e.to_string()))?;
                std::fs::write(&path, yaml)?;
                println!("{} saved ad-hoc pipeline to {}", "✓".green(), path.display());
            }
            run_pipeline(
                manifest,
                &pipeline,
                &input,
                BTreeMap::new(),
                None,
                cli.human,
                cancel,
            )
            .await
        }

        Commands::Resume {
            pipeline_id,
            from_step,
        } => {
            let manifest = Arc::new(Manifest::load(&cli.manifest)?);
            let store = StateStore::open(&manifest.runtime.state_root)?;
            let run = store
                .get_run(&pipeline_id)?
                .ok_or_else(|| WaveError::other(format!("unknown run '{pipeline_id}'")))?;

            let path = resolve_pipeline_path(&run.pipeline_name, &manifest);
            let pipeline = Pipeline::load(&path)?;
            let resume = ResumeSpec {
                run_id: pipeline_id,
                from_step,
            };
            run_pipeline(
                manifest,
                &pipeline,
                &run.input,
                run.labels.clone(),
                Some(resume),
                cli.human,
                cancel,
            )
            .await
        }

        Commands::Status { run_id } => {
            let manifest = Manifest::load(&cli.manifest)?;
            let store = StateStore::open(&manifest.runtime.state_root)?;
            let run = match run_id {
                Some(id) => store.get_run(&id)?,
                None => store.list_runs()?.into_iter().next(),
            };
            let Some(run) = run else {
                println!("no runs recorded");
                return Ok(0);
            };
            println!(
                "{}  {}  {}  {} tokens",
                run.run_id.bold(),
                run.pipeline_name,
                status_colored(run.status),
                run.total_tokens
            );
            for step in store.steps_for_run(&run.run_id)? {
                println!(
                    "  {:<24} {:<10} retries={} tokens={}",
                    step.step_id,
                    step.state.as_str(),
                    step.retry_count,
                    step.tokens_used
                );
            }
            Ok(0)
        }

        Commands::List { what } => {
            let ListWhat::Runs { output } = what;
            let manifest = Manifest::load(&cli.manifest)?;
            let store = StateStore::open(&manifest.runtime.state_root)?;
            let runs = store.list_runs()?;
            if output == "json" {
                let rows: Vec<serde_json::Value> = runs
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "run_id": r.run_id,
                            "pipeline": r.pipeline_name,
                            "status": r.status.as_str(),
                            "total_tokens": r.total_tokens,
                            "started_at": r.started_at.to_rfc3339(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows).unwrap_or_default());
            } else {
                for r in runs {
                    println!(
                        "{}  {}  {}  {} tokens",
                        r.run_id.bold(),
                        r.pipeline_name,
                        status_colored(r.status),
                        r.total_tokens
                    );
                }
            }
            Ok(0)
        }

        Commands::Logs { pipeline_id } => {
            let manifest = Manifest::load(&cli.manifest)?;
            let store = StateStore::open(&manifest.runtime.state_root)?;
            for payload in store.events_for_run(&pipeline_id)? {
                println!("{payload}");
            }
            Ok(0)
        }

        Commands::Artifacts { pipeline_id } => {
            let manifest = Manifest::load(&cli.manifest)?;
            let root = manifest.runtime.workspace_root.join("artifacts").join(&pipeline_id);
            if !root.exists() {
                println!("no artifacts for run '{pipeline_id}'");
                return Ok(0);
            }
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                println!("{}  {} bytes", entry.path().display(), size);
            }
            Ok(0)
        }

        Commands::Clean { run_id } => {
            let manifest = Manifest::load(&cli.manifest)?;
            let ws_root = &manifest.runtime.workspace_root;
            match run_id {
                Some(run) => {
                    for dir in [ws_root.join(&run), ws_root.join("artifacts").join(&run)] {
                        if dir.exists() {
                            std::fs::remove_dir_all(&dir)?;
                            println!("{} removed {}", "✓".green(), dir.display());
                        }
                    }
                }
                None => {
                    if ws_root.exists() {
                        std::fs::remove_dir_all(ws_root)?;
                        println!("{} removed {}", "✓".green(), ws_root.display());
                    }
                }
            }
            Ok(0)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    manifest: Arc<Manifest>,
    pipeline: &Pipeline,
    input: &str,
    labels: BTreeMap<String, String>,
    resume: Option<ResumeSpec>,
    human: bool,
    cancel: CancellationToken,
) -> Result<i32, WaveError> {
    let store = Arc::new(StateStore::open(&manifest.runtime.state_root)?);
    let mut emitter = EventEmitter::new(Redactor::from_env());
    if human {
        emitter = emitter.with_human_renderer();
    }

    let executor = PipelineExecutor::new(manifest, store, emitter);
    let options = RunOptions {
        labels,
        resume,
        ..Default::default()
    };
    let outcome = executor.run(pipeline, input, options, cancel).await?;

    match outcome.status {
        RunStatus::Completed => Ok(0),
        RunStatus::Cancelled => Ok(EXIT_INTERRUPTED),
        _ => Ok(EXIT_FAILURE),
    }
}

/// A pipeline argument is a path when it points at a file, otherwise
/// `pipelines/<name>.wave.yaml` next to the manifest.
fn resolve_pipeline_path(name: &str, manifest: &Manifest) -> PathBuf {
    let direct = PathBuf::from(name);
    if direct.is_file() {
        return direct;
    }
    manifest
        .base_dir
        .join("pipelines")
        .join(format!("{name}.wave.yaml"))
}

fn status_colored(status: RunStatus) -> String {
    match status {
        RunStatus::Completed => status.as_str().green().to_string(),
        RunStatus::Failed => status.as_str().red().to_string(),
        RunStatus::Cancelled => status.as_str().yellow().to_string(),
        _ => status.as_str().cyan().to_string(),
    }
}
