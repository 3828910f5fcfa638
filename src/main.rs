use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clinflow_core::config::{AppConfig, ModelConfig};
use clinflow_core::state::{EncounterInput, WorkflowState};
use clinflow_core::types::{Decision, ProgressEvent, ResumeRequest, RunId};

use clinflow_agent::{ClinicalGraph, RunLogger, RunOutcome};

#[derive(Parser)]
#[command(name = "clinflow", version, about = "Clinical decision-support workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "clinflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow for an encounter read from a JSON file
    Run {
        /// Encounter JSON (encounter_id, patient_id, symptoms, vitals, ...)
        #[arg(long)]
        input: PathBuf,
    },
    /// Resume a run paused before the emergency protocol
    Resume {
        #[arg(long)]
        run_id: String,
        /// approve or reject
        #[arg(long)]
        decision: Decision,
        #[arg(long, default_value = "")]
        justification: String,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("clinflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { input } => {
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let encounter: EncounterInput =
                serde_json::from_str(&raw).context("parsing encounter JSON")?;
            let state = WorkflowState::new(encounter)?;

            let graph = Arc::new(ClinicalGraph::from_config(&config)?);
            let run_id = state.run_id().clone();
            let logger = attach_logger(&config, &graph, &run_id);
            let (rx, handle) = graph.spawn(state);
            print_progress(rx).await;
            let outcome = handle.await??;
            if let Some(logger) = logger {
                let _ = logger.await;
            }
            report(outcome)?;
        }
        Commands::Resume {
            run_id,
            decision,
            justification,
        } => {
            if decision == Decision::Reject && justification.trim().is_empty() {
                warn!("Rejecting the emergency protocol without a justification");
            }
            let graph = Arc::new(ClinicalGraph::from_config(&config)?);
            let run_id = RunId::from(run_id.as_str());
            let logger = attach_logger(&config, &graph, &run_id);
            let (rx, handle) = graph.spawn_resume(ResumeRequest {
                run_id,
                decision,
                justification,
            });
            print_progress(rx).await;
            let outcome = handle.await??;
            if let Some(logger) = logger {
                let _ = logger.await;
            }
            report(outcome)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    warn!(
        path = %path.display(),
        "No config file found, using a local Ollama model with defaults"
    );
    let model_id = std::env::var("CLINFLOW_MODEL").unwrap_or_else(|_| "medgemma".to_string());
    Ok(AppConfig::for_model(ModelConfig::ollama(model_id)))
}

/// Open the run's channel for the JSONL logger before the run emits anything.
fn attach_logger(
    config: &AppConfig,
    graph: &ClinicalGraph,
    run_id: &RunId,
) -> Option<JoinHandle<()>> {
    let log_dir = config.log_dir()?;
    let rx = graph.progress().open(run_id);
    Some(tokio::spawn(RunLogger::new(log_dir).run(rx, run_id.clone())))
}

async fn print_progress(mut rx: broadcast::Receiver<ProgressEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                ProgressEvent::RunStarted { run_id, .. } => eprintln!("[run] {}", run_id),
                ProgressEvent::StepStart { label, .. } => eprintln!("  -> {}", label),
                ProgressEvent::StepComplete { label, .. } => eprintln!("  ok {}", label),
                ProgressEvent::StepFallback { label, error, .. } => {
                    eprintln!("  !! {} ({})", label, error)
                }
                ProgressEvent::Reasoning {
                    next_step,
                    reasoning,
                    ..
                } => eprintln!("[route] {}: {}", next_step.name(), reasoning),
                ProgressEvent::Interrupted { .. } => eprintln!("[paused] awaiting confirmation"),
                ProgressEvent::RunResumed { decision, .. } => eprintln!("[resumed] {}", decision),
                ProgressEvent::RunComplete { steps, .. } => {
                    eprintln!("[done] {} capability calls", steps)
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Progress display lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report(outcome: RunOutcome) -> anyhow::Result<()> {
    if let RunOutcome::Interrupted(state) = &outcome {
        eprintln!(
            "Run {} needs confirmation. Continue with:\n  clinflow resume --run-id {} --decision approve|reject --justification \"...\"",
            state.run_id(),
            state.run_id()
        );
    }
    println!("{}", serde_json::to_string_pretty(outcome.state())?);
    Ok(())
}
