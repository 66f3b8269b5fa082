//! `stagehand` command line.
//!
//! Runs and resumes workflow sessions stored under `--sessions-dir`. Every
//! session is one state file (`<session>.json`) plus an artifacts directory
//! (`<session>.artifacts/`).

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use stagehand::core::extract::extract;
use stagehand::core::types::validate_id;
use stagehand::errors::{ConfigurationMismatch, StageFailed};
use stagehand::exit_codes;
use stagehand::io::artifacts::ArtifactStore;
use stagehand::io::config::{EngineConfig, load_config};
use stagehand::io::fs::OsFilesystem;
use stagehand::io::generator::CommandGenerator;
use stagehand::io::mutation::{CommandTarget, MutationTarget, UnconfiguredTarget};
use stagehand::io::state_store::{FileStateStore, StateStore};
use stagehand::io::write_gate::WriteGate;
use stagehand::logging;
use stagehand::pipeline::{PipelineStatus, StagePipeline, StepOutcome};
use stagehand::retry::RetryExecutor;
use stagehand::workflows::{self, WorkflowEnv};

/// Artifact holding the input document of a session, reused on resume.
const INPUT_ARTIFACT: &str = "input";

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Resumable multi-stage pipelines over a generative backend"
)]
struct Cli {
    /// Directory holding session state files and artifacts.
    #[arg(long, global = true, default_value = ".stagehand/sessions")]
    sessions_dir: PathBuf,

    /// Engine configuration (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "stagehand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start or resume a workflow session.
    Run {
        /// Workflow name (`drafting` or `triage`).
        workflow: String,
        #[arg(long)]
        session: String,
        /// JSON input document. Required for a new session; reused on resume.
        #[arg(long)]
        input: Option<PathBuf>,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Stop after this many stages even if the run is not done.
        #[arg(long)]
        max_steps: Option<u32>,
    },
    /// Show where a session stands and why it stopped.
    Status {
        #[arg(long)]
        session: String,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Extract a structured payload from a generator reply (file or stdin).
    Extract { file: Option<PathBuf> },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigurationMismatch>().is_some() {
        exit_codes::CONFIG_MISMATCH
    } else if err.downcast_ref::<StageFailed>().is_some() {
        exit_codes::STAGE_FAILED
    } else {
        exit_codes::ERROR
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            workflow,
            session,
            input,
            max_iterations,
            max_steps,
        } => {
            let config = load_config(&cli.config)?;
            cmd_run(
                &cli.sessions_dir,
                &config,
                &workflow,
                &session,
                input.as_deref(),
                max_iterations,
                max_steps,
            )
        }
        Command::Status { session, json } => {
            let config = load_config(&cli.config)?;
            cmd_status(&cli.sessions_dir, &config, &session, json)
        }
        Command::Extract { file } => cmd_extract(file.as_deref()),
    }
}

fn state_store(sessions_dir: &Path, config: &EngineConfig) -> FileStateStore {
    FileStateStore::with_filesystem(sessions_dir, OsFilesystem, config.state_retry.clone())
}

fn cmd_run(
    sessions_dir: &Path,
    config: &EngineConfig,
    workflow: &str,
    session: &str,
    input_path: Option<&Path>,
    max_iterations: Option<u32>,
    max_steps: Option<u32>,
) -> Result<i32> {
    validate_id("session id", session)?;
    let store = state_store(sessions_dir, config);
    let started = store.load(session)?.is_some();
    let artifacts = ArtifactStore::for_session(sessions_dir, session);
    let input = resolve_input(&artifacts, input_path, started)?;

    let target: Box<dyn MutationTarget + Send + Sync> =
        match CommandTarget::from_config(&config.mutation) {
            Some(target) => Box::new(target),
            None => Box::new(UnconfiguredTarget),
        };
    let env = Arc::new(WorkflowEnv {
        generator: Box::new(CommandGenerator::from_config(&config.generator)),
        retry: RetryExecutor::new(config.retry.clone()),
        timeout: Duration::from_secs(config.generator.timeout_secs),
        target,
    });
    let max_iterations = max_iterations.unwrap_or(config.max_iterations);
    let definition = workflows::build(workflow, input, env, max_iterations)?;

    let mut pipeline = StagePipeline::open(
        definition,
        session,
        store,
        artifacts,
        WriteGate::from_config(&config.write_gate),
    )?
    .with_mutation_retry(config.retry.clone());

    let print_step = |step: &StepOutcome| {
        eprintln!("completed {} -> {}", step.stage, step.next);
    };
    match max_steps {
        None => {
            let outcome = pipeline.run_with(print_step)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Some(limit) => {
            for _ in 0..limit {
                match pipeline.step()? {
                    Some(step) => print_step(&step),
                    None => break,
                }
            }
            print!("{}", pipeline.status().render());
        }
    }
    Ok(exit_codes::OK)
}

/// Input for the session: the `--input` file, or the copy saved by an earlier run.
///
/// Once a session has checkpointed, its completed stages were computed from the
/// saved input, so a different `--input` is refused rather than mixed in.
fn resolve_input(
    artifacts: &ArtifactStore,
    input_path: Option<&Path>,
    started: bool,
) -> Result<Value> {
    if let Some(path) = input_path {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read input {}", path.display()))?;
        let input: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse input {} as JSON", path.display()))?;
        if started {
            match artifacts.read(INPUT_ARTIFACT)? {
                Some(saved) if saved == input => return Ok(input),
                Some(_) => bail!(
                    "session already started with a different input; omit --input to resume it \
                     or use a new --session"
                ),
                None => {}
            }
        }
        artifacts.write(INPUT_ARTIFACT, &input)?;
        return Ok(input);
    }
    artifacts
        .read(INPUT_ARTIFACT)?
        .ok_or_else(|| anyhow!("no --input given and no saved input for this session"))
}

fn cmd_status(sessions_dir: &Path, config: &EngineConfig, session: &str, json: bool) -> Result<i32> {
    validate_id("session id", session)?;
    let state = state_store(sessions_dir, config)
        .load(session)?
        .ok_or_else(|| anyhow!("no session '{session}' under {}", sessions_dir.display()))?;
    let status = PipelineStatus::from_state(&state);
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status.render());
    }
    Ok(exit_codes::OK)
}

fn cmd_extract(file: Option<&Path>) -> Result<i32> {
    let text = match file {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    let result = extract(&text);
    match &result.payload {
        Some(payload) => {
            println!("{}", serde_json::to_string_pretty(payload)?);
            eprintln!("method: {}", serde_json::to_value(&result.method)?);
            Ok(exit_codes::OK)
        }
        None => {
            eprintln!(
                "no structured payload found: {}",
                result.preview.as_deref().unwrap_or_default()
            );
            Ok(exit_codes::ERROR)
        }
    }
}
