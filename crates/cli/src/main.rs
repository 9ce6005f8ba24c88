use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docket_core::lifecycle::TransitionLog;
use docket_core::workflow::{read_workflow, workflow_files, StepGraph, WorkflowRegistry};
use docket_core::{Job, JobId, JobStatus, NewJob, Payload};
use std::path::{Path, PathBuf};

mod config;
mod work;

use config::{AppState, DocketConfig};

#[derive(Parser, Debug)]
#[command(name = "docket")]
#[command(about = "Docket execution core - job queue and workflow administration", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "docket.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data", env = "DOCKET_DATA_DIR")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue a job
    Enqueue {
        /// Job type, e.g. file_extraction
        #[arg(long = "type")]
        job_type: String,

        /// File the job operates on
        #[arg(long)]
        file_id: Option<uuid::Uuid>,

        /// Job config as a JSON object
        #[arg(long)]
        config_json: Option<String>,

        #[arg(long)]
        max_attempts: Option<u32>,
    },
    /// Show one job
    Show { job_id: JobId },
    /// List jobs, oldest first
    List {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// Cancel a queued or processing job
    Cancel { job_id: JobId },
    /// Resubmit a failed job as a new job
    Retry { job_id: JobId },
    /// Count jobs per status
    Stats,
    /// Show the recorded status transitions of a job
    History { job_id: JobId },
    /// Delete finished jobs older than the retention period
    Cleanup {
        /// Overrides the configured retention
        #[arg(long)]
        days: Option<u32>,
    },
    /// Validate workflow definitions (defaults to the configured directory)
    Validate { path: Option<PathBuf> },
    /// Process queued workflow jobs until interrupted
    Work {
        /// Number of polling workers
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docket=info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::debug!("Data directory: {}", args.data_dir.display());

    // Load configuration
    let config = DocketConfig::load(&args.config, args.data_dir)?;

    match args.command {
        Command::Validate { path } => {
            let path = path.unwrap_or_else(|| config.workflows_path());
            validate(&path)
        }
        command => run(command, &config).await,
    }
}

async fn run(command: Command, config: &DocketConfig) -> Result<()> {
    let state = AppState::new(config)?;
    let queue = &state.queue;

    match command {
        Command::Enqueue {
            job_type,
            file_id,
            config_json,
            max_attempts,
        } => {
            let mut new_job = NewJob::new(job_type);
            new_job.file_id = file_id;
            new_job.max_attempts = max_attempts;
            if let Some(raw) = config_json {
                let job_config: Payload =
                    serde_json::from_str(&raw).context("Job config must be a JSON object")?;
                new_job = new_job.config(job_config);
            }

            let job_id = queue.create_job(new_job).await?;
            println!("{}", job_id);
        }
        Command::Show { job_id } => {
            let job = queue
                .get_job(&job_id)
                .await?
                .with_context(|| format!("Job {} not found", job_id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Command::List { status } => {
            for job in queue.list_jobs(status).await? {
                println!("{}", summary(&job));
            }
        }
        Command::Cancel { job_id } => {
            if queue.cancel_job(&job_id).await? {
                println!("cancelled {}", job_id);
            } else {
                println!("job {} already finished", job_id);
            }
        }
        Command::Retry { job_id } => match queue.retry_job(&job_id).await? {
            Some(retry_id) => println!("{}", retry_id),
            None => println!("job {} is not failed", job_id),
        },
        Command::Stats => {
            let stats = queue.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::History { job_id } => {
            for transition in state.transitions.history(&job_id.to_string()).await? {
                println!(
                    "{}  {} -> {}  ({}: {})",
                    transition.timestamp.to_rfc3339(),
                    transition.from,
                    transition.to,
                    transition.actor,
                    transition.reason
                );
            }
        }
        Command::Cleanup { days } => {
            let days = days.unwrap_or(config.cleanup.retention_days);
            let deleted = queue.cleanup_old_jobs(days).await?;
            println!("deleted {} jobs", deleted);
        }
        Command::Validate { path } => {
            let path = path.unwrap_or_else(|| config.workflows_path());
            validate(&path)?;
        }
        Command::Work { workers } => {
            work::run_until_interrupted(&state, config, workers).await?;
        }
    }

    Ok(())
}

fn summary(job: &Job) -> String {
    format!(
        "{}  {:<10}  {:<20}  {:>3}%  attempts {}/{}  created {}",
        job.id,
        job.status,
        job.job_type,
        job.progress,
        job.attempts,
        job.max_attempts,
        job.created_at.to_rfc3339()
    )
}

/// Validate one workflow file or every `*.json` file in a directory.
///
/// Files are registered into a scratch registry, so ids repeated across files
/// are reported too.
fn validate(path: &Path) -> Result<()> {
    let files = if path.is_dir() {
        workflow_files(path)?
    } else {
        vec![path.to_path_buf()]
    };

    let registry = WorkflowRegistry::new();
    let mut invalid = 0;
    for file in &files {
        let checked = read_workflow(file).and_then(|workflow| {
            let graph = StepGraph::from_workflow(&workflow)?;
            let summary = format!("{} ({} steps)", workflow.id, graph.len());
            registry.register(workflow)?;
            Ok((summary, graph))
        });

        match checked {
            Ok((summary, graph)) => {
                println!("ok       {}", summary);
                for diagnostic in graph.diagnostics() {
                    println!("  warning: {}", diagnostic);
                }
            }
            Err(e) => {
                invalid += 1;
                println!("invalid  {}: {}", file.display(), e);
            }
        }
    }

    if invalid > 0 {
        anyhow::bail!("{} of {} workflow files are invalid", invalid, files.len());
    }
    Ok(())
}
