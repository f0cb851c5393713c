//! CLI command definitions for render-queue.
//!
//! Every command builds a [`QueueManager`] from the YAML config (if any) plus
//! flag overrides, so the same backend settings serve submitters and workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{BackendConfig, QueueConfig};
use crate::error::QueueError;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::renderer::TeraFileRenderer;
use crate::scheduler::{
    HookRegistry, Job, JobMetadata, JobPriority, JobRequest, JobStatus, QueueManager,
    DEFAULT_WAIT_POLL_INTERVAL,
};

/// Default output directory for rendered documents.
const DEFAULT_OUTPUT_DIR: &str = "./rendered";

/// Asynchronous job queue and worker pool for document rendering.
#[derive(Parser)]
#[command(name = "render-queue")]
#[command(about = "Queue, render and track document rendering jobs")]
#[command(version)]
#[command(
    long_about = "render-queue schedules document rendering jobs on a pluggable backend (memory, Redis or a SQLite-backed managed queue) and renders them with a pool of workers.\n\nExample usage:\n  render-queue run --jobs jobs.yaml --output-dir ./rendered\n  render-queue --redis-url redis://localhost:6379 work --output-dir ./rendered"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, env = "RENDER_QUEUE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Use the Redis backend at this URL.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Use the managed backend with this SQLite database. Wins over `--redis-url`.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Number of workers.
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a job file to an in-process pool and wait for every job.
    Run(RunArgs),

    /// Enqueue one job and print its id.
    Submit(SubmitArgs),

    /// Run workers until Ctrl-C.
    Work(WorkArgs),

    /// Print a job record.
    Status(StatusArgs),

    /// Cancel a job that has not been claimed yet.
    Cancel(CancelArgs),

    /// Print per-status job counts.
    Stats,

    /// Print Prometheus metrics for the configured backend.
    Metrics,
}

/// Renderer settings shared by commands that run workers.
#[derive(clap::Args, Debug, Clone)]
pub struct RendererArgs {
    /// Directory rendered documents are written to.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Directory templates and stylesheets are resolved against.
    #[arg(short, long)]
    pub template_dir: Option<PathBuf>,
}

/// Arguments for `render-queue run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// YAML or JSON job file.
    #[arg(short, long)]
    pub jobs: PathBuf,

    #[command(flatten)]
    pub renderer: RendererArgs,

    /// Give up waiting for a job after this many seconds.
    #[arg(long, default_value = "300")]
    pub timeout_secs: u64,
}

/// Arguments for `render-queue submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Template name or inline template source.
    #[arg(long)]
    pub template: String,

    /// Template data as a JSON object.
    #[arg(long)]
    pub data: String,

    /// File name of the rendered document.
    #[arg(long)]
    pub output_filename: String,

    /// Stylesheet to inline.
    #[arg(long)]
    pub css_file: Option<String>,

    /// urgent, high, normal or low.
    #[arg(short, long, default_value = "normal")]
    pub priority: JobPriority,

    /// Failed attempts allowed before the job fails for good.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Metadata entry as key=value (value parsed as JSON when possible).
    #[arg(long = "meta")]
    pub metadata: Vec<String>,
}

/// Arguments for `render-queue work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    #[command(flatten)]
    pub renderer: RendererArgs,

    /// Write Prometheus metrics to this file when the workers stop.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

/// Arguments for `render-queue status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id.
    pub id: Uuid,

    /// Block until the job is terminal.
    #[arg(long)]
    pub wait: bool,

    /// Seconds to wait with `--wait`.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

/// Arguments for `render-queue cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Job id.
    pub id: Uuid,
}

/// A batch of jobs as read from a job file.
#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub default_priority: Option<JobPriority>,
    pub jobs: Vec<JobRequest>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    submitted: usize,
    rejected: usize,
    completed: usize,
    failed: usize,
    results: Vec<RunEntry>,
}

#[derive(Debug, Serialize)]
struct RunEntry {
    output_filename: String,
    job_id: Option<Uuid>,
    status: String,
    result_path: Option<PathBuf>,
    error: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run(args) => run_jobs_command(&config, args).await,
        Commands::Submit(args) => run_submit_command(&config, args).await,
        Commands::Work(args) => run_work_command(&config, args).await,
        Commands::Status(args) => run_status_command(&config, args).await,
        Commands::Cancel(args) => run_cancel_command(&config, args).await,
        Commands::Stats => run_stats_command(&config).await,
        Commands::Metrics => run_metrics_command(&config).await,
    }
}

/// Merges the config file with flag overrides.
fn load_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = match &cli.config {
        Some(path) => QueueConfig::from_yaml_file(path)?,
        None => QueueConfig::default(),
    };

    if let Some(url) = &cli.redis_url {
        let namespace = match &config.backend {
            BackendConfig::Redis { namespace, .. } => namespace.clone(),
            _ => crate::config::DEFAULT_NAMESPACE.to_string(),
        };
        config.backend = BackendConfig::Redis {
            url: url.clone(),
            namespace,
        };
    }
    if let Some(database_url) = &cli.database_url {
        config.backend = BackendConfig::managed(database_url.clone());
    }
    if let Some(workers) = cli.workers {
        config.workers.num_workers = workers;
    }

    config.validate()?;
    Ok(config)
}

fn renderer(args: &RendererArgs) -> Arc<TeraFileRenderer> {
    let mut renderer = TeraFileRenderer::new(&args.output_dir);
    if let Some(dir) = &args.template_dir {
        renderer = renderer.with_template_dir(dir);
    }
    Arc::new(renderer)
}

async fn build_manager(
    config: &QueueConfig,
    renderer: Arc<TeraFileRenderer>,
) -> anyhow::Result<QueueManager> {
    let hooks = HookRegistry::new()
        .with_after_generate(|ctx| {
            info!(
                job_id = %ctx.job_id,
                output = ?ctx.result_path,
                "Document rendered"
            );
        })
        .with_on_error(|err, ctx| {
            warn!(job_id = %ctx.job_id, error = err, "Document failed");
        });

    Ok(QueueManager::from_config(config, renderer, hooks).await?)
}

/// Manager for commands that never start workers.
async fn client_manager(config: &QueueConfig) -> anyhow::Result<QueueManager> {
    build_manager(config, Arc::new(TeraFileRenderer::new(DEFAULT_OUTPUT_DIR))).await
}

fn load_job_file(path: &Path) -> anyhow::Result<JobFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read job file {}: {}", path.display(), e))?;
    // YAML is a superset of JSON, so one parser covers both.
    let file: JobFile = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Invalid job file {}: {}", path.display(), e))?;
    Ok(file)
}

fn parse_metadata(entries: &[String]) -> anyhow::Result<JobMetadata> {
    let mut metadata = JobMetadata::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Metadata '{}' must look like key=value", entry))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        metadata.insert(key.trim().to_string(), value);
    }
    Ok(metadata)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_jobs_command(config: &QueueConfig, args: RunArgs) -> anyhow::Result<()> {
    let file = load_job_file(&args.jobs)?;
    let manager = build_manager(config, renderer(&args.renderer)).await?;

    let filenames: Vec<String> = file.jobs.iter().map(|j| j.output_filename.clone()).collect();
    let submitted = manager.submit_batch(file.jobs, file.default_priority).await;

    manager.start().await?;
    info!(
        jobs = submitted.len(),
        workers = config.workers.num_workers,
        "Rendering job file"
    );

    let timeout = Some(Duration::from_secs(args.timeout_secs));
    let mut summary = RunSummary {
        submitted: 0,
        rejected: 0,
        completed: 0,
        failed: 0,
        results: Vec::with_capacity(submitted.len()),
    };

    for (output_filename, result) in filenames.into_iter().zip(submitted) {
        let entry = match result {
            Err(e) => {
                summary.rejected += 1;
                RunEntry {
                    output_filename,
                    job_id: None,
                    status: "rejected".to_string(),
                    result_path: None,
                    error: Some(e.to_string()),
                }
            }
            Ok(id) => {
                summary.submitted += 1;
                match manager
                    .wait_for_job(id, timeout, DEFAULT_WAIT_POLL_INTERVAL)
                    .await
                {
                    Ok(job) => {
                        summary.completed += 1;
                        RunEntry {
                            output_filename,
                            job_id: Some(id),
                            status: job.status.to_string(),
                            result_path: job.result_path,
                            error: None,
                        }
                    }
                    Err(e) => {
                        summary.failed += 1;
                        let status = match &e {
                            QueueError::WaitTimeout { .. } => "timeout".to_string(),
                            _ => JobStatus::Failed.to_string(),
                        };
                        RunEntry {
                            output_filename,
                            job_id: Some(id),
                            status,
                            result_path: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        };
        summary.results.push(entry);
    }

    if let Err(e) = manager.stop(None).await {
        warn!(error = %e, "Worker pool did not stop cleanly");
    }

    print_json(&summary)?;
    if summary.failed > 0 || summary.rejected > 0 {
        anyhow::bail!(
            "{} job(s) failed, {} rejected",
            summary.failed,
            summary.rejected
        );
    }
    Ok(())
}

async fn run_submit_command(config: &QueueConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let data: serde_json::Value = serde_json::from_str(&args.data)
        .map_err(|e| anyhow::anyhow!("--data must be valid JSON: {}", e))?;

    let mut request = JobRequest::new(args.template, data, args.output_filename)
        .with_priority(args.priority);
    request.css_file = args.css_file;
    request.max_retries = args.max_retries;
    request.metadata = parse_metadata(&args.metadata)?;

    let manager = client_manager(config).await?;
    let id = manager.submit_job(request).await?;

    println!("{}", id);
    Ok(())
}

async fn run_work_command(config: &QueueConfig, args: WorkArgs) -> anyhow::Result<()> {
    if config.backend == BackendConfig::Memory {
        warn!("Working on an in-memory backend: only jobs submitted by this process are visible");
    }

    init_metrics()?;
    let manager = build_manager(config, renderer(&args.renderer)).await?;
    manager.start().await?;
    info!(
        backend = config.backend.kind(),
        workers = config.workers.num_workers,
        "Workers running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Stopping workers");
    manager.stop(None).await?;

    if let Some(path) = &args.metrics_out {
        write_metrics(path)?;
    }
    print_json(&manager.pool_stats())
}

fn write_metrics(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, export_metrics())
        .map_err(|e| anyhow::anyhow!("Cannot write metrics to {}: {}", path.display(), e))?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

async fn run_status_command(config: &QueueConfig, args: StatusArgs) -> anyhow::Result<()> {
    let manager = client_manager(config).await?;

    let job: Job = if args.wait {
        let timeout = args.timeout_secs.map(Duration::from_secs);
        match manager
            .wait_for_job(args.id, timeout, DEFAULT_WAIT_POLL_INTERVAL)
            .await
        {
            Ok(job) => job,
            Err(QueueError::JobFailed { .. }) | Err(QueueError::JobCancelled(_)) => manager
                .get_job(args.id)
                .await?
                .ok_or(QueueError::NotFound(args.id))?,
            Err(e) => return Err(e.into()),
        }
    } else {
        manager
            .get_job(args.id)
            .await?
            .ok_or(QueueError::NotFound(args.id))?
    };

    print_json(&job)
}

async fn run_cancel_command(config: &QueueConfig, args: CancelArgs) -> anyhow::Result<()> {
    let manager = client_manager(config).await?;
    let cancelled = manager.cancel_job(args.id).await?;

    print_json(&serde_json::json!({ "job_id": args.id, "cancelled": cancelled }))
}

async fn run_stats_command(config: &QueueConfig) -> anyhow::Result<()> {
    let manager = client_manager(config).await?;
    print_json(&manager.get_queue_stats().await?)
}

async fn run_metrics_command(config: &QueueConfig) -> anyhow::Result<()> {
    init_metrics()?;
    let manager = client_manager(config).await?;

    let pending = manager.backend().get_pending_count().await?;
    MetricsCollector::new().update_queue_depth(manager.backend().name(), pending);

    print!("{}", export_metrics());
    Ok(())
}
