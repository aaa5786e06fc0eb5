use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use courseflow::config::OrchestratorConfig;
use courseflow::pool::{InProcessExecutor, WorkerPoolManager};
use courseflow::store::model::{ExecutionMode, Job, JobStatus, JobType, WorkerStatus};
use courseflow::store::{JobStore, LocalQueue, classify};

#[derive(Parser, Debug)]
#[command(
    name = "courseflow",
    version,
    about = "Job orchestration for course-material builds"
)]
struct Cli {
    /// Job store file.
    #[arg(long, global = true, env = "COURSEFLOW_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Workspace that relative input and output paths resolve against.
    #[arg(long, global = true, env = "COURSEFLOW_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one worker, configured from WORKER_TYPE, DB_PATH / API_URL and friends
    Worker,
    /// Serve the job store over HTTP for containerized workers
    Serve {
        #[arg(long, env = "COURSEFLOW_API_BIND")]
        bind: Option<String>,
    },
    /// Manage the worker pool
    Pool {
        #[command(subcommand)]
        command: PoolCommand,
    },
    /// Inspect and cancel jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
    /// Inspect registered workers
    Workers {
        #[command(subcommand)]
        command: WorkersCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PoolCommand {
    /// Start workers and supervise them until interrupted
    Start {
        /// Job types to start workers for (default: all)
        #[arg(long = "type", value_enum)]
        types: Vec<TypeArg>,
        /// Record the workers in the state file and exit
        #[arg(long)]
        detach: bool,
    },
    /// Stop the workers recorded in the state file
    Stop,
    /// Show workers and queue counters
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum JobsCommand {
    List {
        #[arg(long, value_enum, default_value = "pending")]
        status: StatusArg,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Flag pending jobs as cancelled
    Cancel {
        #[arg(long = "type", value_enum)]
        job_type: Option<TypeArg>,
        /// Only jobs queued at least this many seconds ago
        #[arg(long)]
        older_than: Option<u64>,
    },
    Stats,
}

#[derive(Subcommand, Debug)]
enum WorkersCommand {
    List {
        #[arg(long, value_enum)]
        status: Option<WorkerStatusArg>,
    },
    /// Mark silent workers dead, requeue their jobs and delete old rows
    Cleanup,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TypeArg {
    Notebook,
    Plantuml,
    Drawio,
}

impl From<TypeArg> for JobType {
    fn from(t: TypeArg) -> Self {
        match t {
            TypeArg::Notebook => JobType::Notebook,
            TypeArg::Plantuml => JobType::PlantUml,
            TypeArg::Drawio => JobType::DrawIo,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WorkerStatusArg {
    Idle,
    Busy,
    Hung,
    Dead,
}

impl From<WorkerStatusArg> for WorkerStatus {
    fn from(s: WorkerStatusArg) -> Self {
        match s {
            WorkerStatusArg::Idle => WorkerStatus::Idle,
            WorkerStatusArg::Busy => WorkerStatus::Busy,
            WorkerStatusArg::Hung => WorkerStatus::Hung,
            WorkerStatusArg::Dead => WorkerStatus::Dead,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing()?;

    let mut config = OrchestratorConfig::from_env();
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }
    if let Some(workspace) = cli.workspace {
        config.workspace_path = workspace;
    }

    match cli.command {
        Commands::Worker => {
            let stats = courseflow::worker::run_from_env().await?;
            info!(
                completed = stats.completed,
                failed = stats.failed,
                cancelled = stats.cancelled,
                cache_hits = stats.cache_hits,
                "Worker exited"
            );
        }
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api_bind.clone());
            let store = open_store(&config.db_path).await?;
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            tokio::select! {
                result = courseflow::api::serve(listener, LocalQueue::new(store)) => result?,
                _ = tokio::signal::ctrl_c() => info!("Shutting down API server"),
            }
        }
        Commands::Pool { command } => run_pool(command, &config).await?,
        Commands::Jobs { command } => run_jobs(command, &config).await?,
        Commands::Workers { command } => run_workers(command, &config).await?,
    }
    Ok(())
}

/// Console logging, plus a daily log file when `COURSEFLOW_LOG_DIR` is set.
fn init_tracing() -> Result<Option<WorkerGuard>> {
    let default_level = std::env::var("COURSEFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match std::env::var("COURSEFLOW_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "courseflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .try_init()
                .context("installing tracing subscriber")?;
            Ok(Some(guard))
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}

async fn open_store(db_path: &Path) -> Result<JobStore> {
    JobStore::open(db_path)
        .await
        .with_context(|| format!("opening job store at {}", db_path.display()))
}

async fn pool_manager(config: &OrchestratorConfig) -> Result<Arc<WorkerPoolManager>> {
    let pool_config = config.load_pool_config()?;
    let store = open_store(&config.db_path).await?;
    let in_process = InProcessExecutor::new(
        Arc::new(LocalQueue::new(store.clone())),
        &config.workspace_path,
    );
    let manager = WorkerPoolManager::new(pool_config, store, &config.db_path)
        .with_default_executors(&config.workspace_path)?
        .with_executor(Arc::new(in_process));
    Ok(Arc::new(manager))
}

async fn run_pool(command: PoolCommand, config: &OrchestratorConfig) -> Result<()> {
    let manager = pool_manager(config).await?;
    match command {
        PoolCommand::Start { types, detach } => {
            let types: Vec<JobType> = if types.is_empty() {
                JobType::ALL.to_vec()
            } else {
                types.into_iter().map(JobType::from).collect()
            };
            let modes: Vec<ExecutionMode> = types
                .iter()
                .map(|t| manager.config().for_type(*t).execution_mode)
                .collect();

            let api = if modes.contains(&ExecutionMode::Docker) {
                let listener = tokio::net::TcpListener::bind(&config.api_bind)
                    .await
                    .with_context(|| format!("binding {}", config.api_bind))?;
                let store = open_store(&config.db_path).await?;
                Some(tokio::spawn(courseflow::api::serve(
                    listener,
                    LocalQueue::new(store),
                )))
            } else {
                None
            };

            let started = manager.start(&types).await?;
            for w in &started {
                println!(
                    "started {:<9} {:<10} {}",
                    w.job_type.as_str(),
                    w.mode.as_str(),
                    w.executor_id
                );
            }

            if detach {
                if modes.contains(&ExecutionMode::InProcess) || api.is_some() {
                    warn!("In-process workers and the API server end with this process");
                }
                println!("{} worker(s) recorded; stop them with `courseflow pool stop`", started.len());
                return Ok(());
            }

            let (monitor, stop_monitor) = manager.spawn_health_monitor();
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Stopping worker pool");
            stop_monitor.store(true, Ordering::Relaxed);
            if tokio::time::timeout(Duration::from_secs(5), monitor).await.is_err() {
                warn!("Health monitor did not stop in time");
            }
            if manager.config().auto_stop {
                let stopped = manager.stop().await?;
                println!("stopped {stopped} worker(s)");
            }
            if let Some(api) = api {
                api.abort();
            }
        }
        PoolCommand::Stop => {
            let stopped = manager.stop_from_state().await?;
            println!("stopped {stopped} worker(s)");
        }
        PoolCommand::Status { json } => {
            let status = manager.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
                return Ok(());
            }
            println!(
                "jobs: {} pending, {} processing, {} completed, {} failed, {} cancelled",
                status.queue.pending,
                status.queue.processing,
                status.queue.completed,
                status.queue.failed,
                status.queue.cancelled
            );
            let mut counts: Vec<_> = status.health_counts().into_iter().collect();
            counts.sort_by_key(|(t, _)| *t);
            for (job_type, by_health) in counts {
                let mut parts: Vec<String> = by_health
                    .iter()
                    .map(|(h, n)| format!("{n} {h}"))
                    .collect();
                parts.sort();
                println!("{:<9} {}", job_type.as_str(), parts.join(", "));
            }
        }
    }
    Ok(())
}

async fn run_jobs(command: JobsCommand, config: &OrchestratorConfig) -> Result<()> {
    let store = open_store(&config.db_path).await?;
    match command {
        JobsCommand::List { status, limit } => {
            let jobs = match status {
                StatusArg::Cancelled => store.list_cancelled(limit).await?,
                StatusArg::Pending => store.list_by_status(JobStatus::Pending, limit).await?,
                StatusArg::Processing => store.list_by_status(JobStatus::Processing, limit).await?,
                StatusArg::Completed => store.list_by_status(JobStatus::Completed, limit).await?,
                StatusArg::Failed => store.list_by_status(JobStatus::Failed, limit).await?,
            };
            for job in &jobs {
                print_job(job);
            }
            if jobs.is_empty() {
                println!("no jobs");
            }
        }
        JobsCommand::Cancel {
            job_type,
            older_than,
        } => {
            let cancelled = store
                .cancel_pending(
                    job_type.map(JobType::from),
                    older_than.map(Duration::from_secs),
                    "cli",
                )
                .await?;
            println!("cancelled {} job(s)", cancelled.len());
        }
        JobsCommand::Stats => {
            let stats = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!(
        "{:>6} {:<9} {:<10} {}/{} {} -> {}",
        job.id,
        job.job_type.as_str(),
        job.display_status(),
        job.attempts,
        job.max_attempts,
        job.input_file,
        job.output_file
    );
    if job.status != JobStatus::Failed {
        return;
    }
    if let Some(failure) = job.failure() {
        println!("       [{}] {}", failure.category, failure.error_message);
        if !failure.actionable_guidance.is_empty() {
            println!("       {}", failure.actionable_guidance);
        }
    }
}

async fn run_workers(command: WorkersCommand, config: &OrchestratorConfig) -> Result<()> {
    match command {
        WorkersCommand::List { status } => {
            let store = open_store(&config.db_path).await?;
            let thresholds = courseflow::config::HealthThresholds::default();
            let now = chrono::Utc::now();
            let workers = store
                .registry()
                .discover(status.map(WorkerStatus::from))
                .await?;
            for w in &workers {
                println!(
                    "{:>5} {:<9} {:<6} {:<6} done={} failed={} {}",
                    w.id,
                    w.worker_type.as_str(),
                    w.status.as_str(),
                    classify(w, now, &thresholds).as_str(),
                    w.jobs_processed,
                    w.jobs_failed,
                    w.container_id
                );
            }
            if workers.is_empty() {
                println!("no workers");
            }
        }
        WorkersCommand::Cleanup => {
            let report = pool_manager(config).await?.cleanup_stale().await?;
            println!(
                "marked dead: {}, deleted: {}, orphaned jobs reset: {}, hung jobs reset: {}",
                report.marked_dead.len(),
                report.deleted_workers.len(),
                report.reset_orphaned.len(),
                report.reset_hung.len()
            );
        }
    }
    Ok(())
}
