//! Ways of hosting a worker: native subprocess, container, or tokio task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ResolvedWorkerConfig, WorkerRuntimeConfig};
use crate::error::{Error, PoolError, SubprocessError};
use crate::store::model::{ExecutionMode, JobType};
use crate::store::traits::JobQueue;
use crate::subprocess::{self, RetryPolicy, SubprocessRunner};
use crate::worker::{Converter, Worker, WorkerStats};

/// Grace period a stopping worker gets before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Everything an executor needs to bring one worker up.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub job_type: JobType,
    /// Position of the worker within its type, used for names.
    pub index: usize,
    pub executor_id: String,
    /// Row pre-registered by the pool, handed to the worker as `WORKER_ID`.
    pub db_worker_id: Option<i64>,
    pub config: ResolvedWorkerConfig,
}

/// Handle on a started worker.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchedWorker {
    pub executor_id: String,
    pub pid: Option<u32>,
}

/// Starts, stops and probes workers of one execution mode.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    async fn start(&self, launch: &WorkerLaunch) -> Result<LaunchedWorker, PoolError>;

    /// Stop a worker; returns whether anything was running.
    async fn stop(&self, executor_id: &str, pid: Option<u32>) -> Result<bool, PoolError>;

    async fn is_running(&self, executor_id: &str, pid: Option<u32>) -> bool;

    /// Stop everything this executor started.
    async fn shutdown(&self) {}
}

fn executor_error(mode: ExecutionMode, reason: impl std::fmt::Display) -> PoolError {
    PoolError::Executor {
        mode: mode.to_string(),
        reason: reason.to_string(),
    }
}

// ── Direct ──────────────────────────────────────────────────────────

/// Runs each worker as a native `courseflow worker` subprocess.
pub struct DirectExecutor {
    program: PathBuf,
    args: Vec<String>,
    db_path: PathBuf,
    workspace: PathBuf,
    log_level: String,
    children: Mutex<HashMap<String, Child>>,
}

impl DirectExecutor {
    pub fn new(db_path: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let program = std::env::current_exe()
            .map_err(|e| executor_error(ExecutionMode::Direct, format!("locating binary: {e}")))?;
        Ok(Self {
            program,
            args: vec!["worker".to_string()],
            db_path: db_path.into(),
            workspace: workspace.into(),
            log_level: std::env::var("COURSEFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Launch `program args..` instead of this binary's `worker` subcommand.
    pub fn with_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }

    fn log_file(&self, launch: &WorkerLaunch) -> PathBuf {
        self.workspace
            .join(".courseflow")
            .join("logs")
            .join(format!("{}-worker-{}.log", launch.job_type, launch.index))
    }
}

#[async_trait]
impl WorkerExecutor for DirectExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Direct
    }

    async fn start(&self, launch: &WorkerLaunch) -> Result<LaunchedWorker, PoolError> {
        let log_path = self.log_file(launch);
        if let Some(dir) = log_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| executor_error(self.mode(), format!("creating log dir: {e}")))?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| executor_error(self.mode(), format!("opening {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| executor_error(self.mode(), e))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("WORKER_TYPE", launch.job_type.as_str())
            .env("EXECUTOR_ID", &launch.executor_id)
            .env("DB_PATH", &self.db_path)
            .env("WORKSPACE_PATH", &self.workspace)
            .env("COURSEFLOW_LOG_LEVEL", &self.log_level)
            .env("MAX_JOB_TIME", launch.config.max_job_time.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(id) = launch.db_worker_id {
            cmd.env("WORKER_ID", id.to_string());
        }

        let child = cmd.spawn().map_err(|e| {
            executor_error(self.mode(), format!("spawning {}: {e}", self.program.display()))
        })?;
        let pid = child.id();
        info!(
            executor_id = %launch.executor_id,
            job_type = %launch.job_type,
            pid,
            log = %log_path.display(),
            "Started direct worker"
        );
        self.children
            .lock()
            .await
            .insert(launch.executor_id.clone(), child);
        Ok(LaunchedWorker {
            executor_id: launch.executor_id.clone(),
            pid,
        })
    }

    async fn stop(&self, executor_id: &str, pid: Option<u32>) -> Result<bool, PoolError> {
        let child = self.children.lock().await.remove(executor_id);
        match child {
            Some(mut child) => {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return Ok(false);
                }
                subprocess::terminate(&mut child, STOP_GRACE).await;
                debug!(executor_id, "Stopped direct worker");
                Ok(true)
            }
            // Started by an earlier invocation; only the pid is known.
            None => {
                let Some(pid) = pid else {
                    return Ok(false);
                };
                if !pid_alive(pid).await {
                    return Ok(false);
                }
                subprocess::send_sigterm(pid).await;
                let deadline = tokio::time::Instant::now() + STOP_GRACE;
                while pid_alive(pid).await {
                    if tokio::time::Instant::now() >= deadline {
                        if let Err(e) = Command::new("kill")
                            .args(["-KILL", &pid.to_string()])
                            .status()
                            .await
                        {
                            debug!(pid, "kill -KILL failed: {e}");
                        }
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Ok(true)
            }
        }
    }

    async fn is_running(&self, executor_id: &str, pid: Option<u32>) -> bool {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(executor_id) {
            return matches!(child.try_wait(), Ok(None));
        }
        drop(children);
        match pid {
            Some(pid) => pid_alive(pid).await,
            None => false,
        }
    }

    async fn shutdown(&self) {
        let children: Vec<(String, Child)> = self.children.lock().await.drain().collect();
        for (executor_id, mut child) in children {
            subprocess::terminate(&mut child, STOP_GRACE).await;
            debug!(executor_id, "Direct worker shut down");
        }
    }
}

async fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

// ── Docker ──────────────────────────────────────────────────────────

/// Runs each worker in its own container through the docker CLI.
pub struct DockerExecutor {
    runner: SubprocessRunner,
    policy: RetryPolicy,
    network: String,
    api_url: String,
    host_workspace: PathBuf,
}

impl DockerExecutor {
    pub fn new(
        network: impl Into<String>,
        api_url: impl Into<String>,
        host_workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner: SubprocessRunner::new(),
            policy: RetryPolicy {
                max_retries: 1,
                ..RetryPolicy::default()
            },
            network: network.into(),
            api_url: api_url.into(),
            host_workspace: host_workspace.into(),
        }
    }

    /// Container name for the `index`th worker of a type.
    pub fn container_name(job_type: JobType, index: usize) -> String {
        format!("courseflow-{job_type}-worker-{index}")
    }

    async fn docker(&self, args: &[&str]) -> Result<String, SubprocessError> {
        let mut command = vec!["docker".to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        let output = self.runner.run(&command, &self.policy).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn ensure_network(&self) -> Result<(), PoolError> {
        if self.docker(&["network", "inspect", &self.network]).await.is_ok() {
            return Ok(());
        }
        info!(network = %self.network, "Creating docker network");
        self.docker(&["network", "create", &self.network])
            .await
            .map(|_| ())
            .map_err(|e| executor_error(self.mode(), e))
    }
}

#[async_trait]
impl WorkerExecutor for DockerExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Docker
    }

    async fn start(&self, launch: &WorkerLaunch) -> Result<LaunchedWorker, PoolError> {
        self.ensure_network().await?;
        let name = Self::container_name(launch.job_type, launch.index);
        // A leftover container with the same name blocks `docker run`.
        if let Err(e) = self.docker(&["rm", "-f", &name]).await {
            debug!(container = %name, "No leftover container removed: {e}");
        }

        let volume = format!("{}:/workspace", self.host_workspace.display());
        let env = [
            format!("WORKER_TYPE={}", launch.job_type),
            format!("EXECUTOR_ID={name}"),
            format!("API_URL={}", self.api_url),
            "WORKSPACE_PATH=/workspace".to_string(),
            format!("HOST_WORKSPACE={}", self.host_workspace.display()),
            format!("MAX_JOB_TIME={}", launch.config.max_job_time.as_secs()),
        ];
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--memory".into(),
            launch.config.memory_limit.clone(),
            "--network".into(),
            self.network.clone(),
            "--add-host".into(),
            "host.docker.internal:host-gateway".into(),
            "-v".into(),
            volume,
        ];
        for var in env {
            args.push("-e".into());
            args.push(var);
        }
        if let Some(id) = launch.db_worker_id {
            args.push("-e".into());
            args.push(format!("WORKER_ID={id}"));
        }
        args.push(launch.config.image.clone());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = self
            .docker(&refs)
            .await
            .map_err(|e| executor_error(self.mode(), e))?;
        info!(
            container = %name,
            container_id = %container_id.chars().take(12).collect::<String>(),
            image = %launch.config.image,
            "Started docker worker"
        );
        Ok(LaunchedWorker {
            executor_id: name,
            pid: None,
        })
    }

    async fn stop(&self, executor_id: &str, _pid: Option<u32>) -> Result<bool, PoolError> {
        if !self.is_running(executor_id, None).await {
            if let Err(e) = self.docker(&["rm", executor_id]).await {
                debug!(container = executor_id, "docker rm failed: {e}");
            }
            return Ok(false);
        }
        if let Err(e) = self.docker(&["stop", "-t", "10", executor_id]).await {
            warn!(container = executor_id, "docker stop failed: {e}");
        }
        if let Err(e) = self.docker(&["rm", executor_id]).await {
            debug!(container = executor_id, "docker rm failed: {e}");
        }
        Ok(true)
    }

    async fn is_running(&self, executor_id: &str, _pid: Option<u32>) -> bool {
        matches!(
            self.docker(&["inspect", "-f", "{{.State.Running}}", executor_id]).await,
            Ok(out) if out == "true"
        )
    }
}

// ── In-process ──────────────────────────────────────────────────────

/// Builds the converter for each in-process worker.
pub type ConverterFactory = Arc<dyn Fn(JobType) -> Converter + Send + Sync>;

struct TaskHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Result<WorkerStats, Error>>,
}

/// Runs workers as tokio tasks sharing the caller's queue.
pub struct InProcessExecutor {
    queue: Arc<dyn JobQueue>,
    workspace: PathBuf,
    runtime: WorkerRuntimeConfig,
    converters: ConverterFactory,
    tasks: Mutex<HashMap<String, TaskHandle>>,
}

impl InProcessExecutor {
    pub fn new(queue: Arc<dyn JobQueue>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            queue,
            workspace: workspace.into(),
            runtime: WorkerRuntimeConfig::default(),
            converters: Arc::new(Converter::for_job_type),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_runtime(mut self, runtime: WorkerRuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_converters(
        mut self,
        factory: impl Fn(JobType) -> Converter + Send + Sync + 'static,
    ) -> Self {
        self.converters = Arc::new(factory);
        self
    }
}

#[async_trait]
impl WorkerExecutor for InProcessExecutor {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::InProcess
    }

    async fn start(&self, launch: &WorkerLaunch) -> Result<LaunchedWorker, PoolError> {
        let mut runtime = self.runtime.clone();
        runtime.max_job_time = launch.config.max_job_time;
        let converter = (self.converters)(launch.job_type);

        let worker = match launch.db_worker_id {
            Some(id) => {
                Worker::attach(
                    Arc::clone(&self.queue),
                    launch.job_type,
                    id,
                    &self.workspace,
                    runtime,
                )
                .await
            }
            None => {
                Worker::register(
                    Arc::clone(&self.queue),
                    launch.job_type,
                    &launch.executor_id,
                    self.mode(),
                    &self.workspace,
                    runtime,
                )
                .await
            }
        }
        .map_err(|e| executor_error(self.mode(), e))?
        .with_converter(converter);

        let stop = worker.stop_flag();
        let executor_id = launch.executor_id.clone();
        let handle = tokio::spawn(async move {
            let result = worker.run().await;
            if let Err(e) = &result {
                warn!(executor_id = %executor_id, "In-process worker ended with error: {e}");
            }
            result
        });
        self.tasks
            .lock()
            .await
            .insert(launch.executor_id.clone(), TaskHandle { stop, handle });
        Ok(LaunchedWorker {
            executor_id: launch.executor_id.clone(),
            pid: None,
        })
    }

    async fn stop(&self, executor_id: &str, _pid: Option<u32>) -> Result<bool, PoolError> {
        let Some(task) = self.tasks.lock().await.remove(executor_id) else {
            return Ok(false);
        };
        task.stop.store(true, Ordering::Relaxed);
        let was_running = !task.handle.is_finished();
        match task.handle.await {
            Ok(Ok(stats)) => debug!(executor_id, completed = stats.completed, "In-process worker stopped"),
            Ok(Err(e)) => debug!(executor_id, "In-process worker stopped with error: {e}"),
            Err(e) => warn!(executor_id, "In-process worker task panicked: {e}"),
        }
        Ok(was_running)
    }

    async fn is_running(&self, executor_id: &str, _pid: Option<u32>) -> bool {
        self.tasks
            .lock()
            .await
            .get(executor_id)
            .is_some_and(|t| !t.handle.is_finished())
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id, None).await {
                debug!(executor_id = %id, "Stop during shutdown: {e}");
            }
        }
    }
}
