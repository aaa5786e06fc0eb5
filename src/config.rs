//! Configuration types.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::model::{ExecutionMode, JobType};

/// Default location of the job store file.
pub const DEFAULT_DB_PATH: &str = "./data/courseflow.db";

/// Default bind address for the remote job-store API.
pub const DEFAULT_API_BIND: &str = "127.0.0.1:8765";

/// Default fan-out bound for concurrent operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 50;

/// Process-wide settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Job store file.
    pub db_path: PathBuf,
    /// Root against which relative input/output paths are resolved.
    pub workspace_path: PathBuf,
    /// Address the remote job-store API listens on.
    pub api_bind: String,
    /// Optional JSON file with pool settings.
    pub pool_config_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            workspace_path: PathBuf::from("."),
            api_bind: DEFAULT_API_BIND.to_string(),
            pool_config_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read `COURSEFLOW_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_path: std::env::var("COURSEFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            workspace_path: std::env::var("COURSEFLOW_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_path),
            api_bind: std::env::var("COURSEFLOW_API_BIND").unwrap_or(defaults.api_bind),
            pool_config_path: std::env::var("COURSEFLOW_POOL_CONFIG").ok().map(PathBuf::from),
        }
    }

    /// Pool settings from the configured file, or defaults.
    pub fn load_pool_config(&self) -> Result<PoolConfig, ConfigError> {
        match &self.pool_config_path {
            Some(path) => PoolConfig::from_file(path),
            None => Ok(PoolConfig::default()),
        }
    }
}

/// Fan-out bound for `Concurrent` operations, from `COURSEFLOW_MAX_CONCURRENCY`.
pub fn max_concurrency_from_env() -> usize {
    std::env::var("COURSEFLOW_MAX_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY)
}

/// Knobs for a single worker's poll loop.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Minimum spacing between heartbeats.
    pub heartbeat_interval: Duration,
    /// Upper bound for one job's conversion.
    pub max_job_time: Duration,
    /// How long a stopping worker may spend finishing its in-flight job.
    pub shutdown_timeout: Duration,
    /// Registration attempts before the worker gives up.
    pub registration_retries: u32,
    /// First registration backoff; doubles per attempt.
    pub registration_initial_delay: Duration,
    /// Consecutive failed poll cycles before the worker declares itself crashed.
    pub max_consecutive_errors: u32,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(2),
            max_job_time: Duration::from_secs(600), // 10 minutes
            shutdown_timeout: Duration::from_secs(30),
            registration_retries: 5,
            registration_initial_delay: Duration::from_millis(500),
            max_consecutive_errors: 10,
        }
    }
}

impl WorkerRuntimeConfig {
    /// Defaults with `MAX_JOB_TIME` (seconds) applied when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("MAX_JOB_TIME") {
            let secs = raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "MAX_JOB_TIME".into(),
                message: e.to_string(),
            })?;
            config.max_job_time = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Identity and store location handed to a worker process by its supervisor.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub worker_type: JobType,
    /// Pre-registered row id, if the supervisor created one.
    pub worker_id: Option<i64>,
    pub executor_id: String,
    pub db_path: Option<PathBuf>,
    pub api_url: Option<String>,
    pub workspace_path: PathBuf,
    /// Host directory mounted at `workspace_path` inside a container.
    pub host_workspace: Option<PathBuf>,
}

impl WorkerEnv {
    /// Read `WORKER_TYPE`, `WORKER_ID`, `EXECUTOR_ID`, `DB_PATH`, `API_URL`,
    /// `WORKSPACE_PATH` and `HOST_WORKSPACE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_type = std::env::var("WORKER_TYPE")
            .map_err(|_| ConfigError::MissingEnvVar("WORKER_TYPE".into()))?
            .parse::<JobType>()
            .map_err(|e| ConfigError::InvalidValue {
                key: "WORKER_TYPE".into(),
                message: e.to_string(),
            })?;
        let worker_id = match std::env::var("WORKER_ID") {
            Ok(s) => Some(s.parse::<i64>().map_err(|e| ConfigError::InvalidValue {
                key: "WORKER_ID".into(),
                message: e.to_string(),
            })?),
            Err(_) => None,
        };
        let executor_id = std::env::var("EXECUTOR_ID")
            .unwrap_or_else(|_| format!("direct-{worker_type}-{}", short_uuid()));
        let db_path = std::env::var("DB_PATH").ok().map(PathBuf::from);
        let api_url = std::env::var("API_URL").ok();
        if db_path.is_none() && api_url.is_none() {
            return Err(ConfigError::MissingEnvVar("DB_PATH or API_URL".into()));
        }
        Ok(Self {
            worker_type,
            worker_id,
            executor_id,
            db_path,
            api_url,
            workspace_path: std::env::var("WORKSPACE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            host_workspace: std::env::var("HOST_WORKSPACE").ok().map(PathBuf::from),
        })
    }
}

/// First eight hex digits of a fresh v4 uuid.
pub fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Heartbeat staleness thresholds for worker health.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// A busy worker silent for this long is shown as hung.
    pub hung_after: Duration,
    /// Any worker silent for this long is dead.
    pub dead_after: Duration,
    /// Cleanup deletes rows silent for this long regardless of status.
    pub cleanup_after: Duration,
    /// Jobs processing for this long are returned to the queue.
    pub hung_job_reset: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            hung_after: Duration::from_secs(30),
            dead_after: Duration::from_secs(120), // 2 minutes
            cleanup_after: Duration::from_secs(600), // 10 minutes
            hung_job_reset: Duration::from_secs(600),
        }
    }
}

/// Per-job-type pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTypeConfig {
    /// Overrides the pool default when set.
    pub execution_mode: Option<ExecutionMode>,
    /// Overrides the pool default when set. Must be 1..=20.
    pub count: Option<usize>,
    /// Container image for docker mode.
    pub image: Option<String>,
    /// Container memory limit, docker syntax.
    pub memory_limit: String,
    /// Seconds a single job may run.
    pub max_job_time: u64,
}

impl Default for WorkerTypeConfig {
    fn default() -> Self {
        Self {
            execution_mode: None,
            count: None,
            image: None,
            memory_limit: "1g".to_string(),
            max_job_time: 600,
        }
    }
}

/// Worker pool lifecycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub default_execution_mode: ExecutionMode,
    pub default_worker_count: usize,
    /// Start workers automatically around a client session.
    pub auto_start: bool,
    /// Stop the workers this session started when it ends.
    pub auto_stop: bool,
    /// Attach to healthy registered workers instead of spawning new ones.
    pub reuse_workers: bool,
    /// Docker network for containerized workers.
    pub network_name: String,
    /// Seconds to wait for a spawned worker to come alive.
    pub startup_timeout: u64,
    /// Workers started at the same time.
    pub startup_parallel: usize,
    /// Seconds between health sweeps.
    pub health_check_interval: u64,
    /// URL containerized workers use to reach the job-store API.
    pub api_url: String,
    /// Where the pool records the workers it started.
    pub state_file: PathBuf,
    pub worker_types: HashMap<JobType, WorkerTypeConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_execution_mode: ExecutionMode::Direct,
            default_worker_count: 1,
            auto_start: true,
            auto_stop: true,
            reuse_workers: true,
            network_name: "courseflow_app-network".to_string(),
            startup_timeout: 30,
            startup_parallel: 5,
            health_check_interval: 10,
            api_url: "http://host.docker.internal:8765".to_string(),
            state_file: PathBuf::from(".courseflow/worker-state.json"),
            worker_types: HashMap::new(),
        }
    }
}

/// Worker counts accepted per type.
pub const WORKER_COUNT_RANGE: std::ops::RangeInclusive<usize> = 1..=20;

impl PoolConfig {
    /// Load from a JSON file and validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !WORKER_COUNT_RANGE.contains(&self.default_worker_count) {
            return Err(ConfigError::InvalidValue {
                key: "default_worker_count".into(),
                message: format!("{} not in 1..=20", self.default_worker_count),
            });
        }
        for (job_type, cfg) in &self.worker_types {
            if let Some(count) = cfg.count {
                if !WORKER_COUNT_RANGE.contains(&count) {
                    return Err(ConfigError::InvalidValue {
                        key: format!("worker_types.{job_type}.count"),
                        message: format!("{count} not in 1..=20"),
                    });
                }
            }
        }
        if self.startup_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                key: "startup_parallel".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Resolved settings for one job type.
    pub fn for_type(&self, job_type: JobType) -> ResolvedWorkerConfig {
        let specific = self.worker_types.get(&job_type).cloned().unwrap_or_default();
        ResolvedWorkerConfig {
            job_type,
            execution_mode: specific.execution_mode.unwrap_or(self.default_execution_mode),
            count: specific.count.unwrap_or(self.default_worker_count),
            image: specific
                .image
                .unwrap_or_else(|| format!("courseflow/{job_type}-converter:latest")),
            memory_limit: specific.memory_limit,
            max_job_time: Duration::from_secs(specific.max_job_time),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}

/// Pool settings for one job type with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWorkerConfig {
    pub job_type: JobType,
    pub execution_mode: ExecutionMode,
    pub count: usize,
    pub image: String,
    pub memory_limit: String,
    pub max_job_time: Duration,
}
