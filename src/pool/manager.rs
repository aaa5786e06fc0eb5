//! Worker pool supervision: start, reuse, health sweeps and shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{HealthThresholds, PoolConfig, short_uuid};
use crate::error::{Error, PoolError};
use crate::pool::executor::{DirectExecutor, DockerExecutor, WorkerExecutor, WorkerLaunch};
use crate::pool::state::{PoolState, PoolWorkerRecord, StateFile};
use crate::store::model::{ExecutionMode, JobType, QueueStats, WorkerRecord, WorkerStatus};
use crate::store::{JobStore, WorkerRegistry, classify};

/// How often a starting worker's registry row is checked.
const ACTIVATION_POLL: Duration = Duration::from_millis(100);

/// A worker this pool started and is responsible for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedWorker {
    pub job_type: JobType,
    pub mode: ExecutionMode,
    pub index: usize,
    pub executor_id: String,
    pub db_worker_id: Option<i64>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

impl From<&ManagedWorker> for PoolWorkerRecord {
    fn from(w: &ManagedWorker) -> Self {
        Self {
            worker_type: w.job_type,
            execution_mode: w.mode,
            executor_id: w.executor_id.clone(),
            db_worker_id: w.db_worker_id,
            pid: w.pid,
            started_at: w.started_at,
        }
    }
}

/// What `cleanup_stale` changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub marked_dead: Vec<i64>,
    pub deleted_workers: Vec<i64>,
    pub reset_orphaned: Vec<i64>,
    pub reset_hung: Vec<i64>,
}

/// What one health sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub restarted: Vec<String>,
    pub hung: Vec<i64>,
    pub marked_dead: Vec<i64>,
    pub reset_jobs: Vec<i64>,
}

/// A registered worker with its heartbeat-derived health.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub record: WorkerRecord,
    pub health: WorkerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerHealth>,
    pub managed: Vec<ManagedWorker>,
    pub queue: QueueStats,
}

impl PoolStatus {
    /// Count of workers per health, by job type.
    pub fn health_counts(&self) -> HashMap<JobType, HashMap<WorkerStatus, usize>> {
        let mut counts: HashMap<JobType, HashMap<WorkerStatus, usize>> = HashMap::new();
        for w in &self.workers {
            *counts
                .entry(w.record.worker_type)
                .or_default()
                .entry(w.health)
                .or_default() += 1;
        }
        counts
    }
}

/// Supervises the conversion workers of one job store.
pub struct WorkerPoolManager {
    config: PoolConfig,
    store: JobStore,
    registry: WorkerRegistry,
    db_path: PathBuf,
    executors: HashMap<ExecutionMode, Arc<dyn WorkerExecutor>>,
    managed: Mutex<Vec<ManagedWorker>>,
    thresholds: HealthThresholds,
    state_file: StateFile,
}

impl WorkerPoolManager {
    pub fn new(config: PoolConfig, store: JobStore, db_path: impl Into<PathBuf>) -> Self {
        let registry = store.registry();
        let state_file = StateFile::new(config.state_file.clone());
        Self {
            config,
            store,
            registry,
            db_path: db_path.into(),
            executors: HashMap::new(),
            managed: Mutex::new(Vec::new()),
            thresholds: HealthThresholds::default(),
            state_file,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn WorkerExecutor>) -> Self {
        self.executors.insert(executor.mode(), executor);
        self
    }

    /// Register the direct and docker executors for `workspace`.
    pub fn with_default_executors(self, workspace: &Path) -> Result<Self, PoolError> {
        let direct = DirectExecutor::new(self.db_path.clone(), workspace)?;
        let host_workspace = std::fs::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf());
        let docker = DockerExecutor::new(
            self.config.network_name.clone(),
            self.config.api_url.clone(),
            host_workspace,
        );
        Ok(self
            .with_executor(Arc::new(direct))
            .with_executor(Arc::new(docker)))
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub async fn managed(&self) -> Vec<ManagedWorker> {
        self.managed.lock().await.clone()
    }

    fn executor_for(&self, mode: ExecutionMode) -> Result<Arc<dyn WorkerExecutor>, PoolError> {
        self.executors
            .get(&mode)
            .cloned()
            .ok_or_else(|| PoolError::NoExecutor(mode.to_string()))
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Bring each job type up to its configured worker count.
    ///
    /// With `reuse_workers` healthy registered workers count towards the
    /// target and only the shortfall is spawned.
    pub async fn start(&self, job_types: &[JobType]) -> Result<Vec<ManagedWorker>, Error> {
        self.cleanup_stale().await?;

        let mut launches = Vec::new();
        for &job_type in job_types {
            let resolved = self.config.for_type(job_type);
            let existing = if self.config.reuse_workers {
                self.registry
                    .healthy_of_type(job_type, &self.thresholds)
                    .await?
                    .len()
            } else {
                0
            };
            let needed = resolved.count.saturating_sub(existing);
            if needed == 0 {
                info!(%job_type, existing, "Reusing healthy workers");
                continue;
            }
            info!(
                %job_type,
                existing,
                needed,
                mode = %resolved.execution_mode,
                "Starting workers"
            );
            for index in existing..existing + needed {
                launches.push(WorkerLaunch {
                    job_type,
                    index,
                    executor_id: executor_id_for(resolved.execution_mode, job_type, index),
                    db_worker_id: None,
                    config: resolved.clone(),
                });
            }
        }
        if launches.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Semaphore::new(self.config.startup_parallel.max(1));
        let total = launches.len();
        let results =
            futures::future::join_all(launches.into_iter().map(|l| self.spawn_one(l, &semaphore)))
                .await;

        let mut started = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(worker) => started.push(worker),
                Err(e) => {
                    error!("Worker failed to start: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(started = started.len(), total, "Worker startup finished");

        if started.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        self.managed.lock().await.extend(started.iter().cloned());
        self.save_state().await?;
        Ok(started)
    }

    /// Start workers unless `auto_start` is off.
    pub async fn ensure_running(&self, job_types: &[JobType]) -> Result<Vec<ManagedWorker>, Error> {
        if !self.config.auto_start {
            debug!("auto_start disabled; expecting externally managed workers");
            return Ok(Vec::new());
        }
        self.start(job_types).await
    }

    async fn spawn_one(&self, mut launch: WorkerLaunch, gate: &Semaphore) -> Result<ManagedWorker, Error> {
        let _permit = gate
            .acquire()
            .await
            .map_err(|e| PoolError::Executor {
                mode: launch.config.execution_mode.to_string(),
                reason: e.to_string(),
            })?;
        let mode = launch.config.execution_mode;
        let executor = self.executor_for(mode)?;

        // Event timestamps are stored with microsecond precision.
        let requested_at = Utc::now() - chrono::Duration::milliseconds(1);
        let db_id = self
            .registry
            .register_with_parent(
                launch.job_type,
                &launch.executor_id,
                mode,
                Some(std::process::id() as i64),
            )
            .await?;
        launch.db_worker_id = Some(db_id);

        let launched = match executor.start(&launch).await {
            Ok(launched) => launched,
            Err(e) => {
                if let Err(del) = self.registry.delete(db_id).await {
                    debug!(worker_id = db_id, "Deleting row after failed start: {del}");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .wait_for_activation(db_id, &executor, &launched.executor_id, launched.pid, requested_at)
            .await
        {
            warn!(executor_id = %launched.executor_id, "Worker did not come up: {e}");
            if let Err(stop) = executor.stop(&launched.executor_id, launched.pid).await {
                debug!(executor_id = %launched.executor_id, "Stop after failed activation: {stop}");
            }
            if let Err(del) = self.registry.delete(db_id).await {
                debug!(worker_id = db_id, "Deleting row after failed activation: {del}");
            }
            return Err(e.into());
        }

        Ok(ManagedWorker {
            job_type: launch.job_type,
            mode,
            index: launch.index,
            executor_id: launched.executor_id,
            db_worker_id: Some(db_id),
            pid: launched.pid,
            started_at: Utc::now(),
        })
    }

    /// Wait for the worker process to adopt its pre-registered row.
    async fn wait_for_activation(
        &self,
        db_id: i64,
        executor: &Arc<dyn WorkerExecutor>,
        executor_id: &str,
        pid: Option<u32>,
        since: DateTime<Utc>,
    ) -> Result<(), PoolError> {
        let timeout = self.config.startup_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.registry.events(Some(db_id), 20).await {
                Ok(events) => {
                    if events
                        .iter()
                        .any(|e| e.event_type == "activated" && e.created_at >= since)
                    {
                        debug!(worker_id = db_id, executor_id, "Worker activated");
                        return Ok(());
                    }
                }
                Err(e) => debug!(worker_id = db_id, "Reading worker events failed: {e}"),
            }
            if !executor.is_running(executor_id, pid).await {
                return Err(PoolError::Executor {
                    mode: executor.mode().to_string(),
                    reason: format!("{executor_id} exited during startup"),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::StartupTimeout {
                    executor_id: executor_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(ACTIVATION_POLL).await;
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop every worker this pool started and clear the state file.
    pub async fn stop(&self) -> Result<usize, Error> {
        let workers: Vec<ManagedWorker> = self.managed.lock().await.drain(..).collect();
        let mut stopped = 0;
        for w in &workers {
            if self.stop_worker(w.mode, &w.executor_id, w.pid, w.db_worker_id).await {
                stopped += 1;
            }
        }
        for executor in self.executors.values() {
            executor.shutdown().await;
        }
        self.state_file.clear().await;
        info!(stopped, "Worker pool stopped");
        Ok(stopped)
    }

    /// Stop the workers recorded by an earlier invocation's `start`.
    pub async fn stop_from_state(&self) -> Result<usize, Error> {
        let Some(state) = self.state_file.load().await else {
            info!(path = %self.state_file.path().display(), "No pool state found");
            return Ok(0);
        };
        state.validate(&self.db_path)?;

        let mut stopped = 0;
        for w in &state.workers {
            if self
                .stop_worker(w.execution_mode, &w.executor_id, w.pid, w.db_worker_id)
                .await
            {
                stopped += 1;
            }
        }
        self.state_file.clear().await;
        info!(stopped, recorded = state.workers.len(), "Stopped workers from saved state");
        Ok(stopped)
    }

    async fn stop_worker(
        &self,
        mode: ExecutionMode,
        executor_id: &str,
        pid: Option<u32>,
        db_worker_id: Option<i64>,
    ) -> bool {
        let stopped = match self.executor_for(mode) {
            Ok(executor) => match executor.stop(executor_id, pid).await {
                Ok(was_running) => was_running,
                Err(e) => {
                    warn!(executor_id, "Stopping worker failed: {e}");
                    false
                }
            },
            Err(e) => {
                warn!(executor_id, "{e}");
                false
            }
        };
        if let Some(id) = db_worker_id {
            if let Err(e) = self.registry.unregister(id, "pool stopped").await {
                debug!(worker_id = id, "Unregister after stop: {e}");
            }
        }
        stopped
    }

    async fn save_state(&self) -> Result<(), PoolError> {
        let records = self
            .managed
            .lock()
            .await
            .iter()
            .map(PoolWorkerRecord::from)
            .collect();
        self.state_file
            .save(&PoolState::new(self.db_path.clone(), records))
            .await
    }

    // ── Health ──────────────────────────────────────────────────────

    /// Mark silent workers dead, requeue their jobs, delete stale rows.
    pub async fn cleanup_stale(&self) -> Result<CleanupReport, Error> {
        let report = CleanupReport {
            marked_dead: self.registry.mark_stale_dead(&self.thresholds).await?,
            reset_orphaned: self.store.reset_orphaned().await?,
            reset_hung: self.store.reset_hung(self.thresholds.hung_job_reset).await?,
            deleted_workers: self.registry.cleanup(&self.thresholds).await?,
        };
        if report != CleanupReport::default() {
            info!(
                marked_dead = report.marked_dead.len(),
                deleted = report.deleted_workers.len(),
                reset_orphaned = report.reset_orphaned.len(),
                reset_hung = report.reset_hung.len(),
                "Cleaned up stale workers"
            );
        }
        Ok(report)
    }

    pub async fn status(&self) -> Result<PoolStatus, Error> {
        let now = Utc::now();
        let workers = self
            .registry
            .discover(None)
            .await?
            .into_iter()
            .map(|record| WorkerHealth {
                health: classify(&record, now, &self.thresholds),
                record,
            })
            .collect();
        Ok(PoolStatus {
            workers,
            managed: self.managed().await,
            queue: self.store.counts().await?,
        })
    }

    /// One supervision pass over the managed workers.
    ///
    /// Dead managed workers are restarted in place; hung ones are left to
    /// finish or time out. Registered containers that no longer run are
    /// marked dead, and their jobs requeued.
    pub async fn health_check(&self) -> Result<HealthReport, Error> {
        let mut report = HealthReport::default();
        let now = Utc::now();
        let managed = self.managed().await;

        for worker in &managed {
            let record = match worker.db_worker_id {
                Some(id) => self.registry.get(id).await?,
                None => None,
            };
            let health = record.as_ref().map(|r| classify(r, now, &self.thresholds));
            let running = match self.executor_for(worker.mode) {
                Ok(executor) => executor.is_running(&worker.executor_id, worker.pid).await,
                Err(_) => false,
            };

            let draining = running
                && record
                    .as_ref()
                    .is_some_and(|r| r.status == WorkerStatus::Busy);
            if running && (health == Some(WorkerStatus::Hung) || draining) {
                warn!(executor_id = %worker.executor_id, "Worker appears hung; leaving it");
                if let Some(id) = worker.db_worker_id {
                    report.hung.push(id);
                }
                continue;
            }
            if running && matches!(health, Some(WorkerStatus::Idle | WorkerStatus::Busy)) {
                continue;
            }

            warn!(
                executor_id = %worker.executor_id,
                running,
                health = ?health,
                "Managed worker is gone, restarting"
            );
            match self.restart(worker).await {
                Ok(replacement) => {
                    report.restarted.push(worker.executor_id.clone());
                    let mut guard = self.managed.lock().await;
                    if let Some(entry) = guard
                        .iter_mut()
                        .find(|m| m.executor_id == worker.executor_id)
                    {
                        *entry = replacement;
                    }
                }
                Err(e) => error!(executor_id = %worker.executor_id, "Restart failed: {e}"),
            }
        }

        if let Ok(docker) = self.executor_for(ExecutionMode::Docker) {
            for record in self.registry.discover(None).await? {
                if record.execution_mode != Some(ExecutionMode::Docker)
                    || record.status == WorkerStatus::Dead
                {
                    continue;
                }
                if !docker.is_running(&record.container_id, None).await {
                    self.registry.set_status(record.id, WorkerStatus::Dead).await?;
                    self.registry
                        .log_event(
                            "marked_dead",
                            Some(record.id),
                            Some(record.worker_type),
                            Some("container not running"),
                            None,
                        )
                        .await;
                    report.marked_dead.push(record.id);
                }
            }
        }

        report.reset_jobs = self.store.reset_orphaned().await?;
        if !report.restarted.is_empty() {
            self.save_state().await?;
        }
        Ok(report)
    }

    async fn restart(&self, worker: &ManagedWorker) -> Result<ManagedWorker, Error> {
        let executor = self.executor_for(worker.mode)?;
        if let Err(e) = executor.stop(&worker.executor_id, worker.pid).await {
            debug!(executor_id = %worker.executor_id, "Stop before restart: {e}");
        }
        if let Some(id) = worker.db_worker_id {
            if let Err(e) = self.registry.unregister(id, "restarting").await {
                debug!(worker_id = id, "Unregister before restart: {e}");
            }
        }

        let mut config = self.config.for_type(worker.job_type);
        config.execution_mode = worker.mode;
        let launch = WorkerLaunch {
            job_type: worker.job_type,
            index: worker.index,
            executor_id: executor_id_for(worker.mode, worker.job_type, worker.index),
            db_worker_id: None,
            config,
        };
        let replacement = self.spawn_one(launch, &Semaphore::new(1)).await?;
        self.registry
            .log_event(
                "restarted",
                replacement.db_worker_id,
                Some(worker.job_type),
                Some(&worker.executor_id),
                None,
            )
            .await;
        Ok(replacement)
    }

    /// Run `health_check` every `health_check_interval` until the flag is set.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let pool = Arc::clone(self);
        let interval = self.config.health_check_interval().max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            info!(interval = ?interval, "Worker health monitor started");
            let mut tick = tokio::time::interval(interval);
            // The first tick fires immediately; the pool was just started.
            tick.tick().await;
            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!("Worker health monitor shutting down");
                    return;
                }
                match pool.health_check().await {
                    Ok(report) if report != HealthReport::default() => info!(
                        restarted = report.restarted.len(),
                        hung = report.hung.len(),
                        marked_dead = report.marked_dead.len(),
                        reset_jobs = report.reset_jobs.len(),
                        "Health sweep"
                    ),
                    Ok(_) => {}
                    Err(e) => error!("Health sweep failed: {e}"),
                }
            }
        });

        (handle, shutdown_flag)
    }
}

fn executor_id_for(mode: ExecutionMode, job_type: JobType, index: usize) -> String {
    match mode {
        ExecutionMode::Docker => DockerExecutor::container_name(job_type, index),
        _ => format!("{mode}-{job_type}-{index}-{}", short_uuid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerRuntimeConfig;
    use crate::pool::executor::{InProcessExecutor, LaunchedWorker};
    use crate::store::model::{Job, JobStatus, NewJob};
    use crate::store::traits::LocalQueue;
    use crate::worker::{Converter, ExecutionContext, JobHandler};
    use serde_json::json;

    async fn pool(dir: &Path, reuse: bool, count: usize) -> Arc<WorkerPoolManager> {
        let store = JobStore::new_memory().await.unwrap();
        let queue = Arc::new(LocalQueue::new(store.clone()));
        let runtime = WorkerRuntimeConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let executor = InProcessExecutor::new(queue, dir).with_runtime(runtime);
        let config = PoolConfig {
            default_execution_mode: ExecutionMode::InProcess,
            default_worker_count: count,
            reuse_workers: reuse,
            startup_timeout: 5,
            state_file: dir.join("state.json"),
            ..Default::default()
        };
        Arc::new(
            WorkerPoolManager::new(config, store, dir.join("jobs.db"))
                .with_executor(Arc::new(executor)),
        )
    }

    #[tokio::test]
    async fn start_spawns_configured_count_and_saves_state() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), true, 2).await;

        let started = pool.start(&[JobType::PlantUml]).await.unwrap();
        assert_eq!(started.len(), 2);
        assert!(started.iter().all(|w| w.db_worker_id.is_some()));

        let state = StateFile::new(dir.path().join("state.json")).load().await.unwrap();
        assert_eq!(state.workers.len(), 2);

        let status = pool.status().await.unwrap();
        let counts = status.health_counts();
        assert_eq!(counts[&JobType::PlantUml][&WorkerStatus::Idle], 2);

        assert_eq!(pool.stop().await.unwrap(), 2);
        assert!(StateFile::new(dir.path().join("state.json")).load().await.is_none());
        let dead = pool.registry().discover(Some(WorkerStatus::Dead)).await.unwrap();
        assert_eq!(dead.len(), 2);
    }

    #[tokio::test]
    async fn reuse_spawns_only_the_shortfall() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), true, 2).await;
        pool.registry()
            .register(JobType::Notebook, "external-1", ExecutionMode::Direct)
            .await
            .unwrap();

        let started = pool.start(&[JobType::Notebook]).await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].index, 1);

        // Already at target.
        assert!(pool.start(&[JobType::Notebook]).await.unwrap().is_empty());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn fresh_policy_always_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), false, 1).await;
        pool.registry()
            .register(JobType::DrawIo, "external-1", ExecutionMode::Direct)
            .await
            .unwrap();
        assert_eq!(pool.start(&[JobType::DrawIo]).await.unwrap().len(), 1);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_executor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new_memory().await.unwrap();
        let config = PoolConfig {
            state_file: dir.path().join("state.json"),
            ..Default::default()
        };
        let pool = WorkerPoolManager::new(config, store, dir.path().join("jobs.db"));
        let err = pool.start(&[JobType::Notebook]).await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::NoExecutor(_))));
        assert!(pool.registry().discover(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_check_restarts_dead_worker() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), true, 1).await;
        let started = pool.start(&[JobType::PlantUml]).await.unwrap();
        let old = started[0].clone();

        pool.registry()
            .set_status(old.db_worker_id.unwrap(), WorkerStatus::Dead)
            .await
            .unwrap();

        let report = pool.health_check().await.unwrap();
        assert_eq!(report.restarted, vec![old.executor_id.clone()]);

        let managed = pool.managed().await;
        assert_eq!(managed.len(), 1);
        assert_ne!(managed[0].executor_id, old.executor_id);
        let row = pool
            .registry()
            .get(managed[0].db_worker_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, WorkerStatus::Idle);

        // A healthy pool needs nothing.
        assert_eq!(pool.health_check().await.unwrap().restarted.len(), 0);
        pool.stop().await.unwrap();
    }

    /// Sleeps through the job, then writes a marker output.
    #[derive(Default)]
    struct Lengthy {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl JobHandler for Lengthy {
        async fn convert(
            &self,
            _ctx: &ExecutionContext,
            _job: &Job,
            output: &Path,
        ) -> Result<Option<serde_json::Value>, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(800)).await;
            tokio::fs::write(output, "done")
                .await
                .map_err(|e| crate::error::WorkerError::Conversion(e.to_string()))?;
            Ok(None)
        }
    }

    /// Pool whose single worker runs `Lengthy`, with a sub-second dead threshold.
    async fn lengthy_pool(
        dir: &Path,
        heartbeat_interval: Duration,
    ) -> (Arc<WorkerPoolManager>, JobStore, Arc<Lengthy>) {
        let store = JobStore::new_memory().await.unwrap();
        let queue = Arc::new(LocalQueue::new(store.clone()));
        let handler = Arc::new(Lengthy::default());
        let shared = Arc::clone(&handler);
        let runtime = WorkerRuntimeConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval,
            ..Default::default()
        };
        let executor = InProcessExecutor::new(queue, dir)
            .with_runtime(runtime)
            .with_converters(move |_| Converter::Custom(Arc::clone(&shared) as Arc<dyn JobHandler>));
        let config = PoolConfig {
            default_execution_mode: ExecutionMode::InProcess,
            default_worker_count: 1,
            startup_timeout: 5,
            state_file: dir.join("state.json"),
            ..Default::default()
        };
        let thresholds = HealthThresholds {
            hung_after: Duration::from_millis(100),
            dead_after: Duration::from_millis(300),
            cleanup_after: Duration::from_secs(60),
            hung_job_reset: Duration::from_secs(60),
        };
        let pool = WorkerPoolManager::new(config, store.clone(), dir.join("jobs.db"))
            .with_executor(Arc::new(executor))
            .with_thresholds(thresholds);
        (Arc::new(pool), store, handler)
    }

    async fn enqueue_one(store: &JobStore) -> i64 {
        store
            .enqueue(NewJob::new(JobType::PlantUml, "a.pu", "img/a.png", "h", json!({})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn job_longer_than_dead_threshold_keeps_its_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, store, handler) = lengthy_pool(dir.path(), Duration::from_millis(50)).await;
        let started = pool.start(&[JobType::PlantUml]).await.unwrap();
        let id = enqueue_one(&store).await;

        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let health = pool.health_check().await.unwrap();
            assert!(health.restarted.is_empty(), "live worker restarted mid-job");
            let cleanup = pool.cleanup_stale().await.unwrap();
            assert!(cleanup.marked_dead.is_empty());
            assert!(cleanup.reset_orphaned.is_empty());
            if store.get_job(id).await.unwrap().unwrap().status == JobStatus::Completed {
                break;
            }
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.managed().await[0].executor_id, started[0].executor_id);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn silent_busy_worker_is_left_draining() {
        let dir = tempfile::tempdir().unwrap();
        // Heartbeats effectively off once the job starts.
        let (pool, store, handler) = lengthy_pool(dir.path(), Duration::from_secs(60)).await;
        let started = pool.start(&[JobType::PlantUml]).await.unwrap();
        let worker_id = started[0].db_worker_id.unwrap();
        let id = enqueue_one(&store).await;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let row = pool.registry().get(worker_id).await.unwrap().unwrap();
        assert_eq!(row.status, WorkerStatus::Busy);

        let health = pool.health_check().await.unwrap();
        assert!(health.restarted.is_empty());
        assert_eq!(health.hung, vec![worker_id]);
        assert!(health.reset_jobs.is_empty());

        loop {
            if store.get_job(id).await.unwrap().unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        pool.stop().await.unwrap();
    }

    /// Executor that never produces a working worker.
    struct Stubborn {
        fail_start: bool,
        stops: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WorkerExecutor for Stubborn {
        fn mode(&self) -> ExecutionMode {
            ExecutionMode::InProcess
        }

        async fn start(&self, launch: &WorkerLaunch) -> Result<LaunchedWorker, PoolError> {
            if self.fail_start {
                return Err(PoolError::Executor {
                    mode: "in_process".into(),
                    reason: "no capacity".into(),
                });
            }
            Ok(LaunchedWorker {
                executor_id: launch.executor_id.clone(),
                pid: None,
            })
        }

        async fn stop(&self, _executor_id: &str, _pid: Option<u32>) -> Result<bool, PoolError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Err(PoolError::Executor {
                mode: "in_process".into(),
                reason: "already gone".into(),
            })
        }

        async fn is_running(&self, _executor_id: &str, _pid: Option<u32>) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn failed_startup_leaves_no_registry_rows() {
        for fail_start in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let store = JobStore::new_memory().await.unwrap();
            let executor = Arc::new(Stubborn {
                fail_start,
                stops: std::sync::atomic::AtomicUsize::new(0),
            });
            let config = PoolConfig {
                default_execution_mode: ExecutionMode::InProcess,
                default_worker_count: 1,
                startup_timeout: 1,
                state_file: dir.path().join("state.json"),
                ..Default::default()
            };
            let pool = WorkerPoolManager::new(config, store, dir.path().join("jobs.db"))
                .with_executor(Arc::clone(&executor) as Arc<dyn WorkerExecutor>);

            let err = pool.start(&[JobType::DrawIo]).await.unwrap_err();
            if fail_start {
                assert!(matches!(err, Error::Pool(PoolError::Executor { .. })));
                assert_eq!(executor.stops.load(Ordering::SeqCst), 0);
            } else {
                assert!(matches!(err, Error::Pool(PoolError::StartupTimeout { .. })));
                // The stop error is logged, not raised over the startup error.
                assert_eq!(executor.stops.load(Ordering::SeqCst), 1);
            }
            assert!(pool.registry().discover(None).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn stop_from_state_rejects_other_database() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path(), true, 1).await;
        StateFile::new(dir.path().join("state.json"))
            .save(&PoolState::new(dir.path().join("other.db"), vec![]))
            .await
            .unwrap();
        let err = pool.stop_from_state().await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::StateMismatch { .. })));
    }
}
