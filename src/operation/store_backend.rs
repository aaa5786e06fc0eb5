//! Backend that turns submissions into job-store rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::HealthThresholds;
use crate::error::OperationError;
use crate::operation::backend::{Backend, CompletionReport, FailedJob, copy_local, delete_local};
use crate::operation::{CopySpec, Submission};
use crate::store::model::{JobFailure, JobStatus, JobType, NewJob};
use crate::store::{JobStore, WorkerRegistry};

/// Default limit for `wait_for_completion`.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(1200); // 20 minutes

/// How often waiting requeues jobs held by dead workers.
const ORPHAN_SWEEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct ActiveJob {
    job_type: JobType,
    input_file: String,
    output_file: String,
    correlation_id: Option<String>,
}

/// Enqueues each submission and polls the store for its outcome.
pub struct StoreBackend {
    store: JobStore,
    registry: WorkerRegistry,
    workspace: PathBuf,
    active: Mutex<HashMap<i64, ActiveJob>>,
    poll_interval: Duration,
    max_wait: Duration,
    skip_worker_check: bool,
    ignore_cache: bool,
    thresholds: HealthThresholds,
}

impl StoreBackend {
    pub fn new(store: JobStore, workspace: impl Into<PathBuf>) -> Self {
        let registry = store.registry();
        Self {
            store,
            registry,
            workspace: workspace.into(),
            active: Mutex::new(HashMap::new()),
            poll_interval: Duration::from_millis(500),
            max_wait: DEFAULT_MAX_WAIT,
            skip_worker_check: false,
            ignore_cache: false,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Enqueue without checking that a worker of the type is alive.
    pub fn skip_worker_check(mut self, skip: bool) -> Self {
        self.skip_worker_check = skip;
        self
    }

    /// Always enqueue, even when a cached result exists.
    pub fn ignore_cache(mut self, ignore: bool) -> Self {
        self.ignore_cache = ignore;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Jobs submitted and not yet observed as finished.
    pub fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<i64, ActiveJob>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Flag every job for `input_file` as cancelled and stop tracking them.
    ///
    /// Used when a watched source changes and its old jobs are obsolete.
    pub async fn cancel_jobs_for_file(&self, input_file: &str) -> Result<usize, OperationError> {
        let ids = self
            .store
            .cancel_for_input(input_file, "watch_mode")
            .await?;
        let mut active = self.lock_active();
        for id in &ids {
            active.remove(id);
        }
        if !ids.is_empty() {
            info!(input_file, count = ids.len(), "Cancelled jobs for changed file");
        }
        Ok(ids.len())
    }

    async fn cached(&self, submission: &Submission) -> Result<bool, OperationError> {
        let hit = self
            .store
            .get_cached(&submission.output_file, &submission.content_hash)
            .await?;
        if hit.is_none() {
            return Ok(false);
        }
        let output = self.resolve(&submission.output_file);
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            debug!(output = %submission.output_file, "Cache hit, skipping submission");
            Ok(true)
        } else {
            warn!(output = %output.display(), "Cached result has no output file, resubmitting");
            Ok(false)
        }
    }
}

#[async_trait]
impl Backend for StoreBackend {
    async fn execute_operation(&self, submission: &Submission) -> Result<(), OperationError> {
        let job_type = submission.job_type()?;

        if !self.ignore_cache && self.cached(submission).await? {
            return Ok(());
        }

        if !self.skip_worker_check {
            let available = self
                .registry
                .healthy_of_type(job_type, &self.thresholds)
                .await?
                .len();
            if available == 0 {
                return Err(OperationError::NoWorkers {
                    job_type: job_type.to_string(),
                });
            }
            debug!(%job_type, available, "Workers available");
        }

        let mut job = NewJob::new(
            job_type,
            submission.input_file.clone(),
            submission.output_file.clone(),
            submission.content_hash.clone(),
            submission.payload.clone(),
        )
        .with_priority(submission.priority);
        if let Some(id) = &submission.correlation_id {
            job = job.with_correlation_id(id.clone());
        }
        let job_id = self.store.enqueue(job).await?;

        self.lock_active().insert(
            job_id,
            ActiveJob {
                job_type,
                input_file: submission.input_file.clone(),
                output_file: submission.output_file.clone(),
                correlation_id: submission.correlation_id.clone(),
            },
        );
        debug!(
            job_id,
            %job_type,
            input = %submission.input_file,
            output = %submission.output_file,
            "Job submitted"
        );
        Ok(())
    }

    async fn copy_file(&self, copy: &CopySpec) -> Result<(), OperationError> {
        let source = self.resolve(&copy.source.to_string_lossy());
        let target = self.resolve(&copy.target.to_string_lossy());
        copy_local(&source, &target).await
    }

    async fn wait_for_completion(
        &self,
        timeout: Option<Duration>,
    ) -> Result<CompletionReport, OperationError> {
        let max_wait = timeout.unwrap_or(self.max_wait);
        let mut report = CompletionReport::default();
        if self.active_count() == 0 {
            return Ok(report);
        }
        info!(jobs = self.active_count(), "Waiting for jobs to complete");

        let start = Instant::now();
        let mut last_sweep = start;
        loop {
            if last_sweep.elapsed() >= ORPHAN_SWEEP {
                match self.store.reset_orphaned().await {
                    Ok(ids) if !ids.is_empty() => {
                        info!(count = ids.len(), "Reset jobs from dead workers")
                    }
                    Ok(_) => {}
                    Err(e) => error!("Orphaned job sweep failed: {e}"),
                }
                last_sweep = Instant::now();
            }

            let ids: Vec<i64> = self.lock_active().keys().copied().collect();
            let progress = self.store.statuses(&ids).await?;

            let mut finished = Vec::new();
            for id in ids {
                let Some(p) = progress.get(&id) else {
                    warn!(job_id = id, "Job disappeared from the store");
                    finished.push(id);
                    continue;
                };
                match p.status {
                    JobStatus::Completed => {
                        report.completed += 1;
                        finished.push(id);
                    }
                    JobStatus::Failed => {
                        finished.push(id);
                        if let Some(job) = self.lock_active().get(&id).cloned() {
                            let failure = p
                                .error
                                .as_deref()
                                .map(|raw| {
                                    serde_json::from_str(raw)
                                        .unwrap_or_else(|_| JobFailure::plain(raw, job.job_type))
                                })
                                .unwrap_or_else(|| JobFailure::plain("unknown error", job.job_type));
                            error!(
                                job_id = id,
                                input = %job.input_file,
                                category = %failure.category,
                                "Job failed: {}",
                                failure.error_message
                            );
                            report.failed.push(FailedJob {
                                job_id: Some(id),
                                correlation_id: job.correlation_id,
                                job_type: job.job_type,
                                input_file: job.input_file,
                                output_file: job.output_file,
                                failure,
                            });
                        }
                    }
                    JobStatus::Pending | JobStatus::Processing if p.cancelled => {
                        report.cancelled += 1;
                        finished.push(id);
                    }
                    JobStatus::Pending | JobStatus::Processing => {}
                }
            }
            {
                let mut active = self.lock_active();
                for id in finished {
                    active.remove(&id);
                }
                if active.is_empty() {
                    break;
                }
            }

            if start.elapsed() > max_wait {
                warn!(pending = self.active_count(), "Jobs did not complete in time");
                return Err(OperationError::Timeout(max_wait));
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        if report.is_success() {
            info!(completed = report.completed, "All jobs completed");
        } else {
            error!(failed = report.failed.len(), completed = report.completed, "Some jobs failed");
        }
        Ok(report)
    }

    async fn delete_file(&self, path: &Path) -> Result<(), OperationError> {
        delete_local(&self.resolve(&path.to_string_lossy())).await
    }
}
