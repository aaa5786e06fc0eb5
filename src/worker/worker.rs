//! The worker poll/execute/report loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::MissedTickBehavior;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::WorkerRuntimeConfig;
use crate::error::{Error, WorkerError};
use crate::store::model::{
    ErrorCategory, ExecutionMode, Job, JobFailure, JobOutcome, JobType, WorkerStatus,
};
use crate::store::traits::JobQueue;
use crate::worker::context::ExecutionContext;
use crate::worker::converter::Converter;
use crate::worker::failure;
use crate::worker::state::{Lifecycle, WorkerState};

/// Counters for one worker run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub busy_time: Duration,
}

/// How one claimed job ended, before it is reported.
enum Execution {
    Converted(Option<serde_json::Value>),
    CacheHit(serde_json::Value),
    Cancelled(&'static str),
    Failed(JobFailure),
}

/// A single conversion worker bound to one job type.
pub struct Worker {
    worker_id: i64,
    job_type: JobType,
    queue: Arc<dyn JobQueue>,
    converter: Converter,
    config: WorkerRuntimeConfig,
    ctx: ExecutionContext,
    lifecycle: Lifecycle,
    stop: Arc<AtomicBool>,
    last_heartbeat: Option<Instant>,
    stats: WorkerStats,
}

impl Worker {
    /// Register a fresh identity with the queue, retrying with backoff.
    pub async fn register(
        queue: Arc<dyn JobQueue>,
        job_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
        workspace: impl Into<PathBuf>,
        config: WorkerRuntimeConfig,
    ) -> Result<Self, Error> {
        let attempts = config.registration_retries.max(1);
        let mut delay = config.registration_initial_delay;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match queue.register_worker(job_type, executor_id, mode).await {
                Ok(worker_id) => {
                    info!(worker_id, %job_type, executor_id, "Worker registered");
                    return Ok(Self::build(queue, job_type, worker_id, workspace.into(), config));
                }
                Err(e) => {
                    warn!(attempt, attempts, executor_id, "Worker registration failed: {e}");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(with_jitter(delay)).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(WorkerError::Registration {
            attempts,
            reason: last_error,
        }
        .into())
    }

    /// Adopt a row the supervisor registered on this worker's behalf.
    pub async fn attach(
        queue: Arc<dyn JobQueue>,
        job_type: JobType,
        worker_id: i64,
        workspace: impl Into<PathBuf>,
        config: WorkerRuntimeConfig,
    ) -> Result<Self, Error> {
        queue.activate_worker(worker_id).await?;
        info!(worker_id, %job_type, "Worker activated");
        Ok(Self::build(queue, job_type, worker_id, workspace.into(), config))
    }

    fn build(
        queue: Arc<dyn JobQueue>,
        job_type: JobType,
        worker_id: i64,
        workspace: PathBuf,
        config: WorkerRuntimeConfig,
    ) -> Self {
        let ctx = ExecutionContext::new(worker_id, job_type, Arc::clone(&queue), workspace);
        Self {
            worker_id,
            job_type,
            queue,
            converter: Converter::for_job_type(job_type),
            config,
            ctx,
            lifecycle: Lifecycle::new(),
            stop: Arc::new(AtomicBool::new(false)),
            last_heartbeat: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn with_converter(mut self, converter: Converter) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_host_workspace(mut self, host: Option<PathBuf>) -> Self {
        self.ctx = self.ctx.with_host_workspace(host);
        self
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.state()
    }

    /// Flag that asks the loop to stop after the in-flight job.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Poll until stopped or crashed.
    pub async fn run(mut self) -> Result<WorkerStats, Error> {
        info!(worker_id = self.worker_id, job_type = %self.job_type, "Worker starting");
        self.lifecycle.transition_to(WorkerState::Polling, None)?;
        self.heartbeat(true).await;

        let mut consecutive_errors = 0u32;
        while !self.stopping() {
            match self.queue.claim_next(self.job_type, self.worker_id).await {
                Ok(Some(job)) => {
                    consecutive_errors = 0;
                    self.process(job).await?;
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    self.heartbeat(false).await;
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        worker_id = self.worker_id,
                        consecutive_errors,
                        "Claim failed: {e}"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        let reason = format!("queue unavailable: {e}");
                        error!(worker_id = self.worker_id, "Worker crashed: {reason}");
                        self.lifecycle.crash(reason.clone());
                        return Err(WorkerError::Crashed {
                            worker_id: self.worker_id,
                            reason,
                        }
                        .into());
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        self.lifecycle
            .transition_to(WorkerState::Stopping, Some("stop requested".into()))?;
        if let Err(e) = self.queue.unregister_worker(self.worker_id, "shutdown").await {
            warn!(worker_id = self.worker_id, "Unregister failed: {e}");
        }
        self.lifecycle.transition_to(WorkerState::Stopped, None)?;
        info!(
            worker_id = self.worker_id,
            completed = self.stats.completed,
            failed = self.stats.failed,
            "Worker stopped"
        );
        Ok(self.stats)
    }

    /// Throttled heartbeat; `force` skips the throttle.
    async fn heartbeat(&mut self, force: bool) {
        let due = self
            .last_heartbeat
            .is_none_or(|t| t.elapsed() >= self.config.heartbeat_interval);
        if !force && !due {
            return;
        }
        match self.queue.heartbeat(self.worker_id, None, None).await {
            Ok(()) => self.last_heartbeat = Some(Instant::now()),
            Err(e) => warn!(worker_id = self.worker_id, "Heartbeat failed: {e}"),
        }
    }

    async fn set_status(&self, status: WorkerStatus) {
        if let Err(e) = self.queue.set_worker_status(self.worker_id, status).await {
            warn!(worker_id = self.worker_id, %status, "Status update failed: {e}");
        }
    }

    /// Whether the job was flagged; store errors count as "not cancelled".
    async fn cancelled(&self, job: &Job) -> bool {
        match self.queue.is_cancelled(job.id).await {
            Ok(flag) => flag,
            Err(e) => {
                warn!(job_id = job.id, "Cancellation check failed: {e}");
                false
            }
        }
    }

    async fn process(&mut self, job: Job) -> Result<(), Error> {
        let started = Instant::now();
        self.lifecycle
            .transition_to(WorkerState::Executing, Some(format!("job {}", job.id)))?;
        let seq = self.ctx.begin_job();
        info!(
            worker_id = self.worker_id,
            job_id = job.id,
            seq,
            input = %job.input_file,
            output = %job.output_file,
            "Processing job"
        );

        let execution = if self.cancelled(&job).await {
            Execution::Cancelled("after claim")
        } else {
            self.set_status(WorkerStatus::Busy).await;
            self.execute(&job, started).await
        };
        let elapsed = started.elapsed();

        match execution {
            Execution::Cancelled(at) => {
                // The row stays as-is for operator inspection.
                info!(job_id = job.id, checkpoint = at, "Job cancelled, abandoning");
                self.stats.cancelled += 1;
            }
            Execution::CacheHit(result) => {
                self.stats.cache_hits += 1;
                self.finish(&job, JobOutcome::Completed { result: Some(result) }, elapsed)
                    .await;
            }
            Execution::Converted(result) => {
                self.finish(&job, JobOutcome::Completed { result }, elapsed)
                    .await;
            }
            Execution::Failed(failure) => {
                warn!(
                    job_id = job.id,
                    category = %failure.category,
                    "Job failed: {}",
                    failure.error_message
                );
                self.finish(&job, JobOutcome::Failed { failure }, elapsed)
                    .await;
            }
        }

        self.ctx.discard_scratch(&job).await;
        self.stats.busy_time += elapsed;
        self.set_status(WorkerStatus::Idle).await;
        self.heartbeat(true).await;
        if self.stopping() {
            return Ok(());
        }
        self.lifecycle.transition_to(WorkerState::Polling, None)?;
        Ok(())
    }

    async fn finish(&mut self, job: &Job, outcome: JobOutcome, elapsed: Duration) {
        let success = matches!(outcome, JobOutcome::Completed { .. });
        match self.queue.report_status(job.id, &outcome).await {
            Ok(reported) => debug!(job_id = job.id, ?reported, "Job reported"),
            // A row reset by orphan recovery is no longer ours to report.
            Err(e) => warn!(job_id = job.id, "Report failed: {e}"),
        }
        if success {
            self.stats.completed += 1;
        } else {
            self.stats.failed += 1;
        }
        if let Err(e) = self
            .queue
            .record_job_outcome(self.worker_id, success, elapsed)
            .await
        {
            debug!(worker_id = self.worker_id, "Stats update failed: {e}");
        }
    }

    async fn execute(&self, job: &Job, started: Instant) -> Execution {
        match self.queue.get_cached(&job.output_file, &job.content_hash).await {
            Ok(Some(entry)) if self.ctx.resolve(&job.output_file).exists() => {
                debug!(job_id = job.id, "Result cache hit");
                return Execution::CacheHit(entry.result_metadata);
            }
            Ok(_) => {}
            Err(e) => debug!(job_id = job.id, "Cache lookup failed: {e}"),
        }

        if self.cancelled(job).await {
            return Execution::Cancelled("after cache check");
        }

        let staged = match self.ctx.staged_output(job).await {
            Ok(p) => p,
            Err(e) => {
                let err = Error::from(e);
                return Execution::Failed(failure::from_error(job, &err, started.elapsed()));
            }
        };

        let conversion = tokio::time::timeout(
            self.config.max_job_time,
            self.converter.convert(&self.ctx, job, &staged),
        );
        tokio::pin!(conversion);
        let deadline = shutdown_deadline(&self.stop, self.config.shutdown_timeout);
        tokio::pin!(deadline);
        // Keep the registry row fresh while a long conversion runs.
        let mut beat = tokio::time::interval(
            self.config.heartbeat_interval.max(Duration::from_millis(10)),
        );
        beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        beat.tick().await;
        let result = loop {
            tokio::select! {
                r = &mut conversion => break r,
                () = &mut deadline => {
                    return Execution::Failed(interrupted(job, started.elapsed()));
                }
                _ = beat.tick() => {
                    if let Err(e) = self.queue.heartbeat(self.worker_id, None, None).await {
                        debug!(worker_id = self.worker_id, job_id = job.id, "Heartbeat failed: {e}");
                    }
                }
            }
        };

        let metadata = match result {
            Err(_) => {
                return Execution::Failed(failure::timed_out(
                    job,
                    self.config.max_job_time,
                    started.elapsed(),
                ));
            }
            Ok(Err(e)) => {
                return Execution::Failed(failure::from_error(job, &e, started.elapsed()));
            }
            Ok(Ok(metadata)) => metadata,
        };

        if self.cancelled(job).await {
            return Execution::Cancelled("before writing output");
        }

        if let Err(e) = self.ctx.commit_output(job, &staged).await {
            let err = Error::from(e);
            return Execution::Failed(failure::from_error(job, &err, started.elapsed()));
        }

        let cached = metadata.clone().unwrap_or_else(|| serde_json::json!({}));
        if let Err(e) = self
            .queue
            .put_cached(&job.output_file, &job.content_hash, &cached)
            .await
        {
            warn!(job_id = job.id, "Caching result failed: {e}");
        }
        Execution::Converted(metadata)
    }
}

/// Resolves `grace` after the stop flag is raised; never resolves otherwise.
async fn shutdown_deadline(stop: &AtomicBool, grace: Duration) {
    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(grace).await;
}

fn interrupted(job: &Job, elapsed: Duration) -> JobFailure {
    JobFailure {
        error_message: "Worker stopped before the job finished".into(),
        error_class: "ShutdownError".into(),
        traceback: None,
        processing_time: Some(elapsed.as_secs_f64()),
        worker_type: job.job_type,
        category: ErrorCategory::Infrastructure,
        actionable_guidance: "The job is retried by another worker if attempts remain".into(),
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let spread = (delay.as_millis() as u64 / 4).max(1);
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
