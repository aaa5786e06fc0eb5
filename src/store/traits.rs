//! The worker-facing queue interface.
//!
//! Workers talk to the queue only through [`JobQueue`]. [`LocalQueue`] opens
//! the store file directly; `api::RemoteQueue` goes through the HTTP adapter
//! for workers that cannot reach the file.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;
use crate::store::cache::ExecutionKey;
use crate::store::jobs::JobStore;
use crate::store::model::{
    CacheEntry, ExecutionMode, Job, JobOutcome, JobType, ReportedStatus, WorkerStatus,
};
use crate::store::workers::WorkerRegistry;

#[async_trait]
pub trait JobQueue: Send + Sync {
    // ── Worker identity ─────────────────────────────────────────────

    /// Register a worker and return its id.
    async fn register_worker(
        &self,
        worker_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
    ) -> Result<i64, Error>;

    /// Mark a row created by the supervisor as alive.
    async fn activate_worker(&self, worker_id: i64) -> Result<(), Error>;

    /// Refresh liveness, with optional CPU and memory figures.
    async fn heartbeat(&self, worker_id: i64, cpu: Option<f64>, mem: Option<f64>)
    -> Result<(), Error>;

    async fn set_worker_status(&self, worker_id: i64, status: WorkerStatus) -> Result<(), Error>;

    /// Planned shutdown.
    async fn unregister_worker(&self, worker_id: i64, reason: &str) -> Result<(), Error>;

    /// Update the worker's counters after a job.
    async fn record_job_outcome(
        &self,
        worker_id: i64,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), Error>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Atomically claim the next pending job of this type.
    async fn claim_next(&self, job_type: JobType, worker_id: i64) -> Result<Option<Job>, Error>;

    /// Record how a claimed job ended.
    async fn report_status(&self, job_id: i64, outcome: &JobOutcome)
    -> Result<ReportedStatus, Error>;

    /// Whether the job was flagged for cancellation.
    async fn is_cancelled(&self, job_id: i64) -> Result<bool, Error>;

    // ── Caches ──────────────────────────────────────────────────────

    async fn get_cached(
        &self,
        output_file: &str,
        content_hash: &str,
    ) -> Result<Option<CacheEntry>, Error>;

    async fn put_cached(
        &self,
        output_file: &str,
        content_hash: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), Error>;

    async fn get_executed(&self, key: &ExecutionKey) -> Result<Option<Vec<u8>>, Error>;

    async fn put_executed(&self, key: &ExecutionKey, notebook: &[u8]) -> Result<(), Error>;
}

/// Queue backed directly by the store file.
#[derive(Clone)]
pub struct LocalQueue {
    store: JobStore,
    registry: WorkerRegistry,
}

impl LocalQueue {
    pub fn new(store: JobStore) -> Self {
        let registry = store.registry();
        Self { store, registry }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn register_worker(
        &self,
        worker_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
    ) -> Result<i64, Error> {
        let parent = i64::from(std::process::id());
        Ok(self
            .registry
            .register_with_parent(worker_type, executor_id, mode, Some(parent))
            .await?)
    }

    async fn activate_worker(&self, worker_id: i64) -> Result<(), Error> {
        Ok(self.registry.activate(worker_id).await?)
    }

    async fn heartbeat(
        &self,
        worker_id: i64,
        cpu: Option<f64>,
        mem: Option<f64>,
    ) -> Result<(), Error> {
        Ok(self.registry.heartbeat(worker_id, cpu, mem).await?)
    }

    async fn set_worker_status(&self, worker_id: i64, status: WorkerStatus) -> Result<(), Error> {
        Ok(self.registry.set_status(worker_id, status).await?)
    }

    async fn unregister_worker(&self, worker_id: i64, reason: &str) -> Result<(), Error> {
        Ok(self.registry.unregister(worker_id, reason).await?)
    }

    async fn record_job_outcome(
        &self,
        worker_id: i64,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), Error> {
        Ok(self
            .registry
            .record_job_outcome(worker_id, success, elapsed)
            .await?)
    }

    async fn claim_next(&self, job_type: JobType, worker_id: i64) -> Result<Option<Job>, Error> {
        Ok(self.store.claim_next(job_type, worker_id).await?)
    }

    async fn report_status(
        &self,
        job_id: i64,
        outcome: &JobOutcome,
    ) -> Result<ReportedStatus, Error> {
        self.store.report_status(job_id, outcome).await
    }

    async fn is_cancelled(&self, job_id: i64) -> Result<bool, Error> {
        self.store.is_cancelled(job_id).await
    }

    async fn get_cached(
        &self,
        output_file: &str,
        content_hash: &str,
    ) -> Result<Option<CacheEntry>, Error> {
        Ok(self.store.get_cached(output_file, content_hash).await?)
    }

    async fn put_cached(
        &self,
        output_file: &str,
        content_hash: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), Error> {
        Ok(self
            .store
            .put_cached(output_file, content_hash, metadata)
            .await?)
    }

    async fn get_executed(&self, key: &ExecutionKey) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.store.get_executed(key).await?)
    }

    async fn put_executed(&self, key: &ExecutionKey, notebook: &[u8]) -> Result<(), Error> {
        Ok(self.store.put_executed(key, notebook).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::NewJob;
    use std::sync::Arc;

    #[tokio::test]
    async fn local_queue_claims_through_trait_object() {
        let store = JobStore::new_memory().await.unwrap();
        let queue: Arc<dyn JobQueue> = Arc::new(LocalQueue::new(store.clone()));

        let worker = queue
            .register_worker(JobType::PlantUml, "w1", ExecutionMode::InProcess)
            .await
            .unwrap();
        let id = store
            .enqueue(NewJob::new(JobType::PlantUml, "a.pu", "a.png", "h", serde_json::json!({})))
            .await
            .unwrap();

        let job = queue.claim_next(JobType::PlantUml, worker).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert!(!queue.is_cancelled(id).await.unwrap());
        queue
            .report_status(id, &JobOutcome::Completed { result: None })
            .await
            .unwrap();

        let record = store.registry().get(worker).await.unwrap().unwrap();
        assert_eq!(record.parent_pid, Some(i64::from(std::process::id())));
    }
}
