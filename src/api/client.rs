//! [`JobQueue`] over HTTP, for workers running in containers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::*;
use crate::error::{ApiError, Error};
use crate::store::cache::ExecutionKey;
use crate::store::model::{
    CacheEntry, ExecutionMode, Job, JobOutcome, JobType, ReportedStatus, WorkerStatus,
};
use crate::store::traits::JobQueue;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff for the first contact with the API, which may still be starting.
#[derive(Debug, Clone, Copy)]
pub struct RegistrationRetry {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RegistrationRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_secs(1),
            factor: 1.5,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RegistrationRetry {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Client for the worker API served by `api::server`.
#[derive(Clone)]
pub struct RemoteQueue {
    client: reqwest::Client,
    base_url: String,
    retry: RegistrationRetry,
}

impl RemoteQueue {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RegistrationRetry::default(),
        })
    }

    pub fn with_registration_retry(mut self, retry: RegistrationRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        decode(resp).await
    }

    /// Whether the API answers its health check.
    pub async fn is_healthy(&self) -> bool {
        self.get::<serde_json::Value>("/health").await.is_ok()
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        return Err(ApiError::Status {
            status: status.as_u16(),
            body,
        });
    }
    resp.json::<T>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Connection problems and server errors may clear up; rejected requests won't.
fn is_transient(err: &ApiError) -> bool {
    match err {
        ApiError::Transport(_) => true,
        ApiError::Status { status, .. } => *status >= 500,
        ApiError::Decode(_) => false,
    }
}

#[async_trait]
impl JobQueue for RemoteQueue {
    async fn register_worker(
        &self,
        worker_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
    ) -> Result<i64, Error> {
        let body = RegisterRequest {
            worker_type,
            executor_id: executor_id.to_string(),
            execution_mode: mode,
        };
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .post::<_, RegisterResponse>("/api/worker/register", &body)
                .await
            {
                Ok(resp) => {
                    info!(worker_id = resp.worker_id, url = %self.base_url, "Registered with worker API");
                    return Ok(resp.worker_id);
                }
                Err(e) if attempt < attempts && is_transient(&e) => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, attempts, delay = ?delay, "Worker API not reachable: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn activate_worker(&self, worker_id: i64) -> Result<(), Error> {
        Ok(self
            .post("/api/worker/activate", &WorkerRef { worker_id })
            .await?)
    }

    async fn heartbeat(
        &self,
        worker_id: i64,
        cpu: Option<f64>,
        mem: Option<f64>,
    ) -> Result<(), Error> {
        let body = HeartbeatRequest {
            worker_id,
            cpu_percent: cpu,
            memory_mb: mem,
        };
        Ok(self.post("/api/worker/heartbeat", &body).await?)
    }

    async fn set_worker_status(&self, worker_id: i64, status: WorkerStatus) -> Result<(), Error> {
        Ok(self
            .post("/api/worker/status", &StatusRequest { worker_id, status })
            .await?)
    }

    async fn unregister_worker(&self, worker_id: i64, reason: &str) -> Result<(), Error> {
        let body = UnregisterRequest {
            worker_id,
            reason: reason.to_string(),
        };
        Ok(self.post("/api/worker/unregister", &body).await?)
    }

    async fn record_job_outcome(
        &self,
        worker_id: i64,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), Error> {
        let body = StatsRequest {
            success,
            elapsed_secs: elapsed.as_secs_f64(),
        };
        Ok(self
            .post(&format!("/api/worker/{worker_id}/stats"), &body)
            .await?)
    }

    async fn claim_next(&self, job_type: JobType, worker_id: i64) -> Result<Option<Job>, Error> {
        let job: Option<Job> = self
            .post("/api/worker/jobs/claim", &ClaimRequest { job_type, worker_id })
            .await?;
        if let Some(job) = &job {
            debug!(job_id = job.id, worker_id, "Claimed job over HTTP");
        }
        Ok(job)
    }

    async fn report_status(
        &self,
        job_id: i64,
        outcome: &JobOutcome,
    ) -> Result<ReportedStatus, Error> {
        Ok(self
            .post(&format!("/api/worker/jobs/{job_id}/status"), outcome)
            .await?)
    }

    async fn is_cancelled(&self, job_id: i64) -> Result<bool, Error> {
        let resp: CancelledResponse = self
            .get(&format!("/api/worker/jobs/{job_id}/cancelled"))
            .await?;
        Ok(resp.cancelled)
    }

    async fn get_cached(
        &self,
        output_file: &str,
        content_hash: &str,
    ) -> Result<Option<CacheEntry>, Error> {
        let body = CacheLookup {
            output_file: output_file.to_string(),
            content_hash: content_hash.to_string(),
        };
        Ok(self.post("/api/worker/cache/get", &body).await?)
    }

    async fn put_cached(
        &self,
        output_file: &str,
        content_hash: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), Error> {
        let body = CacheStore {
            output_file: output_file.to_string(),
            content_hash: content_hash.to_string(),
            metadata: metadata.clone(),
        };
        Ok(self.post("/api/worker/cache/put", &body).await?)
    }

    async fn get_executed(&self, key: &ExecutionKey) -> Result<Option<Vec<u8>>, Error> {
        let resp: ExecutedResponse = self.post("/api/worker/executed/get", key).await?;
        Ok(resp.notebook)
    }

    async fn put_executed(&self, key: &ExecutionKey, notebook: &[u8]) -> Result<(), Error> {
        let body = ExecutedStore {
            key: key.clone(),
            notebook: notebook.to_vec(),
        };
        Ok(self.post("/api/worker/executed/put", &body).await?)
    }
}
