//! Durable job queue with an atomic claim.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libsql::params;
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, Error, JobError};
use crate::store::libsql_backend::{
    LibSqlBackend, col_opt_i64, col_opt_text, fmt_ts, now_str, opt_text, parse_datetime,
    parse_optional_datetime, query_all,
};
use crate::store::model::{
    Job, JobOutcome, JobProgress, JobStatus, JobType, NewJob, QueueStats, ReportedStatus,
};
use crate::store::workers::WorkerRegistry;

pub(crate) const JOB_COLUMNS: &str = "id, job_type, status, priority, input_file, output_file, content_hash, payload, correlation_id, created_at, started_at, completed_at, worker_id, attempts, max_attempts, error, traceback, result, cancelled_at, cancelled_by";

/// Persisted job queue plus the results cache.
///
/// Cheap to clone; clones share the underlying connection.
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<LibSqlBackend>,
}

impl JobStore {
    pub fn new(backend: Arc<LibSqlBackend>) -> Self {
        Self { backend }
    }

    /// Open (or create) a store file.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Ok(Self::new(Arc::new(LibSqlBackend::new_local(path).await?)))
    }

    /// In-memory store (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        Ok(Self::new(Arc::new(LibSqlBackend::new_memory().await?)))
    }

    /// Worker registry sharing this store's connection.
    pub fn registry(&self) -> WorkerRegistry {
        WorkerRegistry::new(Arc::clone(&self.backend))
    }

    pub(crate) fn backend(&self) -> &LibSqlBackend {
        &self.backend
    }

    pub fn path(&self) -> Option<&Path> {
        self.backend.path()
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Add a pending job and return its id.
    pub async fn enqueue(&self, job: NewJob) -> Result<i64, DatabaseError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;
        let conn = self.backend.conn();

        let id = self
            .backend
            .with_retry("enqueue", || {
                let payload = payload.clone();
                let job = &job;
                async move {
                    let mut rows = conn
                        .query(
                            "INSERT INTO jobs (job_type, status, priority, input_file, output_file, content_hash, payload, correlation_id, created_at, max_attempts)
                             VALUES (?1, 'pending', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                             RETURNING id",
                            params![
                                job.job_type.as_str(),
                                job.priority,
                                job.input_file.as_str(),
                                job.output_file.as_str(),
                                job.content_hash.as_str(),
                                payload,
                                opt_text(job.correlation_id.as_deref()),
                                now_str(),
                                job.max_attempts,
                            ],
                        )
                        .await
                        .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;
                    let row = rows
                        .next()
                        .await
                        .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?
                        .ok_or_else(|| DatabaseError::Query("enqueue: no id returned".into()))?;
                    row.get::<i64>(0)
                        .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))
                }
            })
            .await?;

        debug!(job_id = id, job_type = %job.job_type, input = %job.input_file, "Job enqueued");
        Ok(id)
    }

    /// Enqueue with a job type given by name, rejecting unknown names.
    pub async fn enqueue_named(
        &self,
        job_type: &str,
        input_file: &str,
        output_file: &str,
        content_hash: &str,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<i64, DatabaseError> {
        let job_type: JobType = job_type.parse()?;
        self.enqueue(
            NewJob::new(job_type, input_file, output_file, content_hash, payload)
                .with_priority(priority),
        )
        .await
    }

    // ── Claiming ────────────────────────────────────────────────────

    /// Atomically claim the next pending job of `job_type` for `worker_id`.
    ///
    /// Selection and the flip to `processing` happen in one statement, so
    /// concurrent callers (in this process or another one sharing the file)
    /// never receive the same row.
    pub async fn claim_next(
        &self,
        job_type: JobType,
        worker_id: i64,
    ) -> Result<Option<Job>, DatabaseError> {
        let conn = self.backend.conn();
        let sql = format!(
            "UPDATE jobs
             SET status = 'processing', worker_id = ?1, started_at = ?2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'pending' AND job_type = ?3 AND cancelled_at IS NULL
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        );

        let job = self
            .backend
            .with_retry("claim_next", || {
                let sql = sql.as_str();
                async move {
                    let mut rows = conn
                        .query(sql, params![worker_id, now_str(), job_type.as_str()])
                        .await
                        .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;
                    match rows.next().await {
                        Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
                        Ok(None) => Ok(None),
                        Err(e) => Err(DatabaseError::Query(format!("claim_next: {e}"))),
                    }
                }
            })
            .await?;

        if let Some(ref job) = job {
            debug!(job_id = job.id, worker_id, job_type = %job_type, "Job claimed");
        }
        Ok(job)
    }

    // ── Reporting ───────────────────────────────────────────────────

    /// Record how a claimed job ended.
    ///
    /// A failure increments `attempts`; while attempts remain the job goes
    /// back to `pending` with its claim cleared.
    pub async fn report_status(
        &self,
        job_id: i64,
        outcome: &JobOutcome,
    ) -> Result<ReportedStatus, Error> {
        let conn = self.backend.conn();

        let reported = match outcome {
            JobOutcome::Completed { result } => {
                let result_json = match result {
                    Some(v) => Some(serde_json::to_string(v).map_err(|e| {
                        DatabaseError::Serialization(format!("job result: {e}"))
                    })?),
                    None => None,
                };
                let changed = self
                    .backend
                    .with_retry("report_status", || {
                        let result_json = result_json.clone();
                        async move {
                            conn.execute(
                                "UPDATE jobs
                                 SET status = 'completed', completed_at = ?1, error = NULL,
                                     traceback = NULL, result = ?2
                                 WHERE id = ?3 AND status = 'processing'",
                                params![now_str(), opt_text(result_json.as_deref()), job_id],
                            )
                            .await
                            .map_err(|e| DatabaseError::Query(format!("report_status: {e}")))
                        }
                    })
                    .await?;
                if changed == 0 {
                    return Err(self.transition_error(job_id, JobStatus::Completed).await);
                }
                ReportedStatus::Completed
            }
            JobOutcome::Failed { failure } => {
                let error_json = serde_json::to_string(failure)
                    .map_err(|e| DatabaseError::Serialization(format!("job failure: {e}")))?;
                let traceback = failure.traceback.clone();
                let row = self
                    .backend
                    .with_retry("report_status", || {
                        let error_json = error_json.clone();
                        let traceback = traceback.clone();
                        async move {
                            let mut rows = conn
                                .query(
                                    "UPDATE jobs
                                     SET attempts = attempts + 1,
                                         error = ?1,
                                         traceback = ?2,
                                         status = CASE WHEN attempts + 1 < max_attempts
                                                       THEN 'pending' ELSE 'failed' END,
                                         worker_id = CASE WHEN attempts + 1 < max_attempts
                                                          THEN NULL ELSE worker_id END,
                                         started_at = CASE WHEN attempts + 1 < max_attempts
                                                           THEN NULL ELSE started_at END,
                                         completed_at = CASE WHEN attempts + 1 < max_attempts
                                                             THEN NULL ELSE ?3 END
                                     WHERE id = ?4 AND status = 'processing'
                                     RETURNING status, attempts",
                                    params![error_json, opt_text(traceback.as_deref()), now_str(), job_id],
                                )
                                .await
                                .map_err(|e| DatabaseError::Query(format!("report_status: {e}")))?;
                            match rows.next().await {
                                Ok(Some(row)) => {
                                    let status: String = row.get(0).map_err(|e| {
                                        DatabaseError::Query(format!("report_status: {e}"))
                                    })?;
                                    let attempts: i64 = row.get(1).map_err(|e| {
                                        DatabaseError::Query(format!("report_status: {e}"))
                                    })?;
                                    Ok(Some((status, attempts)))
                                }
                                Ok(None) => Ok(None),
                                Err(e) => Err(DatabaseError::Query(format!("report_status: {e}"))),
                            }
                        }
                    })
                    .await?;

                match row {
                    Some((status, attempts)) if status == "pending" => {
                        info!(job_id, attempts, "Job failed, requeued for retry");
                        ReportedStatus::Requeued { attempts }
                    }
                    Some((_, attempts)) => {
                        warn!(job_id, attempts, error = %failure.error_message, "Job failed permanently");
                        ReportedStatus::Failed { attempts }
                    }
                    None => return Err(self.transition_error(job_id, JobStatus::Failed).await),
                }
            }
        };
        Ok(reported)
    }

    async fn transition_error(&self, job_id: i64, target: JobStatus) -> Error {
        match self.get_job(job_id).await {
            Ok(Some(job)) => JobError::InvalidTransition {
                id: job_id,
                state: job.status.to_string(),
                target: target.to_string(),
            }
            .into(),
            Ok(None) => JobError::NotFound { id: job_id }.into(),
            Err(e) => e.into(),
        }
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Whether the job has been flagged for cancellation.
    pub async fn is_cancelled(&self, job_id: i64) -> Result<bool, Error> {
        let mut rows = self
            .backend
            .conn()
            .query(
                "SELECT cancelled_at IS NOT NULL FROM jobs WHERE id = ?1",
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_cancelled: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let flagged: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("is_cancelled: {e}")))?;
                Ok(flagged != 0)
            }
            Ok(None) => Err(JobError::NotFound { id: job_id }.into()),
            Err(e) => Err(DatabaseError::Query(format!("is_cancelled: {e}")).into()),
        }
    }

    /// Flag pending jobs, optionally only of one type and older than `min_age`.
    ///
    /// Rows stay in place; only `cancelled_at`/`cancelled_by` change.
    pub async fn cancel_pending(
        &self,
        job_type: Option<JobType>,
        min_age: Option<Duration>,
        cancelled_by: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = match min_age {
            Some(age) => opt_text(Some(&fmt_ts(
                Utc::now()
                    - chrono::Duration::from_std(age)
                        .map_err(|e| DatabaseError::Validation(format!("min_age: {e}")))?,
            ))),
            None => libsql::Value::Null,
        };
        let type_filter = opt_text(job_type.map(|t| t.as_str()));
        let conn = self.backend.conn();

        let ids = self
            .backend
            .with_retry("cancel_pending", || {
                let cutoff = cutoff.clone();
                let type_filter = type_filter.clone();
                async move {
                    query_all(
                        conn,
                        "cancel_pending",
                        "UPDATE jobs SET cancelled_at = ?1, cancelled_by = ?2
                         WHERE status = 'pending' AND cancelled_at IS NULL
                           AND (?3 IS NULL OR job_type = ?3)
                           AND (?4 IS NULL OR created_at <= ?4)
                         RETURNING id",
                        params![now_str(), cancelled_by, type_filter, cutoff],
                        |row| {
                            row.get::<i64>(0)
                                .map_err(|e| DatabaseError::Query(format!("cancel_pending: {e}")))
                        },
                    )
                    .await
                }
            })
            .await?;

        if !ids.is_empty() {
            info!(count = ids.len(), by = cancelled_by, "Cancelled pending jobs");
        }
        Ok(ids)
    }

    /// Flag every pending or processing job for an input file.
    ///
    /// Used when a source changes while its outputs are still queued; a
    /// worker holding one of these rows abandons it at its next checkpoint.
    pub async fn cancel_for_input(
        &self,
        input_file: &str,
        cancelled_by: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let conn = self.backend.conn();
        let ids = self
            .backend
            .with_retry("cancel_for_input", || async move {
                query_all(
                    conn,
                    "cancel_for_input",
                    "UPDATE jobs SET cancelled_at = ?1, cancelled_by = ?2
                     WHERE input_file = ?3 AND status IN ('pending', 'processing')
                       AND cancelled_at IS NULL
                     RETURNING id",
                    params![now_str(), cancelled_by, input_file],
                    |row| {
                        row.get::<i64>(0)
                            .map_err(|e| DatabaseError::Query(format!("cancel_for_input: {e}")))
                    },
                )
                .await
            })
            .await?;
        if !ids.is_empty() {
            info!(count = ids.len(), input = input_file, "Cancelled jobs for input file");
        }
        Ok(ids)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError> {
        let mut jobs = query_all(
            self.backend.conn(),
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
            row_to_job,
        )
        .await?;
        Ok(jobs.pop())
    }

    /// Jobs in `status`, oldest first. Cancelled rows are included and can
    /// be told apart via [`Job::display_status`].
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        query_all(
            self.backend.conn(),
            "list_by_status",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                 ORDER BY created_at ASC, id ASC LIMIT ?2"
            ),
            params![status.as_str(), limit as i64],
            row_to_job,
        )
        .await
    }

    /// Jobs flagged for cancellation that never reached a terminal state.
    pub async fn list_cancelled(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        query_all(
            self.backend.conn(),
            "list_cancelled",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE cancelled_at IS NOT NULL AND status IN ('pending', 'processing')
                 ORDER BY cancelled_at DESC LIMIT ?1"
            ),
            params![limit as i64],
            row_to_job,
        )
        .await
    }

    /// Status, error and cancellation flag for a batch of jobs in one query.
    pub async fn statuses(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, JobProgress>, DatabaseError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let rows = query_all(
            self.backend.conn(),
            "statuses",
            &format!(
                "SELECT id, status, error, cancelled_at IS NOT NULL FROM jobs WHERE id IN ({list})"
            ),
            (),
            |row| {
                let q = |e: libsql::Error| DatabaseError::Query(format!("statuses: {e}"));
                let id: i64 = row.get(0).map_err(q)?;
                let status: String = row.get(1).map_err(q)?;
                let error = col_opt_text(row, 2).map_err(q)?;
                let cancelled: i64 = row.get(3).map_err(q)?;
                Ok((
                    id,
                    JobProgress {
                        status: status.parse::<JobStatus>()?,
                        error,
                        cancelled: cancelled != 0,
                    },
                ))
            },
        )
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Counts per status, with flagged non-terminal rows counted as cancelled.
    pub async fn counts(&self) -> Result<QueueStats, DatabaseError> {
        let rows = query_all(
            self.backend.conn(),
            "counts",
            "SELECT CASE WHEN cancelled_at IS NOT NULL AND status IN ('pending', 'processing')
                         THEN 'cancelled' ELSE status END AS s,
                    COUNT(*)
             FROM jobs GROUP BY s",
            (),
            |row| {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("counts: {e}")))?;
                let count: i64 = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("counts: {e}")))?;
                Ok((status, count))
            },
        )
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Return processing jobs whose worker is dead or gone to `pending`.
    pub async fn reset_orphaned(&self) -> Result<Vec<i64>, DatabaseError> {
        let conn = self.backend.conn();
        let ids = self
            .backend
            .with_retry("reset_orphaned", || async move {
                query_all(
                    conn,
                    "reset_orphaned",
                    "UPDATE jobs SET status = 'pending', worker_id = NULL, started_at = NULL
                     WHERE status = 'processing' AND cancelled_at IS NULL
                       AND (worker_id IS NULL
                            OR worker_id NOT IN (SELECT id FROM workers WHERE status != 'dead'))
                     RETURNING id",
                    (),
                    |row| {
                        row.get::<i64>(0)
                            .map_err(|e| DatabaseError::Query(format!("reset_orphaned: {e}")))
                    },
                )
                .await
            })
            .await?;
        if !ids.is_empty() {
            warn!(count = ids.len(), "Reset jobs left behind by dead workers");
        }
        Ok(ids)
    }

    /// Return jobs processing for longer than `max_age` to `pending`.
    pub async fn reset_hung(&self, max_age: Duration) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = fmt_ts(
            Utc::now()
                - chrono::Duration::from_std(max_age)
                    .map_err(|e| DatabaseError::Validation(format!("max_age: {e}")))?,
        );
        let conn = self.backend.conn();
        let ids = self
            .backend
            .with_retry("reset_hung", || {
                let cutoff = cutoff.clone();
                async move {
                    query_all(
                        conn,
                        "reset_hung",
                        "UPDATE jobs SET status = 'pending', worker_id = NULL, started_at = NULL
                         WHERE status = 'processing' AND cancelled_at IS NULL AND started_at < ?1
                         RETURNING id",
                        params![cutoff],
                        |row| {
                            row.get::<i64>(0)
                                .map_err(|e| DatabaseError::Query(format!("reset_hung: {e}")))
                        },
                    )
                    .await
                }
            })
            .await?;
        if !ids.is_empty() {
            warn!(count = ids.len(), ?max_age, "Reset hung jobs");
        }
        Ok(ids)
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Map a row selected with [`JOB_COLUMNS`] to a [`Job`].
pub(crate) fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(format!("job row: {e}"));

    let job_type: String = row.get(1).map_err(q)?;
    let status: String = row.get(2).map_err(q)?;
    let payload: String = row.get(7).map_err(q)?;
    let created_at: String = row.get(9).map_err(q)?;
    let result = col_opt_text(row, 17).map_err(q)?;

    Ok(Job {
        id: row.get(0).map_err(q)?,
        job_type: job_type.parse()?,
        status: status.parse()?,
        priority: row.get(3).map_err(q)?,
        input_file: row.get(4).map_err(q)?,
        output_file: row.get(5).map_err(q)?,
        content_hash: row.get(6).map_err(q)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        correlation_id: col_opt_text(row, 8).map_err(q)?,
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(col_opt_text(row, 10).map_err(q)?),
        completed_at: parse_optional_datetime(col_opt_text(row, 11).map_err(q)?),
        worker_id: col_opt_i64(row, 12).map_err(q)?,
        attempts: row.get(13).map_err(q)?,
        max_attempts: row.get(14).map_err(q)?,
        error: col_opt_text(row, 15).map_err(q)?,
        traceback: col_opt_text(row, 16).map_err(q)?,
        result: result.and_then(|r| serde_json::from_str(&r).ok()),
        cancelled_at: parse_optional_datetime(col_opt_text(row, 18).map_err(q)?),
        cancelled_by: col_opt_text(row, 19).map_err(q)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ErrorCategory, ExecutionMode, JobFailure};
    use serde_json::json;

    async fn test_store() -> JobStore {
        JobStore::new_memory().await.unwrap()
    }

    fn notebook(input: &str, hash: &str) -> NewJob {
        NewJob::new(
            JobType::Notebook,
            input,
            format!("out/{input}.html"),
            hash,
            json!({"kind": "completed", "language": "en"}),
        )
    }

    fn failure(msg: &str) -> JobOutcome {
        JobOutcome::Failed {
            failure: JobFailure {
                error_message: msg.to_string(),
                error_class: "ConverterError".into(),
                traceback: Some("trace".into()),
                processing_time: Some(0.5),
                worker_type: JobType::Notebook,
                category: ErrorCategory::User,
                actionable_guidance: String::new(),
            },
        }
    }

    async fn worker(store: &JobStore, name: &str) -> i64 {
        store
            .registry()
            .register(JobType::Notebook, name, ExecutionMode::InProcess)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_get() {
        let store = test_store().await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload["kind"], "completed");
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn enqueue_named_rejects_unknown_type() {
        let store = test_store().await;
        let err = store
            .enqueue_named("pdf", "a", "b", "h", json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Validation(_)));
    }

    #[tokio::test]
    async fn claim_respects_priority_then_age() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let low = store.enqueue(notebook("low.py", "h1")).await.unwrap();
        let high = store
            .enqueue(notebook("high.py", "h2").with_priority(5))
            .await
            .unwrap();
        let low2 = store.enqueue(notebook("low2.py", "h3")).await.unwrap();

        let order: Vec<i64> = [
            store.claim_next(JobType::Notebook, w).await.unwrap().unwrap().id,
            store.claim_next(JobType::Notebook, w).await.unwrap().unwrap().id,
            store.claim_next(JobType::Notebook, w).await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![high, low, low2]);
        assert!(store.claim_next(JobType::Notebook, w).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_only_matches_type() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        store.enqueue(notebook("a.py", "h1")).await.unwrap();
        assert!(store.claim_next(JobType::PlantUml, w).await.unwrap().is_none());
        let job = store.claim_next(JobType::Notebook, w).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id, Some(w));
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn completed_clears_error() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();

        store.claim_next(JobType::Notebook, w).await.unwrap();
        store.report_status(id, &failure("boom")).await.unwrap();
        store.claim_next(JobType::Notebook, w).await.unwrap();
        let reported = store
            .report_status(id, &JobOutcome::Completed { result: Some(json!({"bytes": 10})) })
            .await
            .unwrap();
        assert_eq!(reported, ReportedStatus::Completed);

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.traceback.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(job.result, Some(json!({"bytes": 10})));
        assert_eq!(job.worker_id, Some(w));
    }

    #[tokio::test]
    async fn failure_requeues_until_max_attempts() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();

        for expected in 1..3 {
            store.claim_next(JobType::Notebook, w).await.unwrap().unwrap();
            let reported = store.report_status(id, &failure("boom")).await.unwrap();
            assert_eq!(reported, ReportedStatus::Requeued { attempts: expected });
            let job = store.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert!(job.worker_id.is_none());
            assert!(job.started_at.is_none());
        }

        store.claim_next(JobType::Notebook, w).await.unwrap().unwrap();
        let reported = store.report_status(id, &failure("boom")).await.unwrap();
        assert_eq!(reported, ReportedStatus::Failed { attempts: 3 });

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.traceback.as_deref(), Some("trace"));
        assert_eq!(job.failure().unwrap().error_message, "boom");
        assert!(store.claim_next(JobType::Notebook, w).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn report_on_pending_job_is_invalid() {
        let store = test_store().await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        let err = store
            .report_status(id, &JobOutcome::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::InvalidTransition { .. })));

        let err = store
            .report_status(999, &JobOutcome::Completed { result: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotFound { id: 999 })));
    }

    #[tokio::test]
    async fn cancel_pending_filters_by_type_and_age() {
        let store = test_store().await;
        let nb = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        let uml = store
            .enqueue(NewJob::new(JobType::PlantUml, "d.pu", "d.png", "h2", json!({})))
            .await
            .unwrap();

        let none = store
            .cancel_pending(None, Some(Duration::from_secs(3600)), "test")
            .await
            .unwrap();
        assert!(none.is_empty());

        let ids = store
            .cancel_pending(Some(JobType::PlantUml), None, "test")
            .await
            .unwrap();
        assert_eq!(ids, vec![uml]);
        assert!(store.is_cancelled(uml).await.unwrap());
        assert!(!store.is_cancelled(nb).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_not_claimed() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        store.cancel_pending(None, None, "test").await.unwrap();
        assert!(store.claim_next(JobType::Notebook, w).await.unwrap().is_none());

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.display_status(), "cancelled");
        assert_eq!(store.list_cancelled(10).await.unwrap().len(), 1);
        assert_eq!(store.counts().await.unwrap().cancelled, 1);
    }

    #[tokio::test]
    async fn cancel_for_input_flags_processing_rows() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let a = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        let b = store.enqueue(notebook("a.py", "h2")).await.unwrap();
        store.enqueue(notebook("other.py", "h3")).await.unwrap();
        store.claim_next(JobType::Notebook, w).await.unwrap();

        let mut ids = store.cancel_for_input("a.py", "watcher").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec![a, b]);
        assert!(store.is_cancelled(a).await.unwrap());
    }

    #[tokio::test]
    async fn is_cancelled_unknown_job() {
        let store = test_store().await;
        assert!(matches!(
            store.is_cancelled(42).await,
            Err(Error::Job(JobError::NotFound { id: 42 }))
        ));
    }

    #[tokio::test]
    async fn statuses_batch() {
        let store = test_store().await;
        let a = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        let b = store.enqueue(notebook("b.py", "h2")).await.unwrap();
        let map = store.statuses(&[a, b, 77]).await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a].status, JobStatus::Pending);
        assert!(!map[&a].cancelled);
        assert!(store.statuses(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_status_limits() {
        let store = test_store().await;
        for i in 0..5 {
            store.enqueue(notebook(&format!("{i}.py"), &format!("h{i}"))).await.unwrap();
        }
        assert_eq!(store.list_by_status(JobStatus::Pending, 3).await.unwrap().len(), 3);
        assert!(store.list_by_status(JobStatus::Failed, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_orphaned_requeues_jobs_of_dead_workers() {
        let store = test_store().await;
        let registry = store.registry();
        let w = worker(&store, "w1").await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        store.claim_next(JobType::Notebook, w).await.unwrap();

        assert!(store.reset_orphaned().await.unwrap().is_empty());

        registry
            .set_status(w, crate::store::model::WorkerStatus::Dead)
            .await
            .unwrap();
        assert_eq!(store.reset_orphaned().await.unwrap(), vec![id]);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.worker_id.is_none());
    }

    #[tokio::test]
    async fn reset_hung_only_touches_old_claims() {
        let store = test_store().await;
        let w = worker(&store, "w1").await;
        let id = store.enqueue(notebook("a.py", "h1")).await.unwrap();
        store.claim_next(JobType::Notebook, w).await.unwrap();

        assert!(store.reset_hung(Duration::from_secs(600)).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.reset_hung(Duration::ZERO).await.unwrap(), vec![id]);
    }
}
