//! Worker registry: identity, heartbeat, counters and health.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::params;
use tracing::{debug, info};

use crate::config::HealthThresholds;
use crate::error::DatabaseError;
use crate::store::libsql_backend::{
    LibSqlBackend, col_opt_f64, col_opt_i64, col_opt_text, fmt_ts, now_str, opt_real, opt_text,
    parse_datetime, query_all,
};
use crate::store::model::{ExecutionMode, JobType, WorkerEvent, WorkerRecord, WorkerStatus};

const WORKER_COLUMNS: &str = "id, worker_type, container_id, execution_mode, status, started_at, last_heartbeat, cpu_usage, memory_usage, jobs_processed, jobs_failed, avg_processing_time, parent_pid";

/// Durable table of worker records.
#[derive(Clone)]
pub struct WorkerRegistry {
    backend: Arc<LibSqlBackend>,
}

impl WorkerRegistry {
    pub fn new(backend: Arc<LibSqlBackend>) -> Self {
        Self { backend }
    }

    // ── Identity ────────────────────────────────────────────────────

    /// Register a worker for `executor_id` and return its row id.
    ///
    /// Registering an executor id that already has a row revives that row,
    /// so retrying after a lost response does not create a duplicate.
    pub async fn register(
        &self,
        worker_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
    ) -> Result<i64, DatabaseError> {
        self.register_with_parent(worker_type, executor_id, mode, None)
            .await
    }

    pub async fn register_with_parent(
        &self,
        worker_type: JobType,
        executor_id: &str,
        mode: ExecutionMode,
        parent_pid: Option<i64>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.backend.conn();
        let parent = match parent_pid {
            Some(pid) => libsql::Value::Integer(pid),
            None => libsql::Value::Null,
        };
        let id = self
            .backend
            .with_retry("register_worker", || {
                let parent = parent.clone();
                async move {
                    let now = now_str();
                    let mut ids = query_all(
                        conn,
                        "register_worker",
                        "INSERT INTO workers (worker_type, container_id, execution_mode, status, started_at, last_heartbeat, parent_pid)
                         VALUES (?1, ?2, ?3, 'idle', ?4, ?4, ?5)
                         ON CONFLICT (container_id) DO UPDATE SET
                             worker_type = excluded.worker_type,
                             execution_mode = excluded.execution_mode,
                             status = 'idle',
                             last_heartbeat = excluded.last_heartbeat,
                             parent_pid = excluded.parent_pid
                         RETURNING id",
                        params![worker_type.as_str(), executor_id, mode.as_str(), now, parent],
                        |row| {
                            row.get::<i64>(0)
                                .map_err(|e| DatabaseError::Query(format!("register_worker: {e}")))
                        },
                    )
                    .await?;
                    ids.pop()
                        .ok_or_else(|| DatabaseError::Query("register_worker: no id returned".into()))
                }
            })
            .await?;

        self.log_event("registered", Some(id), Some(worker_type), Some(executor_id), None)
            .await;
        info!(worker_id = id, worker_type = %worker_type, executor_id, "Worker registered");
        Ok(id)
    }

    /// Mark a pre-registered worker as alive.
    pub async fn activate(&self, worker_id: i64) -> Result<(), DatabaseError> {
        let conn = self.backend.conn();
        let changed = self
            .backend
            .with_retry("activate_worker", || async move {
                conn.execute(
                    "UPDATE workers SET status = 'idle', last_heartbeat = ?1 WHERE id = ?2",
                    params![now_str(), worker_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("activate_worker: {e}")))
            })
            .await?;
        if changed == 0 {
            return Err(not_found(worker_id));
        }
        self.log_event("activated", Some(worker_id), None, None, None).await;
        Ok(())
    }

    /// Refresh the heartbeat and resource figures.
    pub async fn heartbeat(
        &self,
        worker_id: i64,
        cpu: Option<f64>,
        mem: Option<f64>,
    ) -> Result<(), DatabaseError> {
        let conn = self.backend.conn();
        let changed = self
            .backend
            .with_retry("heartbeat", || async move {
                conn.execute(
                    "UPDATE workers
                     SET last_heartbeat = ?1,
                         cpu_usage = COALESCE(?2, cpu_usage),
                         memory_usage = COALESCE(?3, memory_usage)
                     WHERE id = ?4",
                    params![now_str(), opt_real(cpu), opt_real(mem), worker_id],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("heartbeat: {e}")))
            })
            .await?;
        if changed == 0 {
            return Err(not_found(worker_id));
        }
        Ok(())
    }

    pub async fn set_status(&self, worker_id: i64, status: WorkerStatus) -> Result<(), DatabaseError> {
        let conn = self.backend.conn();
        // A dead worker keeps its last real heartbeat.
        let sql = if status == WorkerStatus::Dead {
            "UPDATE workers SET status = ?1 WHERE id = ?2"
        } else {
            "UPDATE workers SET status = ?1, last_heartbeat = ?3 WHERE id = ?2"
        };
        let changed = self
            .backend
            .with_retry("set_worker_status", || async move {
                let result = if status == WorkerStatus::Dead {
                    conn.execute(sql, params![status.as_str(), worker_id]).await
                } else {
                    conn.execute(sql, params![status.as_str(), worker_id, now_str()])
                        .await
                };
                result.map_err(|e| DatabaseError::Query(format!("set_worker_status: {e}")))
            })
            .await?;
        if changed == 0 {
            return Err(not_found(worker_id));
        }
        debug!(worker_id, status = %status, "Worker status updated");
        Ok(())
    }

    /// Planned shutdown: the worker will not poll again.
    pub async fn unregister(&self, worker_id: i64, reason: &str) -> Result<(), DatabaseError> {
        self.set_status(worker_id, WorkerStatus::Dead).await?;
        self.log_event("unregistered", Some(worker_id), None, Some(reason), None)
            .await;
        info!(worker_id, reason, "Worker unregistered");
        Ok(())
    }

    pub async fn delete(&self, worker_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.backend.conn();
        let changed = self
            .backend
            .with_retry("delete_worker", || async move {
                conn.execute("DELETE FROM workers WHERE id = ?1", params![worker_id])
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_worker: {e}")))
            })
            .await?;
        Ok(changed > 0)
    }

    /// Update counters after a job. Averages only successful jobs.
    pub async fn record_job_outcome(
        &self,
        worker_id: i64,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), DatabaseError> {
        let conn = self.backend.conn();
        let secs = elapsed.as_secs_f64();
        self.backend
            .with_retry("record_job_outcome", || async move {
                let result = if success {
                    conn.execute(
                        "UPDATE workers
                         SET avg_processing_time = (COALESCE(avg_processing_time, 0) * jobs_processed + ?1)
                                                   / (jobs_processed + 1),
                             jobs_processed = jobs_processed + 1
                         WHERE id = ?2",
                        params![secs, worker_id],
                    )
                    .await
                } else {
                    conn.execute(
                        "UPDATE workers SET jobs_failed = jobs_failed + 1 WHERE id = ?1",
                        params![worker_id],
                    )
                    .await
                };
                result.map_err(|e| DatabaseError::Query(format!("record_job_outcome: {e}")))
            })
            .await?;
        Ok(())
    }

    // ── Discovery ───────────────────────────────────────────────────

    pub async fn get(&self, worker_id: i64) -> Result<Option<WorkerRecord>, DatabaseError> {
        let mut found = query_all(
            self.backend.conn(),
            "get_worker",
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![worker_id],
            row_to_worker,
        )
        .await?;
        Ok(found.pop())
    }

    pub async fn find_by_executor(
        &self,
        executor_id: &str,
    ) -> Result<Option<WorkerRecord>, DatabaseError> {
        let mut found = query_all(
            self.backend.conn(),
            "find_by_executor",
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE container_id = ?1"),
            params![executor_id],
            row_to_worker,
        )
        .await?;
        Ok(found.pop())
    }

    /// All workers, optionally only those with a declared status.
    pub async fn discover(
        &self,
        status_filter: Option<WorkerStatus>,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        query_all(
            self.backend.conn(),
            "discover",
            &format!(
                "SELECT {WORKER_COLUMNS} FROM workers
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY worker_type, id"
            ),
            params![opt_text(status_filter.map(|s| s.as_str()))],
            row_to_worker,
        )
        .await
    }

    /// Workers of `job_type` whose heartbeat-derived health is idle or busy.
    pub async fn healthy_of_type(
        &self,
        job_type: JobType,
        thresholds: &HealthThresholds,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let now = Utc::now();
        Ok(self
            .discover(None)
            .await?
            .into_iter()
            .filter(|w| w.worker_type == job_type)
            .filter(|w| {
                matches!(
                    classify(w, now, thresholds),
                    WorkerStatus::Idle | WorkerStatus::Busy
                )
            })
            .collect())
    }

    // ── Cleanup ─────────────────────────────────────────────────────

    /// Persist `dead` for workers silent beyond the hard threshold.
    pub async fn mark_stale_dead(
        &self,
        thresholds: &HealthThresholds,
    ) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = cutoff(thresholds.dead_after)?;
        let conn = self.backend.conn();
        let ids = self
            .backend
            .with_retry("mark_stale_dead", || {
                let cutoff = cutoff.clone();
                async move {
                    query_all(
                        conn,
                        "mark_stale_dead",
                        "UPDATE workers SET status = 'dead'
                         WHERE status != 'dead' AND last_heartbeat < ?1
                         RETURNING id",
                        params![cutoff],
                        |row| {
                            row.get::<i64>(0)
                                .map_err(|e| DatabaseError::Query(format!("mark_stale_dead: {e}")))
                        },
                    )
                    .await
                }
            })
            .await?;
        for id in &ids {
            self.log_event("marked_dead", Some(*id), None, Some("heartbeat timeout"), None)
                .await;
        }
        Ok(ids)
    }

    /// Delete dead and hung rows, and any row silent beyond the cleanup bound.
    pub async fn cleanup(&self, thresholds: &HealthThresholds) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = cutoff(thresholds.cleanup_after)?;
        let conn = self.backend.conn();
        let ids = self
            .backend
            .with_retry("cleanup_workers", || {
                let cutoff = cutoff.clone();
                async move {
                    query_all(
                        conn,
                        "cleanup_workers",
                        "DELETE FROM workers
                         WHERE status IN ('dead', 'hung') OR last_heartbeat < ?1
                         RETURNING id",
                        params![cutoff],
                        |row| {
                            row.get::<i64>(0)
                                .map_err(|e| DatabaseError::Query(format!("cleanup_workers: {e}")))
                        },
                    )
                    .await
                }
            })
            .await?;
        for id in &ids {
            self.log_event("cleaned_up", Some(*id), None, None, None).await;
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Removed stale worker records");
        }
        Ok(ids)
    }

    // ── Events ──────────────────────────────────────────────────────

    /// Append to the audit log. Failures are logged and swallowed.
    pub async fn log_event(
        &self,
        event_type: &str,
        worker_id: Option<i64>,
        job_type: Option<JobType>,
        message: Option<&str>,
        data: Option<&serde_json::Value>,
    ) {
        let data = data.and_then(|d| serde_json::to_string(d).ok());
        let worker = match worker_id {
            Some(id) => libsql::Value::Integer(id),
            None => libsql::Value::Null,
        };
        if let Err(e) = self
            .backend
            .conn()
            .execute(
                "INSERT INTO worker_events (event_type, worker_id, job_type, message, data, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event_type,
                    worker,
                    opt_text(job_type.map(|t| t.as_str())),
                    opt_text(message),
                    opt_text(data.as_deref()),
                    now_str()
                ],
            )
            .await
        {
            debug!(event_type, "Failed to record worker event: {e}");
        }
    }

    /// Most recent events, newest first.
    pub async fn events(
        &self,
        worker_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<WorkerEvent>, DatabaseError> {
        let worker = match worker_id {
            Some(id) => libsql::Value::Integer(id),
            None => libsql::Value::Null,
        };
        query_all(
            self.backend.conn(),
            "worker_events",
            "SELECT id, event_type, worker_id, job_type, message, data, created_at
             FROM worker_events
             WHERE (?1 IS NULL OR worker_id = ?1)
             ORDER BY id DESC LIMIT ?2",
            params![worker, limit as i64],
            |row| {
                let q = |e: libsql::Error| DatabaseError::Query(format!("worker_events: {e}"));
                let created_at: String = row.get(6).map_err(q)?;
                Ok(WorkerEvent {
                    id: row.get(0).map_err(q)?,
                    event_type: row.get(1).map_err(q)?,
                    worker_id: col_opt_i64(row, 2).map_err(q)?,
                    job_type: col_opt_text(row, 3).map_err(q)?,
                    message: col_opt_text(row, 4).map_err(q)?,
                    data: col_opt_text(row, 5)
                        .map_err(q)?
                        .and_then(|d| serde_json::from_str(&d).ok()),
                    created_at: parse_datetime(&created_at),
                })
            },
        )
        .await
    }
}

/// Effective health of a worker from its declared status and heartbeat age.
///
/// A declared `dead` stays dead. Silence beyond `dead_after` is dead for any
/// status; a busy worker silent beyond `hung_after` is hung. The job it holds
/// is not touched.
pub fn classify(
    worker: &WorkerRecord,
    now: DateTime<Utc>,
    thresholds: &HealthThresholds,
) -> WorkerStatus {
    if worker.status == WorkerStatus::Dead {
        return WorkerStatus::Dead;
    }
    let age = (now - worker.last_heartbeat).to_std().unwrap_or(Duration::ZERO);
    if age > thresholds.dead_after {
        WorkerStatus::Dead
    } else if worker.status == WorkerStatus::Busy && age > thresholds.hung_after {
        WorkerStatus::Hung
    } else {
        worker.status
    }
}

fn cutoff(age: Duration) -> Result<String, DatabaseError> {
    let age = chrono::Duration::from_std(age)
        .map_err(|e| DatabaseError::Validation(format!("threshold: {e}")))?;
    Ok(fmt_ts(Utc::now() - age))
}

fn not_found(worker_id: i64) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "worker".into(),
        id: worker_id.to_string(),
    }
}

fn row_to_worker(row: &libsql::Row) -> Result<WorkerRecord, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(format!("worker row: {e}"));
    let worker_type: String = row.get(1).map_err(q)?;
    let status: String = row.get(4).map_err(q)?;
    let started_at: String = row.get(5).map_err(q)?;
    let last_heartbeat: String = row.get(6).map_err(q)?;
    Ok(WorkerRecord {
        id: row.get(0).map_err(q)?,
        worker_type: worker_type.parse()?,
        container_id: row.get(2).map_err(q)?,
        execution_mode: col_opt_text(row, 3)
            .map_err(q)?
            .and_then(|m| m.parse().ok()),
        status: status.parse()?,
        started_at: parse_datetime(&started_at),
        last_heartbeat: parse_datetime(&last_heartbeat),
        cpu_usage: col_opt_f64(row, 7).map_err(q)?,
        memory_usage: col_opt_f64(row, 8).map_err(q)?,
        jobs_processed: row.get(9).map_err(q)?,
        jobs_failed: row.get(10).map_err(q)?,
        avg_processing_time: col_opt_f64(row, 11).map_err(q)?,
        parent_pid: col_opt_i64(row, 12).map_err(q)?,
    })
}
