//! libSQL backend shared by the job store and the worker registry.
//!
//! Supports local file and in-memory databases. The file store uses the
//! rollback journal (`journal_mode=DELETE`) so that it keeps working when the
//! file sits on a network share or a container volume.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::store::migrations;

/// Attempts for a write that hits a busy/locked store.
const BUSY_RETRY_ATTEMPTS: u32 = 5;

/// First backoff between busy retries; doubles each time.
const BUSY_RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Per-connection lock wait before SQLite reports busy.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    path: Option<PathBuf>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Pool(format!("Failed to create database directory: {e}"))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            path: Some(path.to_path_buf()),
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Job store opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            path: None,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute_batch(&format!(
                "PRAGMA journal_mode = DELETE;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
            ))
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to configure connection: {e}")))?;
        migrations::run_migrations(&self.conn).await
    }

    /// Run `op`, retrying with backoff while the store reports busy/locked.
    ///
    /// Non-busy errors are returned immediately. After the last attempt the
    /// error becomes [`DatabaseError::Unavailable`].
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> Result<T, DatabaseError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut delay = BUSY_RETRY_BASE_DELAY;
        for attempt in 1..=BUSY_RETRY_ATTEMPTS {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy() => {
                    if attempt == BUSY_RETRY_ATTEMPTS {
                        break;
                    }
                    debug!(operation, attempt, "Store busy, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(operation, attempts = BUSY_RETRY_ATTEMPTS, "Store unavailable");
        Err(DatabaseError::Unavailable {
            operation: operation.to_string(),
            attempts: BUSY_RETRY_ATTEMPTS,
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// orders the same way as the instants.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_str() -> String {
    fmt_ts(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

pub(crate) fn opt_real(v: Option<f64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Real(v),
        None => libsql::Value::Null,
    }
}

/// Read a nullable text column.
pub(crate) fn col_opt_text(row: &libsql::Row, idx: i32) -> Result<Option<String>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Text(s) => Ok(Some(s)),
        libsql::Value::Null => Ok(None),
        libsql::Value::Integer(i) => Ok(Some(i.to_string())),
        libsql::Value::Real(r) => Ok(Some(r.to_string())),
        libsql::Value::Blob(b) => Ok(Some(String::from_utf8_lossy(&b).into_owned())),
    }
}

/// Read a nullable integer column.
pub(crate) fn col_opt_i64(row: &libsql::Row, idx: i32) -> Result<Option<i64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Integer(i) => Ok(Some(i)),
        libsql::Value::Real(r) => Ok(Some(r as i64)),
        _ => Ok(None),
    }
}

/// Read a nullable real column.
pub(crate) fn col_opt_f64(row: &libsql::Row, idx: i32) -> Result<Option<f64>, libsql::Error> {
    match row.get_value(idx)? {
        libsql::Value::Real(r) => Ok(Some(r)),
        libsql::Value::Integer(i) => Ok(Some(i as f64)),
        _ => Ok(None),
    }
}

/// Run a query and collect every row through `map`.
pub(crate) async fn query_all<T>(
    conn: &Connection,
    context: &str,
    sql: &str,
    params: impl libsql::params::IntoParams,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => out.push(map(&row)?),
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn memory_store_runs_migrations() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let version = migrations::get_current_version(backend.conn()).await.unwrap();
        assert_eq!(version, migrations::latest_version());
        assert!(backend.path().is_none());
    }

    #[tokio::test]
    async fn file_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobs.db");
        let backend = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(backend.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn retry_gives_up_with_unavailable() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = backend
            .with_retry("test_op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::Query("database is locked".into())) }
            })
            .await;
        assert!(matches!(
            result,
            Err(DatabaseError::Unavailable { attempts: BUSY_RETRY_ATTEMPTS, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), BUSY_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn retry_passes_through_other_errors() {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = backend
            .with_retry("test_op", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(DatabaseError::Query("no such table".into())) }
            })
            .await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert_eq!(parse_datetime(&fmt_ts(a)).timestamp_micros(), a.timestamp_micros());
    }

    #[test]
    fn parses_sqlite_datetime_output() {
        let dt = parse_datetime("2024-05-01 12:30:00");
        assert_eq!(dt.to_rfc3339(), "2024-05-01T12:30:00+00:00");
    }
}
