//! Version-tracked schema migrations for the job store.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version in `schema_version` and applies only the new ones
//! sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS workers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                worker_type TEXT NOT NULL,
                container_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT 'idle'
                    CHECK (status IN ('idle', 'busy', 'hung', 'dead')),
                started_at TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                cpu_usage REAL,
                memory_usage REAL,
                jobs_processed INTEGER NOT NULL DEFAULT 0,
                jobs_failed INTEGER NOT NULL DEFAULT 0,
                avg_processing_time REAL
            );
            CREATE INDEX IF NOT EXISTS idx_workers_type_status ON workers(worker_type, status);

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
                priority INTEGER NOT NULL DEFAULT 0,
                input_file TEXT NOT NULL,
                output_file TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                worker_id INTEGER REFERENCES workers(id) ON DELETE SET NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                error TEXT,
                traceback TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status_type ON jobs(status, job_type);
            CREATE INDEX IF NOT EXISTS idx_jobs_content_hash ON jobs(content_hash);

            CREATE TABLE IF NOT EXISTS results_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                output_file TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                result_metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                UNIQUE (output_file, content_hash)
            );
            CREATE INDEX IF NOT EXISTS idx_results_cache_lookup
                ON results_cache(output_file, content_hash);
        "#,
    },
    Migration {
        version: 2,
        name: "job_correlation_and_cancellation",
        sql: r#"
            ALTER TABLE jobs ADD COLUMN correlation_id TEXT;
            ALTER TABLE jobs ADD COLUMN result TEXT;
            ALTER TABLE jobs ADD COLUMN cancelled_at TEXT;
            ALTER TABLE jobs ADD COLUMN cancelled_by TEXT;
            CREATE INDEX IF NOT EXISTS idx_jobs_correlation ON jobs(correlation_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_input_file ON jobs(input_file);
        "#,
    },
    Migration {
        version: 3,
        name: "worker_lifecycle",
        sql: r#"
            ALTER TABLE workers ADD COLUMN execution_mode TEXT;
            ALTER TABLE workers ADD COLUMN parent_pid INTEGER;

            CREATE TABLE IF NOT EXISTS worker_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                worker_id INTEGER,
                job_type TEXT,
                message TEXT,
                data TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_worker_events_worker ON worker_events(worker_id);
        "#,
    },
    Migration {
        version: 4,
        name: "executed_notebooks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS executed_notebooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                input_file TEXT NOT NULL,
                source_hash TEXT NOT NULL,
                language TEXT NOT NULL,
                prog_lang TEXT NOT NULL,
                executed_notebook BLOB NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (input_file, source_hash, language, prog_lang)
            );
        "#,
    },
];

/// Latest schema version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Run all pending migrations against the given connection.
///
/// Creates the `schema_version` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create schema_version table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!("Database migrations complete (at V{})", latest_version());
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
pub async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query schema version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read schema version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse schema version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `schema_version`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
