//! Content-addressed results cache and the executed-notebook cache.

use libsql::params;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DatabaseError;
use crate::store::jobs::JobStore;
use crate::store::libsql_backend::{now_str, parse_datetime, query_all};
use crate::store::model::CacheEntry;

/// Key of an executed notebook. The output kind is deliberately absent so
/// that every HTML variant of the same source shares one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub input_file: String,
    pub source_hash: String,
    pub language: String,
    pub prog_lang: String,
}

impl JobStore {
    // ── Results cache ───────────────────────────────────────────────

    /// Look up a finished conversion and bump its access counter.
    pub async fn get_cached(
        &self,
        output_file: &str,
        content_hash: &str,
    ) -> Result<Option<CacheEntry>, DatabaseError> {
        let conn = self.backend().conn();
        let mut entries = query_all(
            conn,
            "get_cached",
            "SELECT output_file, content_hash, result_metadata, created_at, last_accessed, access_count
             FROM results_cache WHERE output_file = ?1 AND content_hash = ?2",
            params![output_file, content_hash],
            row_to_entry,
        )
        .await?;

        let Some(mut entry) = entries.pop() else {
            return Ok(None);
        };

        let now = now_str();
        // Access bookkeeping is best effort; a busy store must not turn a hit into an error.
        if let Err(e) = conn
            .execute(
                "UPDATE results_cache SET access_count = access_count + 1, last_accessed = ?1
                 WHERE output_file = ?2 AND content_hash = ?3",
                params![now.as_str(), output_file, content_hash],
            )
            .await
        {
            debug!(output_file, "Cache access update skipped: {e}");
        } else {
            entry.access_count += 1;
            entry.last_accessed = parse_datetime(&now);
        }
        Ok(Some(entry))
    }

    /// Insert or supersede the entry for `(output_file, content_hash)`.
    pub async fn put_cached(
        &self,
        output_file: &str,
        content_hash: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let metadata = serde_json::to_string(metadata)
            .map_err(|e| DatabaseError::Serialization(format!("cache metadata: {e}")))?;
        let conn = self.backend().conn();
        self.backend()
            .with_retry("put_cached", || {
                let metadata = metadata.clone();
                async move {
                    let now = now_str();
                    conn.execute(
                        "INSERT INTO results_cache (output_file, content_hash, result_metadata, created_at, last_accessed, access_count)
                         VALUES (?1, ?2, ?3, ?4, ?4, 0)
                         ON CONFLICT (output_file, content_hash) DO UPDATE SET
                             result_metadata = excluded.result_metadata,
                             created_at = excluded.created_at,
                             last_accessed = excluded.last_accessed",
                        params![output_file, content_hash, metadata, now],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("put_cached: {e}")))
                }
            })
            .await?;
        debug!(output_file, content_hash, "Result cached");
        Ok(())
    }

    // ── Executed notebooks ──────────────────────────────────────────

    pub async fn get_executed(&self, key: &ExecutionKey) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut found = query_all(
            self.backend().conn(),
            "get_executed",
            "SELECT executed_notebook FROM executed_notebooks
             WHERE input_file = ?1 AND source_hash = ?2 AND language = ?3 AND prog_lang = ?4",
            params![
                key.input_file.as_str(),
                key.source_hash.as_str(),
                key.language.as_str(),
                key.prog_lang.as_str()
            ],
            |row| match row
                .get_value(0)
                .map_err(|e| DatabaseError::Query(format!("get_executed: {e}")))?
            {
                libsql::Value::Blob(b) => Ok(b),
                libsql::Value::Text(t) => Ok(t.into_bytes()),
                _ => Ok(Vec::new()),
            },
        )
        .await?;
        Ok(found.pop())
    }

    pub async fn put_executed(&self, key: &ExecutionKey, notebook: &[u8]) -> Result<(), DatabaseError> {
        let conn = self.backend().conn();
        self.backend()
            .with_retry("put_executed", || async move {
                conn.execute(
                    "INSERT OR REPLACE INTO executed_notebooks
                        (input_file, source_hash, language, prog_lang, executed_notebook, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        key.input_file.as_str(),
                        key.source_hash.as_str(),
                        key.language.as_str(),
                        key.prog_lang.as_str(),
                        libsql::Value::Blob(notebook.to_vec()),
                        now_str()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("put_executed: {e}")))
            })
            .await?;
        debug!(input = %key.input_file, language = %key.language, "Executed notebook cached");
        Ok(())
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<CacheEntry, DatabaseError> {
    let q = |e: libsql::Error| DatabaseError::Query(format!("cache row: {e}"));
    let metadata: String = row.get(2).map_err(q)?;
    let created_at: String = row.get(3).map_err(q)?;
    let last_accessed: String = row.get(4).map_err(q)?;
    Ok(CacheEntry {
        output_file: row.get(0).map_err(q)?,
        content_hash: row.get(1).map_err(q)?,
        result_metadata: serde_json::from_str(&metadata)
            .map_err(|e| DatabaseError::Serialization(format!("cache metadata: {e}")))?,
        created_at: parse_datetime(&created_at),
        last_accessed: parse_datetime(&last_accessed),
        access_count: row.get(5).map_err(q)?,
    })
}
