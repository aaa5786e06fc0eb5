//! Persisted record of the workers a pool started.
//!
//! Lets `pool stop` in a later invocation find workers started by
//! `pool start`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::store::model::{ExecutionMode, JobType};

pub const STATE_VERSION: u32 = 1;

/// One worker the pool is responsible for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolWorkerRecord {
    pub worker_type: JobType,
    pub execution_mode: ExecutionMode,
    pub executor_id: String,
    pub db_worker_id: Option<i64>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub version: u32,
    pub db_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub workers: Vec<PoolWorkerRecord>,
}

impl PoolState {
    pub fn new(db_path: impl Into<PathBuf>, workers: Vec<PoolWorkerRecord>) -> Self {
        Self {
            version: STATE_VERSION,
            db_path: db_path.into(),
            created_at: Utc::now(),
            workers,
        }
    }

    /// Refuse a state file written for another database.
    pub fn validate(&self, db_path: &Path) -> Result<(), PoolError> {
        if normalize(&self.db_path) != normalize(db_path) {
            return Err(PoolError::StateMismatch {
                expected: db_path.display().to_string(),
                found: self.db_path.display().to_string(),
            });
        }
        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Reads and writes the pool state file.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write through a temp file and rename, so readers never see a partial file.
    pub async fn save(&self, state: &PoolState) -> Result<(), PoolError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| PoolError::StateFile(format!("creating {}: {e}", dir.display())))?;
            }
        }
        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| PoolError::StateFile(format!("serializing: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| PoolError::StateFile(format!("writing {}: {e}", tmp.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| PoolError::StateFile(format!("chmod {}: {e}", tmp.display())))?;
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                debug!(path = %tmp.display(), "Removing temp state file: {rm}");
            }
            return Err(PoolError::StateFile(format!(
                "renaming onto {}: {e}",
                self.path.display()
            )));
        }
        info!(
            path = %self.path.display(),
            workers = state.workers.len(),
            "Saved pool state"
        );
        Ok(())
    }

    /// The saved state, or `None` when there is none or it is unreadable.
    pub async fn load(&self) -> Option<PoolState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), "Cannot read pool state: {e}");
                }
                return None;
            }
        };
        match serde_json::from_slice::<PoolState>(&raw) {
            Ok(state) if state.version == STATE_VERSION => Some(state),
            Ok(state) => {
                warn!(version = state.version, "Ignoring pool state with unknown version");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Corrupt pool state: {e}");
                None
            }
        }
    }

    pub async fn clear(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Cleared pool state"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "Cannot remove pool state: {e}"),
        }
    }
}
