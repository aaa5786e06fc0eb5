//! The backend extension point.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::OperationError;
use crate::operation::{CopySpec, Submission};
use crate::store::model::{ErrorCategory, JobFailure, JobType};

/// A job that ended failed, as reported to the build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedJob {
    pub job_id: Option<i64>,
    pub correlation_id: Option<String>,
    pub job_type: JobType,
    pub input_file: String,
    pub output_file: String,
    pub failure: JobFailure,
}

/// Outcome of waiting for everything submitted so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompletionReport {
    pub completed: usize,
    pub cancelled: usize,
    pub failed: Vec<FailedJob>,
}

impl CompletionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CompletionReport) {
        self.completed += other.completed;
        self.cancelled += other.cancelled;
        self.failed.extend(other.failed);
    }

    /// Failures grouped by who has to act.
    pub fn failures_in(&self, category: ErrorCategory) -> impl Iterator<Item = &FailedJob> {
        self.failed
            .iter()
            .filter(move |f| f.failure.category == category)
    }
}

/// Where operations go to be carried out.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Accept one submission. Returns once it is queued, not once it is done.
    async fn execute_operation(&self, submission: &Submission) -> Result<(), OperationError>;

    async fn copy_file(&self, copy: &CopySpec) -> Result<(), OperationError> {
        copy_local(&copy.source, &copy.target).await
    }

    /// Wait until everything submitted has finished, or `timeout` passes.
    /// `None` uses the backend's own limit.
    async fn wait_for_completion(
        &self,
        timeout: Option<Duration>,
    ) -> Result<CompletionReport, OperationError>;

    async fn delete_file(&self, path: &Path) -> Result<(), OperationError> {
        delete_local(path).await
    }
}

/// Copy a file, creating the target directory.
pub async fn copy_local(source: &Path, target: &Path) -> Result<(), OperationError> {
    if let Some(dir) = target.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::copy(source, target).await?;
    debug!(source = %source.display(), target = %target.display(), "Copied file");
    Ok(())
}

/// Delete a file; a missing file is not an error.
pub async fn delete_local(path: &Path) -> Result<(), OperationError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_creates_directories_and_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("img.png");
        tokio::fs::write(&src, b"png").await.unwrap();
        let target = dir.path().join("out/public/img/img.png");

        copy_local(&src, &target).await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"png");

        delete_local(&target).await.unwrap();
        delete_local(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn merge_adds_up() {
        let failure = JobFailure::plain("boom", JobType::DrawIo);
        let mut a = CompletionReport {
            completed: 2,
            ..Default::default()
        };
        a.merge(CompletionReport {
            completed: 1,
            cancelled: 1,
            failed: vec![FailedJob {
                job_id: Some(9),
                correlation_id: None,
                job_type: JobType::DrawIo,
                input_file: "a.drawio".into(),
                output_file: "a.png".into(),
                failure,
            }],
        });
        assert_eq!(a.completed, 3);
        assert_eq!(a.cancelled, 1);
        assert!(!a.is_success());
        assert_eq!(a.failures_in(ErrorCategory::Infrastructure).count(), 1);
        assert_eq!(a.failures_in(ErrorCategory::User).count(), 0);
    }
}
