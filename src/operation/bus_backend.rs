//! Backend that publishes submissions to a message bus and matches replies.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::OperationError;
use crate::operation::backend::{Backend, CompletionReport, FailedJob};
use crate::operation::correlation::CorrelationRegistry;
use crate::operation::store_backend::DEFAULT_MAX_WAIT;
use crate::operation::Submission;
use crate::store::model::{JobFailure, JobType};

/// Transport for conversion requests.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        service: &str,
        correlation_id: &str,
        submission: &Submission,
    ) -> Result<(), OperationError>;
}

/// A converter's answer to one published request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result_type", rename_all = "snake_case")]
pub enum BusReply {
    Result {
        correlation_id: String,
        output_file: String,
        data: Vec<u8>,
    },
    Error {
        correlation_id: String,
        input_file: String,
        output_file: String,
        failure: JobFailure,
    },
}

impl BusReply {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Result { correlation_id, .. } | Self::Error { correlation_id, .. } => {
                correlation_id
            }
        }
    }
}

/// Publishes each submission and tracks it until its reply arrives.
pub struct MessageBusBackend {
    bus: Arc<dyn MessageBus>,
    correlations: Arc<CorrelationRegistry>,
    workspace: PathBuf,
    max_wait: Duration,
    completed: AtomicUsize,
    failures: Mutex<Vec<FailedJob>>,
}

impl MessageBusBackend {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        correlations: Arc<CorrelationRegistry>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            bus,
            correlations,
            workspace: workspace.into(),
            max_wait: DEFAULT_MAX_WAIT,
            completed: AtomicUsize::new(0),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn correlations(&self) -> &Arc<CorrelationRegistry> {
        &self.correlations
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Resolve the request a reply answers.
    ///
    /// Results are written to their output file; errors are kept for the
    /// next completion report. The correlation record is removed either way.
    pub async fn handle_reply(&self, reply: BusReply) -> Result<(), OperationError> {
        let correlation_id = reply.correlation_id().to_string();
        let outcome = match reply {
            BusReply::Result {
                output_file, data, ..
            } => {
                let target = self.resolve(&output_file);
                let written = async {
                    if let Some(dir) = target.parent() {
                        tokio::fs::create_dir_all(dir).await?;
                    }
                    tokio::fs::write(&target, &data).await
                }
                .await;
                match written {
                    Ok(()) => {
                        self.correlations.note_dependency(
                            &correlation_id,
                            serde_json::json!({ "output_file": output_file, "bytes": data.len() }),
                        );
                        self.completed.fetch_add(1, Ordering::Relaxed);
                        debug!(%correlation_id, output = %target.display(), "Reply written");
                        Ok(())
                    }
                    Err(e) => {
                        error!(%correlation_id, output = %target.display(), "Writing reply failed: {e}");
                        Err(OperationError::Io(e))
                    }
                }
            }
            BusReply::Error {
                input_file,
                output_file,
                failure,
                ..
            } => {
                warn!(%correlation_id, input = %input_file, "Converter reported an error");
                self.lock_failures().push(FailedJob {
                    job_id: None,
                    correlation_id: Some(correlation_id.clone()),
                    job_type: failure.worker_type,
                    input_file,
                    output_file,
                    failure,
                });
                Ok(())
            }
        };
        self.correlations.remove(&correlation_id);
        outcome
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, Vec<FailedJob>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Backend for MessageBusBackend {
    async fn execute_operation(&self, submission: &Submission) -> Result<(), OperationError> {
        let job_type: JobType = submission.job_type()?;
        let correlation_id = match &submission.correlation_id {
            Some(id) => {
                self.correlations.register(id.clone(), submission.input_file.clone());
                id.clone()
            }
            None => self.correlations.new_id(submission.input_file.clone()),
        };
        if let Err(e) = self
            .bus
            .publish(&submission.service, &correlation_id, submission)
            .await
        {
            self.correlations.remove(&correlation_id);
            return Err(e);
        }
        debug!(%correlation_id, %job_type, input = %submission.input_file, "Published");
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        timeout: Option<Duration>,
    ) -> Result<CompletionReport, OperationError> {
        let timeout = timeout.unwrap_or(self.max_wait);
        if !self.correlations.wait_for_completion(timeout).await {
            return Err(OperationError::Timeout(timeout));
        }
        Ok(CompletionReport {
            completed: self.completed.swap(0, Ordering::Relaxed),
            cancelled: 0,
            failed: std::mem::take(&mut *self.lock_failures()),
        })
    }
}
