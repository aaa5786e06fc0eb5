//! Operation trees and the backends that carry them out.
//!
//! - `backend`: The `Backend` extension point and completion reports
//! - `store_backend`: Backend that enqueues jobs in the job store
//! - `bus_backend`: Backend that publishes to a message bus
//! - `correlation`: Outstanding-request registry for the bus backend
//! - `staging`: Four-stage ordering of a course build

pub mod backend;
pub mod bus_backend;
pub mod correlation;
pub mod staging;
pub mod store_backend;

use std::path::PathBuf;

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::max_concurrency_from_env;
use crate::error::OperationError;
use crate::store::model::JobType;

pub use backend::{Backend, CompletionReport, FailedJob};
pub use bus_backend::{BusReply, MessageBus, MessageBusBackend};
pub use correlation::{CorrelationRecord, CorrelationRegistry};
pub use staging::{ExecutionStage, StagedPlan, stage_for};
pub use store_backend::StoreBackend;

/// A request to convert one input into one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Converter service, e.g. `notebook-processor`.
    pub service: String,
    pub input_file: String,
    pub output_file: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: i64,
}

impl Submission {
    pub fn new(
        job_type: JobType,
        input_file: impl Into<String>,
        output_file: impl Into<String>,
        content_hash: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            service: job_type.service_name().to_string(),
            input_file: input_file.into(),
            output_file: output_file.into(),
            content_hash: content_hash.into(),
            payload,
            correlation_id: None,
            priority: 0,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Job type for the requested service.
    pub fn job_type(&self) -> Result<JobType, OperationError> {
        JobType::from_service(&self.service)
            .ok_or_else(|| OperationError::UnknownService(self.service.clone()))
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// A plain file copy into the output tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopySpec {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl CopySpec {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A node in a build's operation tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    NoOp,
    Submit(Submission),
    Copy(CopySpec),
    /// Children in order; the first error stops the sequence.
    Sequential(Vec<Operation>),
    /// Children side by side, at most `max_concurrency` at a time.
    /// `None` runs all of them at once.
    Concurrent {
        ops: Vec<Operation>,
        max_concurrency: Option<usize>,
    },
}

impl Operation {
    /// Concurrent group bounded by `COURSEFLOW_MAX_CONCURRENCY` (default 50).
    pub fn concurrent(ops: Vec<Operation>) -> Self {
        Self::Concurrent {
            ops,
            max_concurrency: Some(max_concurrency_from_env()),
        }
    }

    pub fn bounded(ops: Vec<Operation>, max_concurrency: usize) -> Self {
        Self::Concurrent {
            ops,
            max_concurrency: Some(max_concurrency.max(1)),
        }
    }

    pub fn unbounded(ops: Vec<Operation>) -> Self {
        Self::Concurrent {
            ops,
            max_concurrency: None,
        }
    }

    /// Number of submissions and copies in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::NoOp => 0,
            Self::Submit(_) | Self::Copy(_) => 1,
            Self::Sequential(ops) | Self::Concurrent { ops, .. } => {
                ops.iter().map(Operation::leaf_count).sum()
            }
        }
    }

    /// Hand the tree to `backend`.
    ///
    /// Submissions return once the backend has accepted them; completion is
    /// observed through [`Backend::wait_for_completion`].
    pub fn execute<'a>(&'a self, backend: &'a dyn Backend) -> BoxFuture<'a, Result<(), OperationError>> {
        async move {
            match self {
                Self::NoOp => Ok(()),
                Self::Submit(submission) => backend.execute_operation(submission).await,
                Self::Copy(copy) => backend.copy_file(copy).await,
                Self::Sequential(ops) => {
                    for op in ops {
                        op.execute(backend).await?;
                    }
                    Ok(())
                }
                Self::Concurrent {
                    ops,
                    max_concurrency,
                } => run_concurrent(ops, *max_concurrency, backend).await,
            }
        }
        .boxed()
    }
}

async fn run_concurrent(
    ops: &[Operation],
    max_concurrency: Option<usize>,
    backend: &dyn Backend,
) -> Result<(), OperationError> {
    let results = match max_concurrency {
        None => futures::future::join_all(ops.iter().map(|op| op.execute(backend))).await,
        Some(limit) => {
            let semaphore = Semaphore::new(limit.max(1));
            let semaphore = &semaphore;
            futures::future::join_all(ops.iter().map(|op| async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| OperationError::Backend(format!("semaphore closed: {e}")))?;
                op.execute(backend).await
            }))
            .await
        }
    };

    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(()) => {}
            Err(OperationError::Aggregate(nested)) => errors.extend(nested),
            Err(e) => errors.push(e),
        }
    }
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        n => {
            debug!(failed = n, total = ops.len(), "Concurrent group had failures");
            Err(OperationError::Aggregate(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records submissions and tracks how many run at once.
    #[derive(Default)]
    struct Probe {
        running: AtomicUsize,
        peak: AtomicUsize,
        seen: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Backend for Probe {
        async fn execute_operation(&self, s: &Submission) -> Result<(), OperationError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(s.input_file.clone());
            if self.fail_on.is_some_and(|f| s.input_file.starts_with(f)) {
                return Err(OperationError::Backend(format!("rejected {}", s.input_file)));
            }
            Ok(())
        }

        async fn wait_for_completion(
            &self,
            _timeout: Option<Duration>,
        ) -> Result<CompletionReport, OperationError> {
            Ok(CompletionReport::default())
        }
    }

    fn submit(name: &str) -> Operation {
        Operation::Submit(Submission::new(
            JobType::PlantUml,
            name,
            format!("out/{name}.png"),
            "h",
            serde_json::json!({}),
        ))
    }

    #[tokio::test]
    async fn concurrent_respects_bound() {
        let probe = Probe::default();
        let ops = (0..40).map(|i| submit(&format!("d{i}"))).collect();
        Operation::bounded(ops, 4).execute(&probe).await.unwrap();
        assert_eq!(probe.seen.lock().unwrap().len(), 40);
        assert!(probe.peak.load(Ordering::SeqCst) <= 4);
        assert!(probe.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn sequential_stops_at_first_error() {
        let probe = Probe {
            fail_on: Some("bad"),
            ..Default::default()
        };
        let op = Operation::Sequential(vec![submit("a"), submit("bad"), submit("c")]);
        assert!(op.execute(&probe).await.is_err());
        assert_eq!(*probe.seen.lock().unwrap(), vec!["a", "bad"]);
    }

    #[tokio::test]
    async fn concurrent_runs_everything_and_aggregates() {
        let probe = Probe {
            fail_on: Some("bad"),
            ..Default::default()
        };
        let op = Operation::unbounded(vec![
            submit("bad1"),
            submit("ok"),
            Operation::unbounded(vec![submit("bad2"), Operation::NoOp]),
        ]);
        match op.execute(&probe).await {
            Err(OperationError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate, got {other:?}"),
        }
        assert_eq!(probe.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn unknown_service_is_rejected() {
        let mut s = Submission::new(JobType::Notebook, "a.py", "a.html", "h", serde_json::json!({}));
        assert_eq!(s.job_type().unwrap(), JobType::Notebook);
        s.service = "pdf-renderer".into();
        assert!(matches!(s.job_type(), Err(OperationError::UnknownService(_))));
    }

    #[test]
    fn leaf_count_walks_tree() {
        let op = Operation::Sequential(vec![
            submit("a"),
            Operation::concurrent(vec![submit("b"), Operation::NoOp, submit("c")]),
        ]);
        assert_eq!(op.leaf_count(), 3);
    }
}
