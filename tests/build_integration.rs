//! End-to-end builds: a worker pool drains staged operations submitted
//! through the store backend.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;

use courseflow::config::{PoolConfig, WorkerRuntimeConfig};
use courseflow::error::{Error, OperationError, WorkerError};
use courseflow::operation::{
    Backend, CompletionReport, CopySpec, ExecutionStage, StagedPlan, StoreBackend, Submission,
};
use courseflow::pool::{InProcessExecutor, WorkerPoolManager};
use courseflow::store::model::{ExecutionMode, Job, JobType};
use courseflow::store::{JobStore, LocalQueue};
use courseflow::subprocess::RetryPolicy;
use courseflow::worker::{Converter, ExecutionContext, JobHandler, NotebookConverter};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

struct CopyInput;

#[async_trait]
impl JobHandler for CopyInput {
    async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        if job.input_file.starts_with("broken") {
            return Err(WorkerError::Conversion(format!("cannot parse {}", job.input_file)).into());
        }
        tokio::fs::copy(ctx.resolve(&job.input_file), output)
            .await
            .map_err(|e| WorkerError::Conversion(e.to_string()))?;
        Ok(None)
    }
}

fn runtime() -> WorkerRuntimeConfig {
    WorkerRuntimeConfig {
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// In-process pool of `count` workers per type, converting with `converter`.
async fn pool(
    dir: &Path,
    store: &JobStore,
    count: usize,
    converter: impl Fn(JobType) -> Converter + Send + Sync + 'static,
) -> Arc<WorkerPoolManager> {
    let queue = Arc::new(LocalQueue::new(store.clone()));
    let executor = InProcessExecutor::new(queue, dir)
        .with_runtime(runtime())
        .with_converters(converter);
    let config = PoolConfig {
        default_execution_mode: ExecutionMode::InProcess,
        default_worker_count: count,
        startup_timeout: 5,
        state_file: dir.join("state.json"),
        ..Default::default()
    };
    Arc::new(
        WorkerPoolManager::new(config, store.clone(), dir.join("jobs.db"))
            .with_executor(Arc::new(executor)),
    )
}

fn backend(store: &JobStore, dir: &Path) -> StoreBackend {
    StoreBackend::new(store.clone(), dir)
        .with_poll_interval(Duration::from_millis(20))
        .with_max_wait(Duration::from_secs(20))
}

fn diagram(input: &str) -> Submission {
    Submission::new(
        JobType::PlantUml,
        input,
        format!("img/{input}.png"),
        format!("hash-{input}"),
        json!({"output_format": "png"}),
    )
}

#[tokio::test]
async fn two_workers_drain_three_jobs() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.pu", "b.pu", "c.pu"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let store = JobStore::new_memory().await.unwrap();
        let pool = pool(dir.path(), &store, 2, |_| Converter::custom(CopyInput)).await;
        assert_eq!(pool.start(&[JobType::PlantUml]).await.unwrap().len(), 2);

        let mut plan = StagedPlan::with_max_concurrency(8);
        for name in ["a.pu", "b.pu", "c.pu"] {
            assert_eq!(plan.add_submission(diagram(name)), ExecutionStage::Images);
        }
        plan.add_copy(CopySpec::new(
            dir.path().join("a.pu"),
            dir.path().join("public/a.pu"),
        ));

        let report = plan.execute(&backend(&store, dir.path())).await.unwrap();
        assert_eq!(report.completed, 3);
        assert!(report.is_success());
        for name in ["a.pu", "b.pu", "c.pu"] {
            let out = dir.path().join(format!("img/{name}.png"));
            assert_eq!(std::fs::read_to_string(out).unwrap(), name);
        }
        assert!(dir.path().join("public/a.pu").exists());
        assert_eq!(store.counts().await.unwrap().completed, 3);

        assert_eq!(pool.stop().await.unwrap(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_job_is_reported_not_raised() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.pu"), "ok").unwrap();
        let store = JobStore::new_memory().await.unwrap();
        let pool = pool(dir.path(), &store, 1, |_| Converter::custom(CopyInput)).await;
        pool.start(&[JobType::PlantUml]).await.unwrap();

        let mut plan = StagedPlan::with_max_concurrency(4);
        plan.add_submission(diagram("ok.pu"));
        plan.add_submission(diagram("broken.pu"));

        let report = plan.execute(&backend(&store, dir.path())).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed.len(), 1);
        let failed = &report.failed[0];
        assert_eq!(failed.input_file, "broken.pu");
        assert!(failed.failure.error_message.contains("cannot parse"));

        pool.stop().await.unwrap();
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn completed_html_reuses_the_speaker_execution() {
    reuse_speaker_execution(json!({"source_hash": "src-1"})).await;
}

#[tokio::test]
async fn execution_reuse_works_without_source_hash() {
    reuse_speaker_execution(json!({})).await;
}

async fn reuse_speaker_execution(extra: serde_json::Value) {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("executions.log");
        std::fs::write(dir.path().join("slides.py"), "print('hi')").unwrap();

        let sh = |script: String| vec!["sh".to_string(), "-c".to_string(), script];
        let notebooks = NotebookConverter::new(
            sh(format!(
                "echo run >> {}; cp {{input}} {{executed}}",
                runs.display()
            )),
            sh("cp {executed} {output}".into()),
            RetryPolicy {
                max_retries: 1,
                base_timeout: Duration::from_secs(10),
                ..RetryPolicy::default()
            },
        );

        let store = JobStore::new_memory().await.unwrap();
        let pool = pool(dir.path(), &store, 1, move |_| {
            Converter::Notebook(notebooks.clone())
        })
        .await;
        pool.start(&[JobType::Notebook]).await.unwrap();

        let html = |kind: &str, hash: &str| {
            let mut payload = json!({"kind": kind, "format": "html"});
            if let (Some(p), Some(e)) = (payload.as_object_mut(), extra.as_object()) {
                p.extend(e.clone());
            }
            Submission::new(
                JobType::Notebook,
                "slides.py",
                format!("{kind}/slides.html"),
                hash,
                payload,
            )
        };
        let mut plan = StagedPlan::with_max_concurrency(4);
        assert_eq!(plan.add_submission(html("completed", "h2")), ExecutionStage::CompletedHtml);
        assert_eq!(plan.add_submission(html("speaker", "h1")), ExecutionStage::SpeakerHtml);

        let report = plan.execute(&backend(&store, dir.path())).await.unwrap();
        assert_eq!(report.completed, 2);
        for kind in ["speaker", "completed"] {
            let out = dir.path().join(format!("{kind}/slides.html"));
            assert_eq!(std::fs::read_to_string(out).unwrap(), "print('hi')");
        }
        let executions = std::fs::read_to_string(&runs).unwrap();
        assert_eq!(executions.lines().count(), 1, "notebook executed once");

        pool.stop().await.unwrap();
    })
    .await
    .expect("test timed out");
}

/// Records peak parallelism of submissions.
#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Backend for Gauge {
    async fn execute_operation(&self, s: &Submission) -> Result<(), OperationError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(s.input_file.clone());
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        _timeout: Option<Duration>,
    ) -> Result<CompletionReport, OperationError> {
        Ok(CompletionReport::default())
    }
}

#[tokio::test]
async fn fan_out_stays_within_bound() {
    timeout(TEST_TIMEOUT, async {
        let mut plan = StagedPlan::with_max_concurrency(3);
        for i in 0..30 {
            plan.add_submission(diagram(&format!("d{i}.pu")));
        }
        let gauge = Gauge::default();
        plan.execute(&gauge).await.unwrap();

        assert_eq!(gauge.seen.lock().unwrap().len(), 30);
        let peak = gauge.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak {peak} exceeded bound");
        assert!(peak >= 2);
    })
    .await
    .expect("test timed out");
}
