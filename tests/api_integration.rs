//! Integration tests for the worker API.
//!
//! Each test spins up the Axum server on a random port and talks to it
//! through `RemoteQueue`, the same client containerized workers use.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tower::ServiceExt;

use courseflow::api::{RemoteQueue, api_routes};
use courseflow::config::WorkerRuntimeConfig;
use courseflow::error::{ApiError, Error, WorkerError};
use courseflow::store::model::{
    ExecutionMode, Job, JobOutcome, JobStatus, JobType, NewJob, ReportedStatus, WorkerStatus,
};
use courseflow::store::{ExecutionKey, JobQueue, JobStore, LocalQueue};
use courseflow::worker::{Converter, ExecutionContext, JobHandler, Worker};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the API on a random port, return (base url, store).
async fn start_server() -> (String, JobStore) {
    let store = JobStore::new_memory().await.unwrap();
    let app = api_routes(LocalQueue::new(store.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), store)
}

#[tokio::test]
async fn health_route_answers() {
    timeout(TEST_TIMEOUT, async {
        let store = JobStore::new_memory().await.unwrap();
        let app = api_routes(LocalQueue::new(store));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn remote_queue_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let (url, store) = start_server().await;
        let queue = RemoteQueue::new(&url).unwrap();
        assert!(queue.is_healthy().await);

        let worker_id = queue
            .register_worker(JobType::PlantUml, "docker-plantuml-0", ExecutionMode::Docker)
            .await
            .unwrap();
        queue.heartbeat(worker_id, Some(12.5), Some(300.0)).await.unwrap();
        queue.set_worker_status(worker_id, WorkerStatus::Busy).await.unwrap();
        let record = store.registry().get(worker_id).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Busy);
        assert_eq!(record.execution_mode, Some(ExecutionMode::Docker));

        assert!(queue.claim_next(JobType::PlantUml, worker_id).await.unwrap().is_none());
        let id = store
            .enqueue(
                NewJob::new(JobType::PlantUml, "a.pu", "img/a.png", "h", json!({"output_format": "png"}))
                    .with_correlation_id("corr-7"),
            )
            .await
            .unwrap();

        let job = queue.claim_next(JobType::PlantUml, worker_id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.correlation_id.as_deref(), Some("corr-7"));
        assert!(!queue.is_cancelled(id).await.unwrap());

        let reported = queue
            .report_status(id, &JobOutcome::Completed { result: Some(json!({"pages": 1})) })
            .await
            .unwrap();
        assert_eq!(reported, ReportedStatus::Completed);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Completed);

        queue
            .record_job_outcome(worker_id, true, Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(store.registry().get(worker_id).await.unwrap().unwrap().jobs_processed, 1);

        queue.put_cached("img/a.png", "h", &json!({"pages": 1})).await.unwrap();
        let entry = queue.get_cached("img/a.png", "h").await.unwrap().unwrap();
        assert_eq!(entry.result_metadata, json!({"pages": 1}));
        assert!(queue.get_cached("img/a.png", "other").await.unwrap().is_none());

        let key = ExecutionKey {
            input_file: "slides.py".into(),
            source_hash: "src".into(),
            language: "en".into(),
            prog_lang: "python".into(),
        };
        assert!(queue.get_executed(&key).await.unwrap().is_none());
        queue.put_executed(&key, b"{\"cells\": []}").await.unwrap();
        assert_eq!(
            queue.get_executed(&key).await.unwrap().as_deref(),
            Some(&b"{\"cells\": []}"[..])
        );

        queue.unregister_worker(worker_id, "test over").await.unwrap();
        let record = store.registry().get(worker_id).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Dead);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn store_errors_map_to_status_codes() {
    timeout(TEST_TIMEOUT, async {
        let (url, store) = start_server().await;
        let queue = RemoteQueue::new(&url).unwrap();

        let err = queue.is_cancelled(4242).await.unwrap_err();
        assert!(matches!(err, Error::Api(ApiError::Status { status: 404, .. })));

        // Reporting a job nobody claimed is a conflict, not a server error.
        let id = store
            .enqueue(NewJob::new(JobType::DrawIo, "d.drawio", "d.png", "h", json!({})))
            .await
            .unwrap();
        let err = queue
            .report_status(id, &JobOutcome::Completed { result: None })
            .await
            .unwrap_err();
        match err {
            Error::Api(ApiError::Status { status, body }) => {
                assert_eq!(status, 409);
                assert!(body.contains(&id.to_string()));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

struct Upper;

#[async_trait]
impl JobHandler for Upper {
    async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        let text = tokio::fs::read_to_string(ctx.resolve(&job.input_file))
            .await
            .map_err(|e| WorkerError::Conversion(e.to_string()))?;
        tokio::fs::write(output, text.to_uppercase())
            .await
            .map_err(|e| WorkerError::Conversion(e.to_string()))?;
        Ok(None)
    }
}

#[tokio::test]
async fn worker_drains_queue_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (url, store) = start_server().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.drawio"), "diagram").unwrap();

        let queue: Arc<dyn JobQueue> = Arc::new(RemoteQueue::new(&url).unwrap());
        let worker = Worker::register(
            queue,
            JobType::DrawIo,
            "docker-drawio-0",
            ExecutionMode::Docker,
            dir.path(),
            WorkerRuntimeConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .with_converter(Converter::custom(Upper));
        let stop = worker.stop_flag();
        let handle = tokio::spawn(worker.run());

        let id = store
            .enqueue(NewJob::new(JobType::DrawIo, "a.drawio", "img/a.png", "h", json!({})))
            .await
            .unwrap();
        loop {
            if store.get_job(id).await.unwrap().unwrap().status == JobStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("img/a.png")).unwrap(),
            "DIAGRAM"
        );
        assert!(store.get_cached("img/a.png", "h").await.unwrap().is_some());

        stop.store(true, Ordering::Relaxed);
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.completed, 1);
    })
    .await
    .expect("test timed out");
}
