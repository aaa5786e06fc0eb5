//! Conversion workers.
//!
//! Core components:
//! - `state`: Worker lifecycle (Starting → Polling ⇄ Executing → Stopping → Stopped)
//! - `context`: ExecutionContext reused across every job of a worker
//! - `converter`: Job-type converters (notebook, diagram, custom handler)
//! - `failure`: Categorized failures with operator guidance
//! - `worker`: The claim/execute/report loop

pub mod context;
pub mod converter;
pub mod failure;
pub mod state;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::api::client::RemoteQueue;
use crate::config::{WorkerEnv, WorkerRuntimeConfig};
use crate::error::{ConfigError, Error};
use crate::store::JobStore;
use crate::store::model::ExecutionMode;
use crate::store::traits::{JobQueue, LocalQueue};

pub use context::ExecutionContext;
pub use converter::{Converter, DiagramConverter, JobHandler, NotebookConverter};
pub use state::{Lifecycle, WorkerState};
pub use worker::{Worker, WorkerStats};

/// Run one worker process configured from its environment.
///
/// The queue is the store file when `DB_PATH` is set, otherwise the remote
/// API at `API_URL`. SIGTERM and Ctrl-C request a graceful stop.
pub async fn run_from_env() -> Result<WorkerStats, Error> {
    let env = WorkerEnv::from_env()?;
    let config = WorkerRuntimeConfig::from_env()?;

    let (queue, mode): (Arc<dyn JobQueue>, ExecutionMode) = if let Some(db_path) = &env.db_path {
        let store = JobStore::open(db_path).await?;
        (Arc::new(LocalQueue::new(store)), ExecutionMode::Direct)
    } else if let Some(url) = &env.api_url {
        (Arc::new(RemoteQueue::new(url)?), ExecutionMode::Docker)
    } else {
        return Err(ConfigError::MissingEnvVar("DB_PATH or API_URL".into()).into());
    };
    info!(
        job_type = %env.worker_type,
        executor_id = %env.executor_id,
        %mode,
        "Worker process starting"
    );

    let worker = match env.worker_id {
        Some(id) => {
            Worker::attach(queue, env.worker_type, id, &env.workspace_path, config).await?
        }
        None => {
            Worker::register(
                queue,
                env.worker_type,
                &env.executor_id,
                mode,
                &env.workspace_path,
                config,
            )
            .await?
        }
    }
    .with_host_workspace(env.host_workspace.clone());

    spawn_signal_listener(worker.stop_flag());
    worker.run().await
}

fn spawn_signal_listener(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, finishing in-flight job");
        stop.store(true, Ordering::Relaxed);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
