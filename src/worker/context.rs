//! Execution context shared by every job a worker runs.
//!
//! Built once at worker start and reused across iterations: the queue handle,
//! the subprocess runner and the scratch area stay alive for the whole life
//! of the worker instead of being set up per job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::WorkerError;
use crate::store::model::{Job, JobType};
use crate::store::traits::JobQueue;
use crate::subprocess::SubprocessRunner;

/// Per-worker state reused for every job.
pub struct ExecutionContext {
    worker_id: i64,
    job_type: JobType,
    queue: Arc<dyn JobQueue>,
    runner: SubprocessRunner,
    workspace: PathBuf,
    /// Host path that is mounted at `workspace` when running in a container.
    host_workspace: Option<PathBuf>,
    scratch_root: PathBuf,
    jobs_started: AtomicU64,
}

impl ExecutionContext {
    pub fn new(
        worker_id: i64,
        job_type: JobType,
        queue: Arc<dyn JobQueue>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        let workspace = workspace.into();
        let scratch_root = workspace
            .join(".courseflow")
            .join("scratch")
            .join(format!("{job_type}-{worker_id}"));
        Self {
            worker_id,
            job_type,
            queue,
            runner: SubprocessRunner::new(),
            workspace,
            host_workspace: None,
            scratch_root,
            jobs_started: AtomicU64::new(0),
        }
    }

    /// Map absolute host paths under `host` onto the workspace.
    pub fn with_host_workspace(mut self, host: Option<PathBuf>) -> Self {
        self.host_workspace = host;
        self
    }

    pub fn with_runner(mut self, runner: SubprocessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn worker_id(&self) -> i64 {
        self.worker_id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn runner(&self) -> &SubprocessRunner {
        &self.runner
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn jobs_started(&self) -> u64 {
        self.jobs_started.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_job(&self) -> u64 {
        self.jobs_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resolve a path stored on a job row to a local path.
    pub fn resolve(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if let Some(host) = &self.host_workspace {
            if let Ok(rel) = path.strip_prefix(host) {
                return self.workspace.join(rel);
            }
        }
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Private scratch directory for one job; created on demand.
    pub async fn scratch_dir(&self, job: &Job) -> Result<PathBuf, WorkerError> {
        let dir = self.scratch_root.join(job.id.to_string());
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            WorkerError::Conversion(format!("creating scratch dir {}: {e}", dir.display()))
        })?;
        Ok(dir)
    }

    /// Where a converter writes its result before the worker commits it.
    pub async fn staged_output(&self, job: &Job) -> Result<PathBuf, WorkerError> {
        let dir = self.scratch_dir(job).await?;
        let name = Path::new(&job.output_file)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "output".into());
        Ok(dir.join(name))
    }

    /// Move a staged result to the job's output path.
    pub async fn commit_output(&self, job: &Job, staged: &Path) -> Result<PathBuf, WorkerError> {
        let target = self.resolve(&job.output_file);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                WorkerError::Conversion(format!("creating {}: {e}", parent.display()))
            })?;
        }
        if tokio::fs::rename(staged, &target).await.is_err() {
            // Scratch and output may sit on different filesystems.
            tokio::fs::copy(staged, &target).await.map_err(|e| {
                WorkerError::Conversion(format!("writing {}: {e}", target.display()))
            })?;
        }
        Ok(target)
    }

    /// Remove a job's scratch directory.
    pub async fn discard_scratch(&self, job: &Job) {
        let dir = self.scratch_root.join(job.id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(job_id = job.id, "Scratch cleanup failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::jobs::JobStore;
    use crate::store::model::NewJob;
    use crate::store::traits::LocalQueue;

    async fn setup(dir: &Path) -> (ExecutionContext, Job) {
        let store = JobStore::new_memory().await.unwrap();
        let id = store
            .enqueue(NewJob::new(
                JobType::PlantUml,
                "diagrams/a.pu",
                "out/img/a.png",
                "h",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap().unwrap();
        let ctx = ExecutionContext::new(7, JobType::PlantUml, Arc::new(LocalQueue::new(store)), dir);
        (ctx, job)
    }

    #[tokio::test]
    async fn resolves_relative_and_host_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = setup(dir.path()).await;
        assert_eq!(ctx.resolve("a/b.py"), dir.path().join("a/b.py"));
        assert_eq!(ctx.resolve("/abs/b.py"), PathBuf::from("/abs/b.py"));

        let ctx = ctx.with_host_workspace(Some(PathBuf::from("/home/me/course")));
        assert_eq!(
            ctx.resolve("/home/me/course/slides/x.py"),
            dir.path().join("slides/x.py")
        );
    }

    #[tokio::test]
    async fn staged_output_is_committed_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, job) = setup(dir.path()).await;

        let staged = ctx.staged_output(&job).await.unwrap();
        assert_eq!(staged.file_name().unwrap(), "a.png");
        tokio::fs::write(&staged, b"png").await.unwrap();

        let target = ctx.commit_output(&job, &staged).await.unwrap();
        assert_eq!(target, dir.path().join("out/img/a.png"));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"png");

        ctx.discard_scratch(&job).await;
        assert!(!staged.parent().unwrap().exists());
    }
}
