//! Ordering of a course build into execution stages.
//!
//! Images come first so the HTML that embeds them can find them; speaker
//! notebooks run before completed ones so the completed render reuses the
//! executed notebook the speaker run stored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use tracing::info;

use crate::config::max_concurrency_from_env;
use crate::error::OperationError;
use crate::operation::backend::{Backend, CompletionReport};
use crate::operation::{CopySpec, Operation, Submission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionStage {
    Images = 1,
    CopyImages = 2,
    SpeakerHtml = 3,
    CompletedHtml = 4,
}

impl ExecutionStage {
    pub const ALL: [ExecutionStage; 4] = [
        Self::Images,
        Self::CopyImages,
        Self::SpeakerHtml,
        Self::CompletedHtml,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::CopyImages => "copy-images",
            Self::SpeakerHtml => "speaker-html",
            Self::CompletedHtml => "completed-html",
        }
    }

    /// Whether the next stage must wait until this one has finished.
    pub fn awaits_completion(self) -> bool {
        matches!(self, Self::SpeakerHtml)
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.name())
    }
}

/// Stage for an output of `format`. `kind` only matters for HTML.
pub fn stage_for(format: &str, kind: Option<&str>) -> ExecutionStage {
    if !format.eq_ignore_ascii_case("html") {
        return ExecutionStage::Images;
    }
    match kind {
        None | Some("completed") => ExecutionStage::CompletedHtml,
        Some(_) => ExecutionStage::SpeakerHtml,
    }
}

/// Operations grouped by stage.
#[derive(Debug, Clone)]
pub struct StagedPlan {
    stages: BTreeMap<ExecutionStage, Vec<Operation>>,
    max_concurrency: usize,
}

impl Default for StagedPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl StagedPlan {
    pub fn new() -> Self {
        Self::with_max_concurrency(max_concurrency_from_env())
    }

    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            stages: BTreeMap::new(),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn add(&mut self, stage: ExecutionStage, op: Operation) {
        self.stages.entry(stage).or_default().push(op);
    }

    /// Add a submission, staged by its payload's format and kind.
    pub fn add_submission(&mut self, submission: Submission) -> ExecutionStage {
        let format = submission
            .payload_str("format")
            .or_else(|| submission.payload_str("output_format"))
            .map(str::to_string)
            .or_else(|| {
                Path::new(&submission.output_file)
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let stage = stage_for(&format, submission.payload_str("kind"));
        self.add(stage, Operation::Submit(submission));
        stage
    }

    /// Copy of a generated image; runs once the images stage is done.
    pub fn add_copy(&mut self, copy: CopySpec) {
        self.add(ExecutionStage::CopyImages, Operation::Copy(copy));
    }

    /// Copy of a source file that depends on no generated output.
    pub fn add_plain_copy(&mut self, copy: CopySpec) {
        self.add(ExecutionStage::Images, Operation::Copy(copy));
    }

    pub fn ops(&self, stage: ExecutionStage) -> &[Operation] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn leaf_count(&self) -> usize {
        self.stages.values().flatten().map(Operation::leaf_count).sum()
    }

    /// Run the stages in order and wait for everything submitted.
    ///
    /// Empty stages are skipped. Submission errors stop the build before
    /// later stages are handed to the backend.
    pub async fn execute(&self, backend: &dyn Backend) -> Result<CompletionReport, OperationError> {
        let mut report = CompletionReport::default();
        for stage in ExecutionStage::ALL {
            let ops = self.ops(stage);
            if ops.is_empty() {
                continue;
            }
            info!(stage = %stage, operations = ops.len(), "Starting stage");
            Operation::bounded(ops.to_vec(), self.max_concurrency)
                .execute(backend)
                .await?;
            if stage.awaits_completion() {
                report.merge(backend.wait_for_completion(None).await?);
            }
        }
        report.merge(backend.wait_for_completion(None).await?);
        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            failed = report.failed.len(),
            "Build finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::JobType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Logs submissions and waits in call order.
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Backend for Journal {
        async fn execute_operation(&self, s: &Submission) -> Result<(), OperationError> {
            self.events.lock().unwrap().push(s.output_file.clone());
            Ok(())
        }

        async fn copy_file(&self, copy: &CopySpec) -> Result<(), OperationError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("copy {}", copy.target.display()));
            Ok(())
        }

        async fn wait_for_completion(
            &self,
            _timeout: Option<Duration>,
        ) -> Result<CompletionReport, OperationError> {
            let mut events = self.events.lock().unwrap();
            let completed = events.iter().filter(|e| !e.starts_with("wait")).count();
            events.push("wait".into());
            Ok(CompletionReport {
                completed,
                ..Default::default()
            })
        }
    }

    fn notebook(kind: &str, format: &str) -> Submission {
        Submission::new(
            JobType::Notebook,
            "slides.py",
            format!("{kind}.{format}"),
            "h",
            json!({"kind": kind, "format": format}),
        )
    }

    #[test]
    fn stages_follow_format_and_kind() {
        assert_eq!(stage_for("png", None), ExecutionStage::Images);
        assert_eq!(stage_for("svg", Some("speaker")), ExecutionStage::Images);
        assert_eq!(stage_for("ipynb", Some("completed")), ExecutionStage::Images);
        assert_eq!(stage_for("html", Some("speaker")), ExecutionStage::SpeakerHtml);
        assert_eq!(stage_for("html", Some("code-along")), ExecutionStage::SpeakerHtml);
        assert_eq!(stage_for("html", Some("completed")), ExecutionStage::CompletedHtml);
        assert_eq!(stage_for("HTML", None), ExecutionStage::CompletedHtml);
    }

    #[test]
    fn submissions_without_format_use_output_extension() {
        let mut plan = StagedPlan::with_max_concurrency(4);
        let diagram = Submission::new(JobType::PlantUml, "a.pu", "img/a.png", "h", json!({}));
        assert_eq!(plan.add_submission(diagram), ExecutionStage::Images);
        let completed = Submission::new(JobType::Notebook, "n.py", "n.html", "h", json!({}));
        assert_eq!(plan.add_submission(completed), ExecutionStage::CompletedHtml);
        plan.add_copy(CopySpec::new("img/a.png", "out/img/a.png"));
        assert_eq!(plan.leaf_count(), 3);
        assert_eq!(plan.ops(ExecutionStage::CopyImages).len(), 1);
    }

    #[tokio::test]
    async fn speaker_stage_finishes_before_completed_stage() {
        let mut plan = StagedPlan::with_max_concurrency(2);
        plan.add_submission(notebook("completed", "html"));
        plan.add_submission(notebook("speaker", "html"));
        plan.add_copy(CopySpec::new("a.png", "out/a.png"));
        plan.add_submission(Submission::new(
            JobType::DrawIo,
            "a.drawio",
            "a.png",
            "h",
            json!({"output_format": "png"}),
        ));

        let backend = Journal::default();
        let report = plan.execute(&backend).await.unwrap();

        let events = backend.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "a.png",
                "copy out/a.png",
                "speaker.html",
                "wait",
                "completed.html",
                "wait"
            ]
        );
        assert_eq!(report.completed, 3 + 4);
    }

    #[tokio::test]
    async fn plain_copies_run_with_the_images() {
        let mut plan = StagedPlan::with_max_concurrency(1);
        plan.add_copy(CopySpec::new("img/a.png", "out/img/a.png"));
        plan.add_plain_copy(CopySpec::new("data/table.csv", "out/data/table.csv"));
        assert_eq!(plan.ops(ExecutionStage::Images).len(), 1);
        assert_eq!(plan.ops(ExecutionStage::CopyImages).len(), 1);

        let backend = Journal::default();
        plan.execute(&backend).await.unwrap();
        let events = backend.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec!["copy out/data/table.csv", "copy out/img/a.png", "wait"]
        );
    }

    #[tokio::test]
    async fn submission_error_stops_later_stages() {
        let mut plan = StagedPlan::with_max_concurrency(2);
        let mut bad = notebook("speaker", "html");
        bad.service = "unknown".into();
        plan.add_submission(bad);
        plan.add_submission(notebook("completed", "html"));

        struct Strict(Journal);
        #[async_trait]
        impl Backend for Strict {
            async fn execute_operation(&self, s: &Submission) -> Result<(), OperationError> {
                s.job_type()?;
                self.0.execute_operation(s).await
            }
            async fn wait_for_completion(
                &self,
                t: Option<Duration>,
            ) -> Result<CompletionReport, OperationError> {
                self.0.wait_for_completion(t).await
            }
        }

        let backend = Strict(Journal::default());
        assert!(plan.execute(&backend).await.is_err());
        assert!(backend.0.events.lock().unwrap().is_empty());
    }
}
