//! Job-type converters.
//!
//! A worker owns exactly one [`Converter`], chosen by its job type. The
//! built-in converters drive external tools through the subprocess runner;
//! [`Converter::Custom`] plugs in any [`JobHandler`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{Error, WorkerError};
use crate::store::cache::ExecutionKey;
use crate::store::model::{Job, JobType};
use crate::subprocess::RetryPolicy;
use crate::worker::context::ExecutionContext;

/// Conversion logic for one job type.
///
/// Implementations write their result to `output` (a staging path) and
/// return optional metadata that ends up in the job's `result` column.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error>;
}

/// Closed set of converters a worker can run.
#[derive(Clone)]
pub enum Converter {
    Notebook(NotebookConverter),
    Diagram(DiagramConverter),
    Custom(Arc<dyn JobHandler>),
}

impl Converter {
    /// Default converter for a job type, with tool locations from the environment.
    pub fn for_job_type(job_type: JobType) -> Self {
        match job_type {
            JobType::Notebook => Self::Notebook(NotebookConverter::from_env()),
            JobType::PlantUml => Self::Diagram(DiagramConverter::plantuml()),
            JobType::DrawIo => Self::Diagram(DiagramConverter::drawio()),
        }
    }

    pub fn custom(handler: impl JobHandler + 'static) -> Self {
        Self::Custom(Arc::new(handler))
    }

    pub async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        match self {
            Self::Notebook(c) => c.convert(ctx, job, output).await,
            Self::Diagram(c) => c.convert(ctx, job, output).await,
            Self::Custom(h) => h.convert(ctx, job, output).await,
        }
    }
}

/// Substitute `{name}` placeholders in every argument.
fn render_command(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{name}}}"), value)
            })
        })
        .collect()
}

fn split_template(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Output format from the payload, else from the output file's extension.
fn output_format(job: &Job, fallback: &str) -> String {
    job.payload
        .get("output_format")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| {
            Path::new(&job.output_file)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
        })
        .unwrap_or_else(|| fallback.to_string())
}

// ── Diagrams ────────────────────────────────────────────────────────

/// Runs one command template per diagram.
///
/// Placeholders: `{input}`, `{output}`, `{output_dir}`, `{input_stem}`, `{format}`.
#[derive(Debug, Clone)]
pub struct DiagramConverter {
    command: Vec<String>,
    /// Where the tool actually writes, when it ignores `{output}`.
    produces: Option<String>,
    policy: RetryPolicy,
    env: Vec<(String, String)>,
}

impl DiagramConverter {
    pub fn new(command: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            command,
            produces: None,
            policy,
            env: Vec::new(),
        }
    }

    /// PlantUML via `PLANTUML_JAR`, falling back to a `plantuml` launcher.
    pub fn plantuml() -> Self {
        let mut command = match std::env::var("PLANTUML_JAR") {
            Ok(jar) if !jar.is_empty() => vec![
                "java".to_string(),
                "-DPLANTUML_LIMIT_SIZE=8192".to_string(),
                "-jar".to_string(),
                jar,
            ],
            _ => vec!["plantuml".to_string()],
        };
        command.extend(
            ["-t{format}", "-o", "{output_dir}", "{input}"]
                .iter()
                .map(|s| s.to_string()),
        );
        Self {
            produces: Some("{output_dir}/{input_stem}.{format}".to_string()),
            ..Self::new(command, RetryPolicy::default())
        }
    }

    /// draw.io (Electron) export with crash retry.
    pub fn drawio() -> Self {
        let exe = std::env::var("DRAWIO_EXECUTABLE").unwrap_or_else(|_| "drawio".to_string());
        let mut command = vec![exe];
        command.extend(
            [
                "--no-sandbox",
                "--export",
                "{input}",
                "--format",
                "{format}",
                "--output",
                "{output}",
                "--border",
                "20",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        let mut converter = Self::new(command, RetryPolicy::crash_tolerant());
        if cfg!(unix) {
            converter = converter.with_env("DISPLAY", ":99");
        }
        converter
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_produces(mut self, template: impl Into<String>) -> Self {
        self.produces = Some(template.into());
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        let input = ctx.resolve(&job.input_file);
        let format = output_format(job, "png");
        let output_dir = output.parent().map(path_str).unwrap_or_else(|| ".".into());
        let input_stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let input = path_str(&input);
        let output_s = path_str(output);
        let vars = [
            ("input", input.as_str()),
            ("output", output_s.as_str()),
            ("output_dir", output_dir.as_str()),
            ("input_stem", input_stem.as_str()),
            ("format", format.as_str()),
        ];

        let mut format_args = Vec::new();
        if job.job_type == JobType::DrawIo {
            match format.as_str() {
                "png" => format_args.extend(["--scale".to_string(), "3".to_string()]),
                "svg" => format_args.push("--embed-svg-images".to_string()),
                _ => {}
            }
        }
        let mut command = render_command(&self.command, &vars);
        command.extend(format_args);

        let mut runner = ctx.runner().clone();
        for (k, v) in &self.env {
            runner = runner.with_env(k.clone(), v.clone());
        }
        let out = runner.run(&command, &self.policy).await?;
        debug!(job_id = job.id, attempts = out.attempts, "Diagram tool finished");

        if let Some(produces) = &self.produces {
            let produced = PathBuf::from(render_command(&[produces.clone()], &vars).concat());
            if produced.as_path() != output {
                tokio::fs::rename(&produced, output).await.map_err(|e| {
                    WorkerError::Conversion(format!(
                        "expected diagram at {}: {e}",
                        produced.display()
                    ))
                })?;
            }
        }

        Ok(Some(json!({
            "output_format": format,
            "attempts": out.attempts,
        })))
    }
}

// ── Notebooks ───────────────────────────────────────────────────────

/// Notebook fields read from a job payload.
#[derive(Debug, Clone, Deserialize)]
struct NotebookPayload {
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default = "default_prog_lang")]
    prog_lang: String,
    #[serde(default = "default_format")]
    format: String,
    /// Hash of the notebook source alone, shared by all output variants.
    #[serde(default)]
    source_hash: Option<String>,
    /// Skip the executed-notebook cache.
    #[serde(default)]
    fallback_execute: bool,
}

fn default_kind() -> String {
    "completed".into()
}
fn default_language() -> String {
    "en".into()
}
fn default_prog_lang() -> String {
    "python".into()
}
fn default_format() -> String {
    "html".into()
}

/// Two-step notebook conversion: execute, then render.
///
/// Placeholders: `{input}`, `{executed}`, `{output}`, `{format}`, `{kind}`,
/// `{language}`, `{prog_lang}`. Only HTML output executes the notebook.
/// Speaker HTML stores its executed notebook; completed HTML reuses it and
/// runs only the render step.
#[derive(Debug, Clone)]
pub struct NotebookConverter {
    execute: Vec<String>,
    render: Vec<String>,
    policy: RetryPolicy,
}

impl NotebookConverter {
    pub fn new(execute: Vec<String>, render: Vec<String>, policy: RetryPolicy) -> Self {
        Self {
            execute,
            render,
            policy,
        }
    }

    /// nbconvert defaults, overridable with `NOTEBOOK_EXECUTE_COMMAND` and
    /// `NOTEBOOK_RENDER_COMMAND`.
    pub fn from_env() -> Self {
        let execute = std::env::var("NOTEBOOK_EXECUTE_COMMAND")
            .map(|s| split_template(&s))
            .unwrap_or_else(|_| {
                split_template(
                    "jupyter nbconvert --to notebook --execute --output {executed} {input}",
                )
            });
        let render = std::env::var("NOTEBOOK_RENDER_COMMAND")
            .map(|s| split_template(&s))
            .unwrap_or_else(|_| {
                split_template("jupyter nbconvert --to {format} --output {output} {executed}")
            });
        Self::new(execute, render, RetryPolicy::default())
    }

    async fn convert(
        &self,
        ctx: &ExecutionContext,
        job: &Job,
        output: &Path,
    ) -> Result<Option<serde_json::Value>, Error> {
        let payload: NotebookPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| WorkerError::Conversion(format!("invalid notebook payload: {e}")))?;
        let input = path_str(&ctx.resolve(&job.input_file));
        let scratch = ctx.scratch_dir(job).await?;
        let executed_path = scratch.join("executed.ipynb");
        let executed = path_str(&executed_path);
        let output_s = path_str(output);

        let is_html = payload.format == "html";
        let source_hash = match (&payload.source_hash, is_html) {
            (Some(hash), _) => hash.clone(),
            (None, true) => {
                let source = tokio::fs::read(&input).await.map_err(|e| {
                    WorkerError::Conversion(format!("reading {input}: {e}"))
                })?;
                execution_hash(&payload.prog_lang, &payload.language, &source)
            }
            (None, false) => job.content_hash.clone(),
        };
        let key = ExecutionKey {
            input_file: job.input_file.clone(),
            source_hash,
            language: payload.language.clone(),
            prog_lang: payload.prog_lang.clone(),
        };

        let vars = [
            ("input", input.as_str()),
            ("executed", executed.as_str()),
            ("output", output_s.as_str()),
            ("format", payload.format.as_str()),
            ("kind", payload.kind.as_str()),
            ("language", payload.language.as_str()),
            ("prog_lang", payload.prog_lang.as_str()),
        ];

        let mut reused = false;
        if !is_html {
            // Code and notebook formats are rendered straight from the source.
            tokio::fs::copy(&input, &executed_path).await.map_err(|e| {
                WorkerError::Conversion(format!("reading {input}: {e}"))
            })?;
        } else {
            if payload.kind == "completed" && !payload.fallback_execute {
                if let Some(cached) = ctx.queue().get_executed(&key).await? {
                    tokio::fs::write(&executed_path, &cached).await.map_err(|e| {
                        WorkerError::Conversion(format!("writing {executed}: {e}"))
                    })?;
                    info!(job_id = job.id, input = %job.input_file, "Reusing executed notebook");
                    reused = true;
                } else {
                    warn!(
                        job_id = job.id,
                        input = %job.input_file,
                        "Execution cache miss, executing directly"
                    );
                }
            }

            if !reused {
                let command = render_command(&self.execute, &vars);
                ctx.runner().run(&command, &self.policy).await?;
                if payload.kind == "speaker" {
                    let bytes = tokio::fs::read(&executed_path).await.map_err(|e| {
                        WorkerError::Conversion(format!("reading {executed}: {e}"))
                    })?;
                    ctx.queue().put_executed(&key, &bytes).await?;
                    debug!(job_id = job.id, "Executed notebook cached");
                }
            }
        }

        let command = render_command(&self.render, &vars);
        ctx.runner().run(&command, &self.policy).await?;

        Ok(Some(json!({
            "kind": payload.kind,
            "format": payload.format,
            "language": payload.language,
            "reused_execution": reused,
        })))
    }
}

/// Kind-agnostic hash of a notebook source, shared by all HTML variants.
pub fn execution_hash(prog_lang: &str, language: &str, source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prog_lang.as_bytes());
    hasher.update(b":");
    hasher.update(language.as_bytes());
    hasher.update(b":");
    hasher.update(source);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::jobs::JobStore;
    use crate::store::model::NewJob;
    use crate::store::traits::LocalQueue;
    use std::time::Duration;

    fn sh(script: String) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script]
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_timeout: Duration::from_secs(10),
            ..RetryPolicy::default()
        }
    }

    async fn context(dir: &Path, job_type: JobType) -> (JobStore, ExecutionContext) {
        let store = JobStore::new_memory().await.unwrap();
        let queue = Arc::new(LocalQueue::new(store.clone()));
        (store.clone(), ExecutionContext::new(1, job_type, queue, dir))
    }

    async fn job(store: &JobStore, new: NewJob) -> Job {
        let id = store.enqueue(new).await.unwrap();
        store.get_job(id).await.unwrap().unwrap()
    }

    #[test]
    fn placeholders_are_substituted() {
        let cmd = render_command(
            &["tool".into(), "-t{format}".into(), "{input}".into()],
            &[("format", "svg"), ("input", "a.pu")],
        );
        assert_eq!(cmd, vec!["tool", "-tsvg", "a.pu"]);
    }

    #[tokio::test]
    async fn diagram_converter_runs_template() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.pu"), "@startuml\n@enduml").unwrap();
        let (store, ctx) = context(dir.path(), JobType::PlantUml).await;
        let job = job(
            &store,
            NewJob::new(JobType::PlantUml, "a.pu", "img/a.svg", "h", json!({})),
        )
        .await;

        let converter = Converter::Diagram(DiagramConverter::new(
            sh("cp {input} {output}".into()),
            quick(),
        ));
        let staged = ctx.staged_output(&job).await.unwrap();
        let meta = converter.convert(&ctx, &job, &staged).await.unwrap().unwrap();
        assert_eq!(meta["output_format"], "svg");
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "@startuml\n@enduml");
    }

    #[tokio::test]
    async fn diagram_converter_moves_tool_output_into_place() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.pu"), "x").unwrap();
        let (store, ctx) = context(dir.path(), JobType::PlantUml).await;
        let job = job(
            &store,
            NewJob::new(JobType::PlantUml, "b.pu", "img/final.png", "h", json!({})),
        )
        .await;

        let converter = DiagramConverter::new(
            sh("cp {input} {output_dir}/{input_stem}.{format}".into()),
            quick(),
        )
        .with_produces("{output_dir}/{input_stem}.{format}");
        let staged = ctx.staged_output(&job).await.unwrap();
        Converter::Diagram(converter)
            .convert(&ctx, &job, &staged)
            .await
            .unwrap();
        assert!(staged.exists());
    }

    #[tokio::test]
    async fn completed_html_reuses_speaker_execution() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs.log");
        std::fs::write(dir.path().join("nb.py"), "print(1)").unwrap();
        let (store, ctx) = context(dir.path(), JobType::Notebook).await;

        let converter = Converter::Notebook(NotebookConverter::new(
            sh(format!(
                "echo exec >> {}; cp {{input}} {{executed}}",
                runs.display()
            )),
            sh("cp {executed} {output}".into()),
            quick(),
        ));

        let payload = |kind: &str| json!({"kind": kind, "format": "html", "source_hash": "src1"});
        let speaker = job(
            &store,
            NewJob::new(JobType::Notebook, "nb.py", "speaker/nb.html", "h1", payload("speaker")),
        )
        .await;
        let staged = ctx.staged_output(&speaker).await.unwrap();
        converter.convert(&ctx, &speaker, &staged).await.unwrap();

        let completed = job(
            &store,
            NewJob::new(JobType::Notebook, "nb.py", "completed/nb.html", "h2", payload("completed")),
        )
        .await;
        let staged = ctx.staged_output(&completed).await.unwrap();
        let meta = converter
            .convert(&ctx, &completed, &staged)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(meta["reused_execution"], true);
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "print(1)");
        let executions = std::fs::read_to_string(&runs).unwrap();
        assert_eq!(executions.lines().count(), 1);
    }

    #[test]
    fn execution_hash_ignores_kind_but_not_language() {
        let de = execution_hash("python", "de", b"print(1)");
        assert_eq!(de, execution_hash("python", "de", b"print(1)"));
        assert_ne!(de, execution_hash("python", "en", b"print(1)"));
        assert_ne!(de, execution_hash("python", "de", b"print(2)"));
    }

    #[tokio::test]
    async fn execution_is_shared_without_source_hash() {
        let dir = tempfile::tempdir().unwrap();
        let runs = dir.path().join("runs.log");
        std::fs::write(dir.path().join("nb.py"), "print(2)").unwrap();
        let (store, ctx) = context(dir.path(), JobType::Notebook).await;

        let converter = Converter::Notebook(NotebookConverter::new(
            sh(format!(
                "echo exec >> {}; cp {{input}} {{executed}}",
                runs.display()
            )),
            sh("cp {executed} {output}".into()),
            quick(),
        ));

        // Per-kind content hashes differ; the execution key must not.
        for (kind, hash) in [("speaker", "h-speaker"), ("completed", "h-completed")] {
            let job = job(
                &store,
                NewJob::new(
                    JobType::Notebook,
                    "nb.py",
                    format!("{kind}/nb.html"),
                    hash,
                    json!({"kind": kind, "format": "html"}),
                ),
            )
            .await;
            let staged = ctx.staged_output(&job).await.unwrap();
            converter.convert(&ctx, &job, &staged).await.unwrap();
        }

        let executions = std::fs::read_to_string(&runs).unwrap();
        assert_eq!(executions.lines().count(), 1);
    }

    #[tokio::test]
    async fn code_output_skips_execution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("nb.py"), "x = 1").unwrap();
        let (store, ctx) = context(dir.path(), JobType::Notebook).await;
        let converter = Converter::Notebook(NotebookConverter::new(
            sh("exit 1".into()),
            sh("cp {executed} {output}".into()),
            quick(),
        ));
        let job = job(
            &store,
            NewJob::new(JobType::Notebook, "nb.py", "code/nb.py", "h", json!({"format": "code"})),
        )
        .await;
        let staged = ctx.staged_output(&job).await.unwrap();
        converter.convert(&ctx, &job, &staged).await.unwrap();
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "x = 1");
    }

    #[tokio::test]
    async fn failing_tool_surfaces_subprocess_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ctx) = context(dir.path(), JobType::DrawIo).await;
        let job = job(
            &store,
            NewJob::new(JobType::DrawIo, "d.drawio", "d.png", "h", json!({})),
        )
        .await;
        let converter = Converter::Diagram(DiagramConverter::new(
            sh("echo boom >&2; exit 2".into()),
            quick(),
        ));
        let staged = ctx.staged_output(&job).await.unwrap();
        let err = converter.convert(&ctx, &job, &staged).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Subprocess(crate::error::SubprocessError::Failed { .. })
        ));
    }
}
