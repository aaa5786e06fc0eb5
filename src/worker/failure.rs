//! Turning conversion errors into structured, operator-facing failures.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, SubprocessError, WorkerError};
use crate::store::model::{ErrorCategory, Job, JobFailure, JobType};

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid regex"));

static ERROR_CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\w+(?:Error|Exception))\b").expect("valid regex"));

static CELL_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:in|at)\s+[Cc]ell\s*#?(\d+))|(?:[Cc]ell\s*\[(\d+)\])").expect("valid regex")
});

/// Python errors that point at the notebook's own code.
const CODE_ERRORS: &[&str] = &["SyntaxError", "NameError", "IndentationError", "TypeError"];

/// Remove terminal colour codes from tool output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Build the failure for a job whose conversion returned `err`.
pub fn from_error(job: &Job, err: &Error, elapsed: Duration) -> JobFailure {
    let (class, message, traceback) = match err {
        Error::Subprocess(SubprocessError::Spawn { program, reason }) => (
            "SpawnError".to_string(),
            format!("{program} not found or not executable: {reason}"),
            None,
        ),
        Error::Subprocess(SubprocessError::Timeout { .. }) => {
            ("TimeoutError".to_string(), err.to_string(), None)
        }
        Error::Subprocess(SubprocessError::Failed {
            program,
            exit_code,
            stderr,
            ..
        }) => {
            let stderr = strip_ansi(stderr);
            let class = ERROR_CLASS
                .captures(&stderr)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "ConversionError".to_string());
            let message = last_meaningful_line(&stderr)
                .map(|line| format!("{program} exited with {exit_code:?}: {line}"))
                .unwrap_or_else(|| format!("{program} exited with {exit_code:?}"));
            (class, message, Some(stderr))
        }
        Error::Worker(WorkerError::Conversion(msg)) => {
            let msg = strip_ansi(msg);
            let class = ERROR_CLASS
                .captures(&msg)
                .map(|c| c[1].to_string())
                .unwrap_or_else(|| "ConversionError".to_string());
            (class, msg, None)
        }
        Error::Database(_) | Error::Api(_) => ("StoreError".to_string(), err.to_string(), None),
        other => ("Error".to_string(), strip_ansi(&other.to_string()), None),
    };

    categorize(job.job_type, class, message, traceback, elapsed)
}

/// Failure for a conversion that outran the worker's job time limit.
pub fn timed_out(job: &Job, limit: Duration, elapsed: Duration) -> JobFailure {
    categorize(
        job.job_type,
        "TimeoutError".to_string(),
        format!("Job processing exceeded timeout of {limit:?}"),
        None,
        elapsed,
    )
}

fn categorize(
    job_type: JobType,
    error_class: String,
    error_message: String,
    traceback: Option<String>,
    elapsed: Duration,
) -> JobFailure {
    let (category, actionable_guidance) =
        classify(job_type, &error_class, &error_message, traceback.as_deref());
    JobFailure {
        error_message,
        error_class,
        traceback,
        processing_time: Some(elapsed.as_secs_f64()),
        worker_type: job_type,
        category,
        actionable_guidance,
    }
}

fn classify(
    job_type: JobType,
    class: &str,
    message: &str,
    traceback: Option<&str>,
) -> (ErrorCategory, String) {
    if class == "TimeoutError" {
        return (
            ErrorCategory::Infrastructure,
            "Worker timed out. Check the worker logs and consider raising max_job_time".into(),
        );
    }
    if class == "StoreError" {
        return (
            ErrorCategory::Infrastructure,
            "The job store was unreachable. Check the database file or API server".into(),
        );
    }
    if class == "SpawnError" {
        let hint = match job_type {
            JobType::PlantUml => "Install PlantUML or set PLANTUML_JAR",
            JobType::DrawIo => "Install draw.io or set DRAWIO_EXECUTABLE",
            JobType::Notebook => "Install Jupyter in the worker environment",
        };
        return (ErrorCategory::Configuration, hint.into());
    }

    match job_type {
        JobType::Notebook => {
            let text = format!("{message}\n{}", traceback.unwrap_or_default());
            if CODE_ERRORS.iter().any(|e| class == *e || message.contains(e)) {
                let cell = cell_number(&text)
                    .map(|n| format!(" in cell #{n}"))
                    .unwrap_or_default();
                (
                    ErrorCategory::User,
                    format!("Fix the {class}{cell} in your notebook"),
                )
            } else if class == "FileNotFoundError" && text.to_lowercase().contains("template") {
                (
                    ErrorCategory::Configuration,
                    "Ensure templates are available in the template directory".into(),
                )
            } else if class == "ModuleNotFoundError" || class == "ImportError" {
                (
                    ErrorCategory::User,
                    "Install the required Python module or check your imports".into(),
                )
            } else {
                (
                    ErrorCategory::User,
                    "Check your notebook for errors. Run with verbose logging for details".into(),
                )
            }
        }
        JobType::PlantUml => (ErrorCategory::User, "Check your PlantUML diagram syntax".into()),
        JobType::DrawIo => (ErrorCategory::User, "Check your draw.io diagram for errors".into()),
    }
}

fn cell_number(text: &str) -> Option<u32> {
    let caps = CELL_NUMBER.captures(text)?;
    caps.get(1).or_else(|| caps.get(2))?.as_str().parse().ok()
}

fn last_meaningful_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}
