//! Row types for jobs, cache entries and workers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// Kind of conversion a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Notebook,
    #[serde(rename = "plantuml")]
    PlantUml,
    #[serde(rename = "drawio")]
    DrawIo,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::Notebook, JobType::PlantUml, JobType::DrawIo];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notebook => "notebook",
            Self::PlantUml => "plantuml",
            Self::DrawIo => "drawio",
        }
    }

    /// Name of the converter service that handles this job type.
    pub fn service_name(&self) -> &'static str {
        match self {
            Self::Notebook => "notebook-processor",
            Self::PlantUml => "plantuml-converter",
            Self::DrawIo => "drawio-converter",
        }
    }

    /// Map a converter service name to the job type it handles.
    pub fn from_service(service: &str) -> Option<Self> {
        match service {
            "notebook-processor" => Some(Self::Notebook),
            "plantuml-converter" => Some(Self::PlantUml),
            "drawio-converter" => Some(Self::DrawIo),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notebook" => Ok(Self::Notebook),
            "plantuml" => Ok(Self::PlantUml),
            "drawio" => Ok(Self::DrawIo),
            other => Err(DatabaseError::Validation(format!("unknown job type: {other}"))),
        }
    }
}

/// Persisted job status.
///
/// `pending → processing → {completed, failed}`; a failed attempt with
/// retries left goes back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::Validation(format!("unknown job status: {other}"))),
        }
    }
}

/// A persisted unit of conversion work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub status: JobStatus,
    pub priority: i64,
    pub input_file: String,
    pub output_file: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<i64>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub result: Option<serde_json::Value>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// Status as shown to operators. Flagged rows read as `cancelled`.
    pub fn display_status(&self) -> &'static str {
        if self.is_cancelled() && !self.status.is_terminal() {
            "cancelled"
        } else {
            self.status.as_str()
        }
    }

    /// Parse the recorded error, if it was stored as a structured failure.
    pub fn failure(&self) -> Option<JobFailure> {
        let raw = self.error.as_deref()?;
        Some(
            serde_json::from_str(raw).unwrap_or_else(|_| JobFailure::plain(raw, self.job_type)),
        )
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub input_file: String,
    pub output_file: String,
    pub content_hash: String,
    pub payload: serde_json::Value,
    pub priority: i64,
    pub correlation_id: Option<String>,
    pub max_attempts: i64,
}

impl NewJob {
    pub fn new(
        job_type: JobType,
        input_file: impl Into<String>,
        output_file: impl Into<String>,
        content_hash: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            job_type,
            input_file: input_file.into(),
            output_file: output_file.into(),
            content_hash: content_hash.into(),
            payload,
            priority: 0,
            correlation_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i64) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Default number of attempts before a job stays failed.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Who is to blame for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Problem in the course content itself.
    User,
    /// Missing template, bad settings.
    Configuration,
    /// Missing tools, dead workers, unreachable store.
    Infrastructure,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Configuration => "configuration",
            Self::Infrastructure => "infrastructure",
        })
    }
}

/// Structured failure recorded in a job's `error` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub error_message: String,
    #[serde(default)]
    pub error_class: String,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    pub worker_type: JobType,
    pub category: ErrorCategory,
    #[serde(default)]
    pub actionable_guidance: String,
}

impl JobFailure {
    /// Wrap a bare message that was stored without structure.
    pub fn plain(message: &str, worker_type: JobType) -> Self {
        Self {
            error_message: message.to_string(),
            error_class: String::new(),
            traceback: None,
            processing_time: None,
            worker_type,
            category: ErrorCategory::Infrastructure,
            actionable_guidance: String::new(),
        }
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    Failed { failure: JobFailure },
}

/// Result of `report_status`, so callers can tell a requeue from a final failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReportedStatus {
    Completed,
    Requeued { attempts: i64 },
    Failed { attempts: i64 },
}

/// Content-addressed memo of a finished conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub output_file: String,
    pub content_hash: String,
    pub result_metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
}

/// Polling view of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub status: JobStatus,
    pub error: Option<String>,
    pub cancelled: bool,
}

/// Aggregate queue counters for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// How a worker process is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Native subprocess on the host.
    Direct,
    /// One container per worker.
    #[serde(alias = "containerized")]
    Docker,
    /// Tokio task inside the controlling process.
    InProcess,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Docker => "docker",
            Self::InProcess => "in_process",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "docker" | "containerized" => Ok(Self::Docker),
            "in_process" => Ok(Self::InProcess),
            other => Err(DatabaseError::Validation(format!("unknown execution mode: {other}"))),
        }
    }
}

/// Declared worker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Hung,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Hung => "hung",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "hung" => Ok(Self::Hung),
            "dead" => Ok(Self::Dead),
            other => Err(DatabaseError::Validation(format!("unknown worker status: {other}"))),
        }
    }
}

/// A registered execution slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: i64,
    pub worker_type: JobType,
    pub container_id: String,
    pub execution_mode: Option<ExecutionMode>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub jobs_processed: i64,
    pub jobs_failed: i64,
    pub avg_processing_time: Option<f64>,
    pub parent_pid: Option<i64>,
}

/// One entry in the worker audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub id: i64,
    pub event_type: String,
    pub worker_id: Option<i64>,
    pub job_type: Option<String>,
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
