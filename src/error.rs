//! Error types for courseflow.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Subprocess error: {0}")]
    Subprocess(#[from] SubprocessError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Operation error: {0}")]
    Operation(#[from] OperationError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store stayed busy/locked through every retry.
    #[error("Store unavailable: {operation} still busy after {attempts} attempts")]
    Unavailable { operation: String, attempts: u32 },

    #[error("Validation failed: {0}")]
    Validation(String),
}

impl DatabaseError {
    /// Whether this error came from lock contention and is worth retrying.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Query(msg) | Self::Pool(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("database is locked")
                    || lower.contains("database table is locked")
                    || lower.contains("busy")
            }
            _ => false,
        }
    }
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: i64 },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: i64,
        state: String,
        target: String,
    },

    #[error("Job {id} was cancelled")]
    Cancelled { id: i64 },
}

/// External tool invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum SubprocessError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program} timed out after {timeout:?} ({attempts} attempts)")]
    Timeout {
        program: String,
        timeout: Duration,
        attempts: u32,
    },

    #[error("{program} exited with code {exit_code:?} after {attempts} attempts: {stderr}")]
    Failed {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
        attempts: u32,
    },

    #[error("Empty command line")]
    EmptyCommand,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker process errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker registration failed after {attempts} attempts: {reason}")]
    Registration { attempts: u32, reason: String },

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("No converter configured for job type {0}")]
    NoConverter(String),

    #[error("Worker {worker_id} crashed: {reason}")]
    Crashed { worker_id: i64, reason: String },

    #[error("Invalid worker state transition from {from} to {to}")]
    InvalidState { from: String, to: String },
}

/// Worker pool management errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("{mode} executor failed: {reason}")]
    Executor { mode: String, reason: String },

    #[error("No executor registered for execution mode {0}")]
    NoExecutor(String),

    #[error("Worker {executor_id} did not register within {timeout:?}")]
    StartupTimeout {
        executor_id: String,
        timeout: Duration,
    },

    #[error("State file error: {0}")]
    StateFile(String),

    #[error("State file belongs to database {found}, expected {expected}")]
    StateMismatch { expected: String, found: String },
}

/// Operation tree / backend errors.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("{} operation(s) failed: {}", .0.len(), summarize(.0))]
    Aggregate(Vec<OperationError>),

    #[error("Timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("No workers available to process '{job_type}' jobs")]
    NoWorkers { job_type: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

fn summarize(errors: &[OperationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Remote job-store adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
