//! Persistence layer: the job queue, results cache and worker registry,
//! all in one embedded libSQL file.

pub mod cache;
pub mod jobs;
pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;
pub mod workers;

pub use cache::ExecutionKey;
pub use jobs::JobStore;
pub use libsql_backend::LibSqlBackend;
pub use traits::{JobQueue, LocalQueue};
pub use workers::{WorkerRegistry, classify};
