//! Worker pool management.
//!
//! - `executor`: Hosting strategies (direct subprocess, docker, in-process)
//! - `state`: Pool state file shared between invocations
//! - `manager`: Startup, reuse, health sweeps and shutdown

pub mod executor;
pub mod manager;
pub mod state;

pub use executor::{
    DirectExecutor, DockerExecutor, InProcessExecutor, LaunchedWorker, WorkerExecutor, WorkerLaunch,
};
pub use manager::{CleanupReport, HealthReport, ManagedWorker, PoolStatus, WorkerPoolManager};
pub use state::{PoolState, PoolWorkerRecord, StateFile};
