//! Remote job-store adapter: an HTTP server in front of the store and the
//! matching [`JobQueue`](crate::store::JobQueue) client.

pub mod client;
pub mod models;
pub mod server;

pub use client::{RegistrationRetry, RemoteQueue};
pub use server::{api_routes, serve};
