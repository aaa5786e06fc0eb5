//! courseflow: job orchestration for course-material builds.
//!
//! Conversions (notebooks, PlantUML and draw.io diagrams) are queued in an
//! embedded store, claimed by pooled workers and reported back, with a
//! content-addressed cache in front of it all.

pub mod api;
pub mod config;
pub mod error;
pub mod operation;
pub mod pool;
pub mod store;
pub mod subprocess;
pub mod worker;
