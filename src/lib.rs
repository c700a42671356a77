//! Generation-scoped batch scheduling for index replication.
//!
//! The [`replication`] module holds the scheduler core: the per-generation
//! [`SchedulerQueue`](replication::SchedulerQueue), the
//! [`WorkScheduler`](replication::WorkScheduler) driving it, and the
//! decoding and indexing schedulers built on top. [`embedding`] adds the
//! auto-embedding stage for vector indexes.

pub mod config;
pub mod embedding;
pub mod error;
pub mod error_recovery;
pub mod metrics;
pub mod replication;
pub mod simulation;

pub use error::{ReplicationError, SchedulerError};
