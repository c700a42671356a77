//! Error taxonomy surfaced through batch completions, plus scheduler misuse errors.

use thiserror::Error;

use crate::replication::{GenerationId, Priority};

/// Coarse classification callers use to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry upstream, resuming from the same checkpoint is safe.
    Transient,
    /// The checkpoint can no longer be trusted; the index must be rebuilt.
    ResyncRequired,
    /// A document or field exceeded a configured limit.
    ResourceLimitExceeded,
    /// Cooperative shutdown in progress.
    ShutDown,
    /// Work was submitted under an attempt that has been cancelled.
    Fenced,
    Failed,
}

/// Outcome error of a scheduled batch.
///
/// Cloned into every waiter of a completion, so variants carry rendered
/// messages instead of boxed sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Requires resync: {0}")]
    RequiresResync(String),

    #[error("Requires non-invalidating resync: {0}")]
    NonInvalidatingResync(String),

    #[error("Field limits exceeded: {0}")]
    FieldExceeded(String),

    #[error("Docs limit exceeded: {0}")]
    DocsExceeded(String),

    #[error("Replication shut down")]
    ShutDown,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Failed: {0}")]
    Failed(String),

    #[error("Batch completion dropped before it was resolved")]
    Abandoned,
}

impl ReplicationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::RequiresResync(_) | Self::NonInvalidatingResync(_) => ErrorKind::ResyncRequired,
            Self::FieldExceeded(_) | Self::DocsExceeded(_) => ErrorKind::ResourceLimitExceeded,
            Self::ShutDown => ErrorKind::ShutDown,
            Self::Cancelled(_) => ErrorKind::Fenced,
            Self::Failed(_) | Self::Abandoned => ErrorKind::Failed,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Non-transient failure of an enrichment or write stage, classified by the
    /// replication phase the batch belongs to. Initial sync gives up on the
    /// attempt; steady state asks for a resync that keeps the current index.
    pub fn non_transient_for(priority: Priority, msg: impl Into<String>) -> Self {
        if priority.is_initial_sync() {
            Self::Failed(msg.into())
        } else {
            Self::NonInvalidatingResync(msg.into())
        }
    }

    /// Failure raised when a processing callback panics.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Failed(format!("processing panicked: {}", msg))
    }
}

/// Synchronous misuse of a scheduler or its queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(
        "Batch priority {batch} does not match priority {pinned} of outstanding work for generation {generation}"
    )]
    PriorityMismatch {
        generation: GenerationId,
        pinned: Priority,
        batch: Priority,
    },

    #[error("{scheduler} has been shut down")]
    ShutDown { scheduler: &'static str },
}
