//! Generation-scoped batch scheduling for replication.
//!
//! Upstream replication hands batches to a [`DecodingWorkScheduler`] or an
//! [`IndexingWorkScheduler`]. Each scheduler keeps batches of one generation
//! strictly ordered and one-at-a-time, shares a bounded [`WorkerPool`] across
//! generations, and freezes a generation on the first failed batch until the
//! caller cancels it.

pub mod commit_user_data;
pub mod completion;
pub mod decoding;
pub mod definition;
pub mod event;
pub mod factory;
pub mod generation;
pub mod indexing;
pub mod queue;
pub mod scheduler;

pub use commit_user_data::IndexCommitUserData;
pub use completion::{BatchFuture, BatchOutcome, Completion};
pub use decoding::{DecodingError, DecodingWorkScheduler, DocumentBatchDecoder};
pub use definition::{IndexDefinition, IndexingFlavour, VectorField, VectorIndexDefinition};
pub use event::{DocumentEvent, EventType, FieldPath, RawDocument, Vector};
pub use factory::IndexingWorkSchedulerFactory;
pub use generation::{AttemptId, GenerationId, IndexId, Priority};
pub use indexing::{
    BatchEnricher, DocumentIndexer, EnrichedBatch, IndexingError, IndexingWorkScheduler,
};
pub use queue::{SchedulerBatch, SchedulerQueue};
pub use scheduler::{SchedulerState, WorkScheduler, WorkerPool};
