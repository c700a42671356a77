//! Indexing schedulers: apply decoded document events to an index, optionally
//! after an enrichment stage, and advance the index checkpoint only once a
//! whole batch has been applied.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{ReplicationError, SchedulerError};
use crate::metrics::{MetricsRegistry, ReplicationMetricsSink, WorkKind};

use super::commit_user_data::IndexCommitUserData;
use super::completion::BatchFuture;
use super::definition::IndexDefinition;
use super::event::DocumentEvent;
use super::generation::{AttemptId, GenerationId, Priority};
use super::queue::SchedulerBatch;
use super::scheduler::{run_blocking, BatchPayload, BatchStrategy, WorkScheduler, WorkerPool};

pub const INDEXING_SCOPE: &str = "indexingWorkScheduler";
pub const EMBEDDING_SCOPE: &str = "embeddingIndexingWorkScheduler";
pub const EMBEDDING_MATERIALIZED_VIEW_SCOPE: &str = "embeddingMaterializedViewIndexingWorkScheduler";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexingError {
    #[error("Field limits exceeded: {0}")]
    FieldExceededLimits(String),

    #[error("Transient indexing failure: {0}")]
    Transient(String),

    #[error("Indexing failed: {0}")]
    Failed(String),
}

impl From<IndexingError> for ReplicationError {
    fn from(err: IndexingError) -> Self {
        match err {
            IndexingError::FieldExceededLimits(msg) => ReplicationError::FieldExceeded(msg),
            IndexingError::Transient(msg) => ReplicationError::Transient(msg),
            IndexingError::Failed(msg) => ReplicationError::Failed(msg),
        }
    }
}

/// Write side of one index. Called from the blocking pool, one batch of a
/// generation at a time.
pub trait DocumentIndexer: Send + Sync {
    fn index_document_event(&self, event: &DocumentEvent) -> Result<(), IndexingError>;

    /// Why the index as a whole is over its limits, if it is.
    fn exceeded_limits(&self) -> Option<String>;

    /// Records the checkpoint the next commit will persist.
    fn update_commit_user_data(&self, commit_user_data: &IndexCommitUserData);

    fn commit(&self) -> Result<(), IndexingError>;

    fn index_definition(&self) -> &IndexDefinition;
}

/// Result of an enrichment stage.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichedBatch {
    /// Nothing to enrich; index the events as scheduled.
    Unchanged,
    /// Replacement events, same length and order as the input.
    Rewritten(Vec<DocumentEvent>),
}

/// Stage run on a batch before it is indexed.
#[async_trait]
pub trait BatchEnricher: Send + Sync {
    async fn enrich(
        &self,
        events: &[DocumentEvent],
        definition: &IndexDefinition,
        priority: Priority,
    ) -> Result<EnrichedBatch, ReplicationError>;
}

pub struct IndexingPayload {
    events: Arc<Vec<DocumentEvent>>,
    indexer: Arc<dyn DocumentIndexer>,
    commit_user_data: Option<IndexCommitUserData>,
    metrics: Arc<dyn ReplicationMetricsSink>,
}

impl BatchPayload for IndexingPayload {
    fn metrics_sink(&self) -> Option<&dyn ReplicationMetricsSink> {
        Some(self.metrics.as_ref())
    }
}

pub struct IndexingStrategy {
    enricher: Option<Arc<dyn BatchEnricher>>,
    commit_after_batch: bool,
}

impl IndexingStrategy {
    pub fn plain() -> Self {
        Self {
            enricher: None,
            commit_after_batch: false,
        }
    }

    pub fn enriched(enricher: Arc<dyn BatchEnricher>) -> Self {
        Self {
            enricher: Some(enricher),
            commit_after_batch: false,
        }
    }

    /// Enriches every batch and commits the index as soon as it succeeded.
    pub fn materialized_view(enricher: Arc<dyn BatchEnricher>) -> Self {
        Self {
            enricher: Some(enricher),
            commit_after_batch: true,
        }
    }

    pub fn commits_after_batch(&self) -> bool {
        self.commit_after_batch
    }
}

#[async_trait]
impl BatchStrategy for IndexingStrategy {
    type Payload = IndexingPayload;
    const KIND: WorkKind = WorkKind::Indexing;

    async fn process(&self, batch: &SchedulerBatch<IndexingPayload>) -> Result<(), ReplicationError> {
        let payload = batch.payload();
        let events = match &self.enricher {
            Some(enricher) => {
                let definition = payload.indexer.index_definition();
                match enricher.enrich(&payload.events, definition, batch.priority()).await? {
                    EnrichedBatch::Unchanged => payload.events.clone(),
                    EnrichedBatch::Rewritten(events) => Arc::new(events),
                }
            }
            None => payload.events.clone(),
        };

        let indexer = payload.indexer.clone();
        let commit_user_data = payload.commit_user_data.clone();
        let commit = self.commit_after_batch;
        run_blocking(move || {
            apply_batch(indexer.as_ref(), &events, commit_user_data.as_ref(), commit)
        })
        .await
    }
}

fn apply_batch(
    indexer: &dyn DocumentIndexer,
    events: &[DocumentEvent],
    commit_user_data: Option<&IndexCommitUserData>,
    commit: bool,
) -> Result<(), ReplicationError> {
    for event in events {
        indexer.index_document_event(event)?;
    }
    if let Some(reason) = indexer.exceeded_limits() {
        return Err(ReplicationError::FieldExceeded(reason));
    }
    if let Some(commit_user_data) = commit_user_data {
        indexer.update_commit_user_data(commit_user_data);
    }
    if commit {
        indexer.commit()?;
    }
    Ok(())
}

pub type IndexingWorkScheduler = WorkScheduler<IndexingStrategy>;

impl WorkScheduler<IndexingStrategy> {
    /// Creates and starts a scheduler for indexes without auto-embed fields.
    pub fn indexing(pool: WorkerPool, registry: &MetricsRegistry) -> Self {
        Self::create(
            INDEXING_SCOPE,
            IndexingStrategy::plain(),
            pool,
            registry.scope(INDEXING_SCOPE),
        )
    }

    /// Creates and starts a scheduler that embeds auto-embed fields before indexing.
    pub fn embedding(pool: WorkerPool, registry: &MetricsRegistry, stage: Arc<dyn BatchEnricher>) -> Self {
        Self::create(
            EMBEDDING_SCOPE,
            IndexingStrategy::enriched(stage),
            pool,
            registry.scope(EMBEDDING_SCOPE),
        )
    }

    pub fn embedding_materialized_view(
        pool: WorkerPool,
        registry: &MetricsRegistry,
        stage: Arc<dyn BatchEnricher>,
    ) -> Self {
        Self::create(
            EMBEDDING_MATERIALIZED_VIEW_SCOPE,
            IndexingStrategy::materialized_view(stage),
            pool,
            registry.scope(EMBEDDING_MATERIALIZED_VIEW_SCOPE),
        )
    }

    /// Queues `events` for indexing behind the outstanding work of
    /// `generation_id`. `commit_user_data` is handed to the indexer only after
    /// every event of the batch was applied.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule(
        &self,
        events: Vec<DocumentEvent>,
        priority: Priority,
        indexer: Arc<dyn DocumentIndexer>,
        generation_id: GenerationId,
        attempt_id: Option<AttemptId>,
        commit_user_data: Option<IndexCommitUserData>,
        metrics: Arc<dyn ReplicationMetricsSink>,
    ) -> Result<BatchFuture, SchedulerError> {
        let size = events.len();
        self.submit(SchedulerBatch::new(
            generation_id,
            attempt_id,
            priority,
            size,
            IndexingPayload {
                events: Arc::new(events),
                indexer,
                commit_user_data,
                metrics,
            },
        ))
    }
}
