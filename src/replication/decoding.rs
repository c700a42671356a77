//! Decoding scheduler: turns raw change-stream documents into document events
//! on the blocking pool, one batch per generation at a time.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{ReplicationError, SchedulerError};
use crate::metrics::{MetricsRegistry, ReplicationMetricsSink, WorkKind};

use super::completion::BatchFuture;
use super::event::RawDocument;
use super::generation::{AttemptId, GenerationId, Priority};
use super::queue::SchedulerBatch;
use super::scheduler::{run_blocking, BatchPayload, BatchStrategy, WorkScheduler, WorkerPool};

pub const DECODING_SCOPE: &str = "decodingWorkScheduler";

#[derive(Error, Debug)]
pub enum DecodingError {
    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Transient decoding failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}

impl From<DecodingError> for ReplicationError {
    fn from(err: DecodingError) -> Self {
        match err {
            DecodingError::Malformed(msg) => ReplicationError::Failed(msg),
            DecodingError::Transient(msg) => ReplicationError::Transient(msg),
            DecodingError::Replication(inner) => inner,
        }
    }
}

/// Decodes a batch and hands the decoded events downstream, typically by
/// scheduling them on an indexing scheduler. Runs on the blocking pool.
pub trait DocumentBatchDecoder: Send + Sync {
    fn decode(&self, documents: &[RawDocument]) -> Result<(), DecodingError>;
}

pub struct DecodingPayload {
    documents: Arc<Vec<RawDocument>>,
    decoder: Arc<dyn DocumentBatchDecoder>,
    metrics: Arc<dyn ReplicationMetricsSink>,
}

impl BatchPayload for DecodingPayload {
    fn metrics_sink(&self) -> Option<&dyn ReplicationMetricsSink> {
        Some(self.metrics.as_ref())
    }
}

pub struct DecodingStrategy;

#[async_trait]
impl BatchStrategy for DecodingStrategy {
    type Payload = DecodingPayload;
    const KIND: WorkKind = WorkKind::Decoding;

    async fn process(&self, batch: &SchedulerBatch<DecodingPayload>) -> Result<(), ReplicationError> {
        let payload = batch.payload();
        let decoder = payload.decoder.clone();
        let documents = payload.documents.clone();
        run_blocking(move || decoder.decode(&documents).map_err(ReplicationError::from)).await
    }
}

pub type DecodingWorkScheduler = WorkScheduler<DecodingStrategy>;

impl WorkScheduler<DecodingStrategy> {
    /// Creates and starts a decoding scheduler with its own pool of `concurrency` workers.
    pub fn decoding(concurrency: usize, registry: &MetricsRegistry) -> Self {
        Self::create(
            DECODING_SCOPE,
            DecodingStrategy,
            WorkerPool::new(concurrency),
            registry.scope(DECODING_SCOPE),
        )
    }

    /// Queues `documents` for decoding behind the outstanding work of `generation_id`.
    pub fn schedule(
        &self,
        generation_id: GenerationId,
        attempt_id: Option<AttemptId>,
        documents: Vec<RawDocument>,
        priority: Priority,
        decoder: Arc<dyn DocumentBatchDecoder>,
        metrics: Arc<dyn ReplicationMetricsSink>,
    ) -> Result<BatchFuture, SchedulerError> {
        let size = documents.len();
        self.submit(SchedulerBatch::new(
            generation_id,
            attempt_id,
            priority,
            size,
            DecodingPayload {
                documents: Arc::new(documents),
                decoder,
                metrics,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::metrics::IndexReplicationMetrics;
    use crate::replication::generation::IndexId;

    /// Records decoded `_id`s, or fails every batch with `fail_with`.
    struct RecordingDecoder {
        decoded: Mutex<Vec<i64>>,
        fail_with: Option<fn() -> DecodingError>,
    }

    impl RecordingDecoder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                decoded: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        fn failing(fail_with: fn() -> DecodingError) -> Arc<Self> {
            Arc::new(Self {
                decoded: Mutex::new(Vec::new()),
                fail_with: Some(fail_with),
            })
        }
    }

    impl DocumentBatchDecoder for RecordingDecoder {
        fn decode(&self, documents: &[RawDocument]) -> Result<(), DecodingError> {
            if let Some(fail_with) = self.fail_with {
                return Err(fail_with());
            }
            let mut decoded = self.decoded.lock().unwrap();
            for document in documents {
                let value = document
                    .parse_json()
                    .map_err(|e| DecodingError::Malformed(e.to_string()))?;
                decoded.push(value["_id"].as_i64().unwrap_or_default());
            }
            Ok(())
        }
    }

    fn documents(ids: &[i64]) -> Vec<RawDocument> {
        ids.iter()
            .map(|id| RawDocument::from_json(&json!({ "_id": id })))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decodes_batches_in_order() {
        let registry = MetricsRegistry::new();
        let scheduler = DecodingWorkScheduler::decoding(2, &registry);
        let decoder = RecordingDecoder::new();
        let index_metrics = Arc::new(IndexReplicationMetrics::new());
        let gen = GenerationId::first(IndexId::new());

        let first = scheduler
            .schedule(
                gen,
                None,
                documents(&[1, 2]),
                Priority::SteadyStateChangeStream,
                decoder.clone(),
                index_metrics.clone(),
            )
            .unwrap();
        let second = scheduler
            .schedule(
                gen,
                None,
                documents(&[3]),
                Priority::SteadyStateChangeStream,
                decoder.clone(),
                index_metrics.clone(),
            )
            .unwrap();

        let outcomes = tokio::time::timeout(Duration::from_secs(5), async {
            (first.await, second.await)
        })
        .await
        .unwrap();
        assert_eq!(outcomes, (Ok(()), Ok(())));
        assert_eq!(*decoder.decoded.lock().unwrap(), vec![1, 2, 3]);

        let snapshot = index_metrics.snapshot();
        assert_eq!(snapshot.decoded_batches, 2);
        assert_eq!(snapshot.decoded_events, 3);

        let scheduler_metrics = registry.scope(DECODING_SCOPE).snapshot();
        assert_eq!(scheduler_metrics.enqueue_calls, 2);
        assert_eq!(scheduler_metrics.dequeue_calls, 2);
        assert_eq!(scheduler_metrics.queued_batches, 0);
        scheduler.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_decoding_errors_are_mapped() {
        let registry = MetricsRegistry::new();
        let scheduler = DecodingWorkScheduler::decoding(1, &registry);
        let index_metrics = Arc::new(IndexReplicationMetrics::new());

        let transient = scheduler
            .schedule(
                GenerationId::first(IndexId::new()),
                None,
                documents(&[1]),
                Priority::InitialSyncCollectionScan,
                RecordingDecoder::failing(|| DecodingError::Transient("cursor killed".into())),
                index_metrics.clone(),
            )
            .unwrap();
        assert_eq!(
            transient.await,
            Err(ReplicationError::Transient("cursor killed".into()))
        );

        let malformed = scheduler
            .schedule(
                GenerationId::first(IndexId::new()),
                None,
                vec![RawDocument::new(b"{oops".to_vec())],
                Priority::InitialSyncCollectionScan,
                RecordingDecoder::new(),
                index_metrics.clone(),
            )
            .unwrap();
        assert!(matches!(malformed.await, Err(ReplicationError::Failed(_))));
        assert_eq!(index_metrics.snapshot().failed_batches, 2);
        assert_eq!(registry.scope(DECODING_SCOPE).snapshot().failed_batches, 2);
        scheduler.shutdown().await;
    }
}
