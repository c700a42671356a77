//! Synthetic replication workload.
//!
//! Drives generations of generated documents through the decoding and
//! indexing schedulers the same way a replication manager does: every batch
//! is decoded, then indexed in order, and a failed batch makes the driver
//! cancel the attempt and replay the rest of the generation under a new
//! [`AttemptId`]. Used by the `simulate` and `serve` commands.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ReplschedConfig;
use crate::embedding::local::LocalEmbeddingPool;
use crate::embedding::{
    EmbeddingError, EmbeddingModelConfig, EmbeddingProvider, EmbeddingServiceManager,
    ProviderKind, ServiceTier, VectorOrError,
};
use crate::error::{ReplicationError, SchedulerError};
use crate::metrics::{IndexReplicationMetrics, MetricsRegistry, SchedulerMetricsSnapshot};
use crate::replication::{
    AttemptId, DecodingError, DecodingWorkScheduler, DocumentBatchDecoder, DocumentEvent,
    DocumentIndexer, EventType, FieldPath, GenerationId, IndexCommitUserData, IndexDefinition,
    IndexId, IndexingError, IndexingWorkScheduler, IndexingWorkSchedulerFactory, Priority,
    RawDocument, Vector, VectorField, VectorIndexDefinition,
};

/// Model served by [`HashingProvider`] for simulated vector indexes.
pub const SIMULATED_MODEL: &str = "simulated-hash-embedding";
const SIMULATED_DIMENSIONS: usize = 8;

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Generation {generation} failed: {source}")]
    Generation {
        generation: GenerationId,
        source: ReplicationError,
    },

    #[error("Decoder of generation {0} stopped before handing over its batch")]
    DecodingStopped(GenerationId),
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// Generations replicated concurrently.
    pub generations: usize,
    /// Batches per generation.
    pub batches: usize,
    /// Documents per batch.
    pub batch_size: usize,
    /// Time the indexer spends on every document.
    pub index_delay: Duration,
    /// Fail one batch of the first generation to exercise recovery.
    pub inject_failure: bool,
    /// Rotate generations through auto-embedding vector indexes.
    pub embedding: bool,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            generations: 4,
            batches: 8,
            batch_size: 16,
            index_delay: Duration::ZERO,
            inject_failure: false,
            embedding: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulationReport {
    pub generations: usize,
    pub batches_indexed: usize,
    pub documents_indexed: usize,
    pub failed_batches: u64,
    pub recovered_generations: usize,
    pub elapsed_ms: u64,
    pub schedulers: Vec<SchedulerMetricsSnapshot>,
}

struct GenerationStats {
    batches: usize,
    documents: usize,
    failed_batches: u64,
    recovered: bool,
}

/// Deterministic embeddings derived from a blake3 hash of the text.
pub struct HashingProvider;

pub fn hash_vector(text: &str, dimensions: usize) -> Vector {
    let hash = blake3::hash(text.as_bytes());
    let bytes = hash.as_bytes();
    (0..dimensions)
        .map(|i| f32::from(bytes[i % bytes.len()]) / 255.0)
        .collect()
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    async fn embed(
        &self,
        texts: &[String],
        model: &EmbeddingModelConfig,
        _tier: ServiceTier,
    ) -> Result<Vec<VectorOrError>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                if text.is_empty() {
                    VectorOrError::EmptyInput
                } else {
                    VectorOrError::Vector(hash_vector(text, model.dimensions))
                }
            })
            .collect())
    }
}

/// Builds the embedding service for `config`: a fastembed pool per local
/// model and a [`HashingProvider`] for everything else. A local model that
/// fails to load is skipped; indexes referencing it fail their batches.
pub async fn embedding_service(config: &ReplschedConfig) -> Arc<EmbeddingServiceManager> {
    let service = Arc::new(EmbeddingServiceManager::new(
        config.embedding.circuit_breaker.clone(),
    ));
    service.register_provider(SIMULATED_MODEL, Arc::new(HashingProvider));

    for model in &config.embedding.models {
        match model.provider {
            ProviderKind::Local => {
                let model_config = model.clone();
                let size = config.embedding.local_pool_size;
                let cache_dir = config.embedding.cache_dir.as_ref().map(PathBuf::from);
                let loaded = tokio::task::spawn_blocking(move || {
                    LocalEmbeddingPool::new(&model_config, size, cache_dir)
                })
                .await;
                match loaded {
                    Ok(Ok(pool)) => service.register_provider(&model.name, Arc::new(pool)),
                    Ok(Err(e)) => {
                        tracing::warn!(model = %model.name, "Local model unavailable: {}", e)
                    }
                    Err(e) => {
                        tracing::warn!(model = %model.name, "Local model loader panicked: {}", e)
                    }
                }
            }
            ProviderKind::External => {
                tracing::info!(model = %model.name, "Serving external model with hashing provider");
                service.register_provider(&model.name, Arc::new(HashingProvider));
            }
        }
    }
    service
}

/// In-memory index.
pub struct MemoryIndexer {
    definition: IndexDefinition,
    documents: Mutex<HashMap<String, Value>>,
    pending_checkpoint: Mutex<Option<IndexCommitUserData>>,
    committed: Mutex<Option<IndexCommitUserData>>,
    commits: AtomicUsize,
    delay: Duration,
    fail_next: AtomicBool,
}

impl MemoryIndexer {
    pub fn new(definition: IndexDefinition, delay: Duration) -> Self {
        Self {
            definition,
            documents: Mutex::new(HashMap::new()),
            pending_checkpoint: Mutex::new(None),
            committed: Mutex::new(None),
            commits: AtomicUsize::new(0),
            delay,
            fail_next: AtomicBool::new(false),
        }
    }

    /// Makes the next indexed document fail with a transient error.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    pub fn document_count(&self) -> usize {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn document(&self, id: &Value) -> Option<Value> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id.to_string())
            .cloned()
    }

    /// Checkpoint of the last successfully indexed batch.
    pub fn checkpoint(&self) -> Option<IndexCommitUserData> {
        self.pending_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn committed(&self) -> Option<IndexCommitUserData> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }
}

impl DocumentIndexer for MemoryIndexer {
    fn index_document_event(&self, event: &DocumentEvent) -> Result<(), IndexingError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(IndexingError::Transient("injected indexing failure".into()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let key = event.document_id.to_string();
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        match (&event.event_type, &event.document) {
            (EventType::Delete, _) => {
                documents.remove(&key);
            }
            (_, Some(document)) => {
                documents.insert(key, document.clone());
            }
            (_, None) => {}
        }
        Ok(())
    }

    fn exceeded_limits(&self) -> Option<String> {
        None
    }

    fn update_commit_user_data(&self, commit_user_data: &IndexCommitUserData) {
        *self
            .pending_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(commit_user_data.clone());
    }

    fn commit(&self) -> Result<(), IndexingError> {
        let checkpoint = self.checkpoint();
        *self.committed.lock().unwrap_or_else(PoisonError::into_inner) = checkpoint;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn index_definition(&self) -> &IndexDefinition {
        &self.definition
    }
}

/// Parses JSON documents and hands the decoded batch to the driver.
struct ForwardingDecoder {
    sender: mpsc::UnboundedSender<Vec<DocumentEvent>>,
}

impl DocumentBatchDecoder for ForwardingDecoder {
    fn decode(&self, documents: &[RawDocument]) -> Result<(), DecodingError> {
        let mut events = Vec::with_capacity(documents.len());
        for raw in documents {
            let document = raw
                .parse_json()
                .map_err(|e| DecodingError::Malformed(e.to_string()))?;
            let id = document.get("_id").cloned().unwrap_or(Value::Null);
            events.push(DocumentEvent::insert(id, document));
        }
        self.sender
            .send(events)
            .map_err(|_| DecodingError::Transient("indexing stage is gone".into()))
    }
}

/// Decoding and indexing schedulers shared by all simulated generations.
pub struct Pipeline {
    decoding: DecodingWorkScheduler,
    factory: IndexingWorkSchedulerFactory,
    registry: Arc<MetricsRegistry>,
}

impl Pipeline {
    pub fn new(
        config: &ReplschedConfig,
        registry: Arc<MetricsRegistry>,
        service: Arc<EmbeddingServiceManager>,
    ) -> Self {
        let mut catalog = config.model_catalog();
        catalog.register(EmbeddingModelConfig::external(
            SIMULATED_MODEL,
            SIMULATED_DIMENSIONS,
        ));

        let decoding = DecodingWorkScheduler::decoding(config.decoding.concurrency, &registry);
        let factory = IndexingWorkSchedulerFactory::create(
            config.indexing.concurrency,
            config.indexing.max_bundle_documents,
            &registry,
            service,
            Arc::new(catalog),
        );
        Self {
            decoding,
            factory,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Replicates `options.generations` generations concurrently.
    pub async fn run(&self, options: &SimulationOptions) -> Result<SimulationReport, SimulationError> {
        let started = Instant::now();
        let generations = futures::future::try_join_all(
            (0..options.generations).map(|number| self.run_generation(number, options)),
        )
        .await?;

        let mut report = SimulationReport {
            generations: generations.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
            schedulers: self.registry.snapshot(),
            ..SimulationReport::default()
        };
        for stats in generations {
            report.batches_indexed += stats.batches;
            report.documents_indexed += stats.documents;
            report.failed_batches += stats.failed_batches;
            report.recovered_generations += usize::from(stats.recovered);
        }
        Ok(report)
    }

    async fn run_generation(
        &self,
        number: usize,
        options: &SimulationOptions,
    ) -> Result<GenerationStats, SimulationError> {
        let definition = simulated_definition(number, options.embedding);
        let generation = GenerationId::first(definition.index_id());
        let priority = if number % 2 == 0 {
            Priority::InitialSyncCollectionScan
        } else {
            Priority::SteadyStateChangeStream
        };
        let indexer = Arc::new(MemoryIndexer::new(definition.clone(), options.index_delay));
        if options.inject_failure && number == 0 {
            indexer.fail_next();
        }
        let indexing = self.factory.scheduler_for(&definition);
        let metrics = Arc::new(IndexReplicationMetrics::new());
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let decoder: Arc<dyn DocumentBatchDecoder> = Arc::new(ForwardingDecoder { sender });
        let fail = |source| SimulationError::Generation { generation, source };

        tracing::debug!(
            generation = %generation,
            index = definition.name(),
            scheduler = indexing.name(),
            %priority,
            "Starting simulated generation"
        );

        let mut attempt = AttemptId::new();
        let decoded_futures = (0..options.batches)
            .map(|batch| {
                self.decoding.schedule(
                    generation,
                    Some(attempt),
                    raw_batch(number, batch, options.batch_size),
                    priority,
                    decoder.clone(),
                    metrics.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut decoded = Vec::with_capacity(options.batches);
        let mut pending = Vec::with_capacity(options.batches);
        for (batch, future) in decoded_futures.into_iter().enumerate() {
            future.await.map_err(fail)?;
            let events = receiver
                .recv()
                .await
                .ok_or(SimulationError::DecodingStopped(generation))?;
            decoded.push(events.clone());
            pending.push(schedule_indexing(
                &indexing,
                events,
                priority,
                &indexer,
                generation,
                attempt,
                number,
                batch,
                &metrics,
            )?);
        }
        self.decoding.retire_generation(generation);

        let mut first_pending = 0;
        let mut recovered = false;
        loop {
            let mut failure = None;
            for (offset, future) in pending.drain(..).enumerate() {
                if let Err(e) = future.await {
                    failure = Some((first_pending + offset, e));
                    break;
                }
            }
            let Some((batch, error)) = failure else {
                break;
            };
            if recovered || !error.is_transient() {
                return Err(fail(error));
            }

            tracing::warn!(
                generation = %generation,
                batch,
                error = %error,
                "Batch failed, replaying generation from its last checkpoint"
            );
            indexing
                .cancel(
                    generation,
                    Some(attempt),
                    ReplicationError::cancelled("superseded by a new attempt"),
                )
                .await
                .map_err(fail)?;

            attempt = AttemptId::new();
            recovered = true;
            first_pending = batch;
            for (offset, events) in decoded[batch..].iter().enumerate() {
                pending.push(schedule_indexing(
                    &indexing,
                    events.clone(),
                    priority,
                    &indexer,
                    generation,
                    attempt,
                    number,
                    batch + offset,
                    &metrics,
                )?);
            }
        }
        indexing.retire_generation(generation);

        let snapshot = metrics.snapshot();
        tracing::info!(
            generation = %generation,
            index = definition.name(),
            documents = indexer.document_count(),
            commits = indexer.commits(),
            decoding_time_us = snapshot.decoding_time_us,
            indexing_time_us = snapshot.indexing_time_us,
            "Simulated generation replicated"
        );
        Ok(GenerationStats {
            batches: options.batches,
            documents: indexer.document_count(),
            failed_batches: snapshot.failed_batches,
            recovered,
        })
    }

    pub async fn shutdown(&self) {
        futures::join!(self.decoding.shutdown(), self.factory.shutdown());
    }
}

#[allow(clippy::too_many_arguments)]
fn schedule_indexing(
    scheduler: &IndexingWorkScheduler,
    events: Vec<DocumentEvent>,
    priority: Priority,
    indexer: &Arc<MemoryIndexer>,
    generation: GenerationId,
    attempt: AttemptId,
    number: usize,
    batch: usize,
    metrics: &Arc<IndexReplicationMetrics>,
) -> Result<crate::replication::BatchFuture, SchedulerError> {
    let checkpoint = if priority.is_initial_sync() {
        IndexCommitUserData::from_initial_sync_resume(json!({ "batch": batch }))
    } else {
        IndexCommitUserData::from_resume_token(json!({ "generation": number, "batch": batch }))
    };
    scheduler.schedule(
        events,
        priority,
        indexer.clone(),
        generation,
        Some(attempt),
        Some(checkpoint),
        metrics.clone(),
    )
}

/// Plain search index, auto-embedding vector index, or materialized view,
/// rotating with `number`.
fn simulated_definition(number: usize, embedding: bool) -> IndexDefinition {
    let index_id = IndexId::new();
    if !embedding || number % 3 == 0 {
        return IndexDefinition::Search {
            index_id,
            name: format!("sim-search-{}", number),
        };
    }
    let materialized_view = number % 3 == 2;
    IndexDefinition::Vector(VectorIndexDefinition {
        index_id,
        name: format!("sim-vector-{}", number),
        fields: vec![
            VectorField::AutoEmbed {
                path: FieldPath::new("body"),
                model: SIMULATED_MODEL.to_string(),
            },
            VectorField::Filter {
                path: FieldPath::new("n"),
            },
        ],
        materialized_view,
    })
}

fn raw_batch(number: usize, batch: usize, size: usize) -> Vec<RawDocument> {
    (0..size)
        .map(|i| {
            let n = batch * size + i;
            RawDocument::from_json(&json!({
                "_id": n,
                "n": n,
                "title": format!("document {} of generation {}", n, number),
                "body": format!("replicated text {} (topic {})", n, n % 7),
            }))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ReplschedConfig {
        let mut config = ReplschedConfig::default();
        config.decoding.concurrency = 2;
        config.indexing.concurrency = 3;
        config.indexing.max_bundle_documents = 5;
        config
    }

    async fn pipeline(config: &ReplschedConfig) -> Pipeline {
        let registry = Arc::new(MetricsRegistry::new());
        Pipeline::new(config, registry, embedding_service(config).await)
    }

    #[test]
    fn test_hash_vector_is_deterministic() {
        assert_eq!(hash_vector("alien", 8), hash_vector("alien", 8));
        assert_ne!(hash_vector("alien", 8), hash_vector("aliens", 8));
        assert_eq!(hash_vector("alien", 20).len(), 20);
    }

    #[test]
    fn test_definitions_rotate_flavours() {
        use crate::replication::IndexingFlavour;

        assert_eq!(simulated_definition(0, true).flavour(), IndexingFlavour::Plain);
        assert_eq!(
            simulated_definition(1, true).flavour(),
            IndexingFlavour::AutoEmbedding
        );
        assert_eq!(
            simulated_definition(2, true).flavour(),
            IndexingFlavour::AutoEmbeddingMaterializedView
        );
        assert_eq!(simulated_definition(2, false).flavour(), IndexingFlavour::Plain);
    }

    #[test]
    fn test_memory_indexer_applies_events() {
        let indexer = MemoryIndexer::new(simulated_definition(0, false), Duration::ZERO);
        indexer
            .index_document_event(&DocumentEvent::insert(json!(1), json!({"_id": 1})))
            .unwrap();
        indexer
            .index_document_event(&DocumentEvent::insert(json!(2), json!({"_id": 2})))
            .unwrap();
        indexer.index_document_event(&DocumentEvent::delete(json!(1))).unwrap();
        assert_eq!(indexer.document_count(), 1);

        indexer.fail_next();
        assert!(indexer
            .index_document_event(&DocumentEvent::insert(json!(3), json!({})))
            .is_err());
        indexer
            .index_document_event(&DocumentEvent::insert(json!(3), json!({})))
            .unwrap();
        assert_eq!(indexer.document_count(), 2);
    }

    #[tokio::test]
    async fn test_simulation_indexes_every_document() {
        let config = test_config();
        let pipeline = pipeline(&config).await;
        let options = SimulationOptions {
            generations: 3,
            batches: 4,
            batch_size: 6,
            ..SimulationOptions::default()
        };

        let report = pipeline.run(&options).await.unwrap();
        assert_eq!(report.generations, 3);
        assert_eq!(report.batches_indexed, 12);
        assert_eq!(report.documents_indexed, 72);
        assert_eq!(report.failed_batches, 0);
        assert_eq!(report.recovered_generations, 0);
        assert!(report
            .schedulers
            .iter()
            .any(|s| s.scope == "decodingWorkScheduler" && s.processed_batches == 12));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_simulation_recovers_from_injected_failure() {
        let config = test_config();
        let pipeline = pipeline(&config).await;
        let options = SimulationOptions {
            generations: 2,
            batches: 3,
            batch_size: 4,
            inject_failure: true,
            embedding: false,
            ..SimulationOptions::default()
        };

        let report = pipeline.run(&options).await.unwrap();
        assert_eq!(report.documents_indexed, 24);
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.recovered_generations, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_simulation_after_shutdown_is_rejected() {
        let config = test_config();
        let pipeline = pipeline(&config).await;
        pipeline.shutdown().await;

        let err = pipeline.run(&SimulationOptions::default()).await.unwrap_err();
        assert!(matches!(err, SimulationError::Scheduler(SchedulerError::ShutDown { .. })));
    }
}
