//! Picks the indexing scheduler an index's batches go through.

use std::sync::Arc;

use crate::embedding::{EmbeddingModelCatalog, EmbeddingServiceManager, EmbeddingStage};
use crate::metrics::MetricsRegistry;

use super::definition::{IndexDefinition, IndexingFlavour};
use super::indexing::IndexingWorkScheduler;
use super::scheduler::WorkerPool;

/// Owns one indexing scheduler per [`IndexingFlavour`].
pub struct IndexingWorkSchedulerFactory {
    indexing: Arc<IndexingWorkScheduler>,
    embedding: Arc<IndexingWorkScheduler>,
    materialized_view: Arc<IndexingWorkScheduler>,
}

impl IndexingWorkSchedulerFactory {
    /// Creates and starts the three schedulers. They draw from one pool of
    /// `concurrency` workers.
    pub fn create(
        concurrency: usize,
        max_bundle_documents: usize,
        registry: &MetricsRegistry,
        service: Arc<EmbeddingServiceManager>,
        catalog: Arc<EmbeddingModelCatalog>,
    ) -> Self {
        let pool = WorkerPool::new(concurrency);
        let stage = EmbeddingStage::new(service.clone(), catalog.clone())
            .with_max_bundle_documents(max_bundle_documents);
        let materialized_view_stage = EmbeddingStage::materialized_view(service, catalog)
            .with_max_bundle_documents(max_bundle_documents);

        Self {
            indexing: Arc::new(IndexingWorkScheduler::indexing(pool.clone(), registry)),
            embedding: Arc::new(IndexingWorkScheduler::embedding(
                pool.clone(),
                registry,
                Arc::new(stage),
            )),
            materialized_view: Arc::new(IndexingWorkScheduler::embedding_materialized_view(
                pool,
                registry,
                Arc::new(materialized_view_stage),
            )),
        }
    }

    pub fn from_schedulers(
        indexing: Arc<IndexingWorkScheduler>,
        embedding: Arc<IndexingWorkScheduler>,
        materialized_view: Arc<IndexingWorkScheduler>,
    ) -> Self {
        Self {
            indexing,
            embedding,
            materialized_view,
        }
    }

    pub fn scheduler_for(&self, definition: &IndexDefinition) -> Arc<IndexingWorkScheduler> {
        self.scheduler_for_flavour(definition.flavour())
    }

    pub fn scheduler_for_flavour(&self, flavour: IndexingFlavour) -> Arc<IndexingWorkScheduler> {
        match flavour {
            IndexingFlavour::Plain => self.indexing.clone(),
            IndexingFlavour::AutoEmbedding => self.embedding.clone(),
            IndexingFlavour::AutoEmbeddingMaterializedView => self.materialized_view.clone(),
        }
    }

    pub async fn shutdown(&self) {
        futures::join!(
            self.indexing.shutdown(),
            self.embedding.shutdown(),
            self.materialized_view.shutdown(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingModelConfig;
    use crate::error_recovery::CircuitBreakerConfig;
    use crate::replication::definition::{VectorField, VectorIndexDefinition};
    use crate::replication::indexing::{
        EMBEDDING_MATERIALIZED_VIEW_SCOPE, EMBEDDING_SCOPE, INDEXING_SCOPE,
    };
    use crate::replication::{FieldPath, IndexId};

    fn vector(fields: Vec<VectorField>, materialized_view: bool) -> IndexDefinition {
        IndexDefinition::Vector(VectorIndexDefinition {
            index_id: IndexId::new(),
            name: "vectors".into(),
            fields,
            materialized_view,
        })
    }

    #[tokio::test]
    async fn test_routes_by_flavour() {
        let registry = MetricsRegistry::new();
        let factory = IndexingWorkSchedulerFactory::create(
            3,
            100,
            &registry,
            Arc::new(EmbeddingServiceManager::new(CircuitBreakerConfig::default())),
            Arc::new(EmbeddingModelCatalog::new([EmbeddingModelConfig::external("voyage-3-large", 8)])),
        );

        let search = IndexDefinition::Search {
            index_id: IndexId::new(),
            name: "default".into(),
        };
        let auto_embed = vec![VectorField::AutoEmbed {
            path: FieldPath::new("plot"),
            model: "voyage-3-large".into(),
        }];

        assert_eq!(factory.scheduler_for(&search).name(), INDEXING_SCOPE);
        assert_eq!(
            factory.scheduler_for(&vector(auto_embed.clone(), false)).name(),
            EMBEDDING_SCOPE
        );
        assert_eq!(
            factory.scheduler_for(&vector(auto_embed, true)).name(),
            EMBEDDING_MATERIALIZED_VIEW_SCOPE
        );

        let embedding = factory.scheduler_for_flavour(IndexingFlavour::AutoEmbedding);
        assert_eq!(embedding.pool().size(), 3);
        assert!(Arc::ptr_eq(
            &embedding,
            &factory.scheduler_for_flavour(IndexingFlavour::AutoEmbedding)
        ));
        factory.shutdown().await;
    }
}
