//! Enrichment stage of the auto-embedding indexing schedulers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::error::ReplicationError;
use crate::replication::indexing::{BatchEnricher, EnrichedBatch};
use crate::replication::{DocumentEvent, IndexDefinition, Priority};

use super::document::{self, AutoEmbedField, ModelEmbeddings};
use super::{
    EmbeddingError, EmbeddingModelCatalog, EmbeddingModelConfig, EmbeddingServiceManager, ServiceTier,
};

pub const DEFAULT_MAX_BUNDLE_DOCUMENTS: usize = 1000;

/// Documents embedded together, with the texts each model still has to embed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBundle {
    /// Positions of the bundled events in the batch.
    pub events: Vec<usize>,
    pub texts: BTreeMap<String, BTreeSet<String>>,
}

/// Groups the events that need embeddings into bundles of at most
/// `max_documents` events whose texts still have to be embedded. Events with
/// nothing left to embed (every text reusable, or no text at all) share one
/// trailing bundle without texts.
pub fn text_value_bundles(
    events: &[DocumentEvent],
    fields: &[AutoEmbedField],
    max_documents: usize,
) -> Vec<TextBundle> {
    let max_documents = max_documents.max(1);
    let mut bundles = Vec::new();
    let mut current = TextBundle::default();
    let mut without_texts = TextBundle::default();

    for (position, event) in events.iter().enumerate() {
        if !document::needs_embedding(event) {
            continue;
        }
        let Some(doc) = &event.document else {
            continue;
        };

        let mut texts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for field in fields {
            let reusable = event.auto_embeddings.get(&field.path);
            for text in document::field_texts(doc, &field.path) {
                if reusable.is_some_and(|known| known.contains_key(&text)) {
                    continue;
                }
                texts.entry(field.model.clone()).or_default().insert(text);
            }
        }

        if texts.is_empty() {
            without_texts.events.push(position);
            continue;
        }
        if current.events.len() == max_documents {
            bundles.push(std::mem::take(&mut current));
        }
        current.events.push(position);
        for (model, model_texts) in texts {
            current.texts.entry(model).or_default().extend(model_texts);
        }
    }

    if !current.events.is_empty() {
        bundles.push(current);
    }
    if !without_texts.events.is_empty() {
        bundles.push(without_texts);
    }
    bundles
}

/// Embeds the auto-embed fields of a batch before it is indexed.
pub struct EmbeddingStage {
    service: Arc<EmbeddingServiceManager>,
    catalog: Arc<EmbeddingModelCatalog>,
    max_bundle_documents: usize,
    materialized_view: bool,
}

impl EmbeddingStage {
    /// Stage attaching vectors to events of plain auto-embedding indexes.
    pub fn new(service: Arc<EmbeddingServiceManager>, catalog: Arc<EmbeddingModelCatalog>) -> Self {
        Self {
            service,
            catalog,
            max_bundle_documents: DEFAULT_MAX_BUNDLE_DOCUMENTS,
            materialized_view: false,
        }
    }

    /// Stage rewriting documents for materialized-view indexes.
    pub fn materialized_view(
        service: Arc<EmbeddingServiceManager>,
        catalog: Arc<EmbeddingModelCatalog>,
    ) -> Self {
        Self {
            materialized_view: true,
            ..Self::new(service, catalog)
        }
    }

    pub fn with_max_bundle_documents(mut self, max_bundle_documents: usize) -> Self {
        self.max_bundle_documents = max_bundle_documents.max(1);
        self
    }

    fn resolve_fields(
        &self,
        definition: &IndexDefinition,
        priority: Priority,
    ) -> Result<(Vec<AutoEmbedField>, HashMap<String, EmbeddingModelConfig>), ReplicationError> {
        let Some(vector) = definition.as_vector() else {
            return Ok((Vec::new(), HashMap::new()));
        };
        let mut fields = Vec::new();
        let mut models = HashMap::new();
        for (path, model) in vector.auto_embed_fields() {
            let config = self
                .catalog
                .resolve(model)
                .map_err(|e| e.into_replication_error(priority))?;
            fields.push(AutoEmbedField {
                path: path.clone(),
                model: config.name.clone(),
            });
            models.insert(config.name.clone(), config.clone());
        }
        Ok((fields, models))
    }
}

#[async_trait]
impl BatchEnricher for EmbeddingStage {
    async fn enrich(
        &self,
        events: &[DocumentEvent],
        definition: &IndexDefinition,
        priority: Priority,
    ) -> Result<EnrichedBatch, ReplicationError> {
        let (fields, models) = self.resolve_fields(definition, priority)?;
        if fields.is_empty() || !events.iter().any(document::needs_embedding) {
            return Ok(EnrichedBatch::Unchanged);
        }

        let started = Instant::now();
        let tier = ServiceTier::for_priority(priority);
        let bundles = text_value_bundles(events, &fields, self.max_bundle_documents);

        let requests = bundles
            .iter()
            .flat_map(|bundle| bundle.texts.iter())
            .filter_map(|(model, texts)| {
                let config = models.get(model)?;
                let texts: Vec<String> = texts.iter().cloned().collect();
                Some(async move {
                    let embeddings = self.service.embed(texts, config, tier).await?;
                    Ok::<_, EmbeddingError>((model.clone(), embeddings))
                })
            });
        let responses = try_join_all(requests)
            .await
            .map_err(|e| e.into_replication_error(priority))?;
        let request_count = responses.len();

        let mut embeddings = ModelEmbeddings::new();
        for (model, vectors) in responses {
            embeddings.entry(model).or_default().extend(vectors);
        }

        let rewritten = events
            .iter()
            .map(|event| {
                if !document::needs_embedding(event) {
                    event.clone()
                } else if self.materialized_view {
                    document::materialize(event, &fields, &embeddings)
                } else {
                    document::attach_embeddings(event, &fields, &embeddings)
                }
            })
            .collect();

        tracing::debug!(
            index = definition.name(),
            events = events.len(),
            bundles = bundles.len(),
            requests = request_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Embedded batch"
        );
        Ok(EnrichedBatch::Rewritten(rewritten))
    }
}
