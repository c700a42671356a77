//! Embedding enrichment for auto-embedding vector indexes.
//!
//! Models are looked up in an [`EmbeddingModelCatalog`] and served by
//! [`EmbeddingProvider`]s registered with an [`EmbeddingServiceManager`].
//! [`EmbeddingStage`] plugs both into the indexing scheduler.

pub mod document;
pub mod local;
pub mod service;
pub mod stage;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReplicationError;
use crate::error_recovery::CircuitError;
use crate::replication::{Priority, Vector};

pub use service::EmbeddingServiceManager;
pub use stage::EmbeddingStage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Worth retrying later: throttling, timeouts, open circuit.
    #[error("Transient embedding provider error: {0}")]
    Transient(String),

    /// Retrying the same input will fail again.
    #[error("Non-transient embedding provider error: {0}")]
    NonTransient(String),
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_))
    }

    /// Classifies the failure by the replication phase of the failed batch.
    pub fn into_replication_error(self, priority: Priority) -> ReplicationError {
        match self {
            EmbeddingError::Transient(msg) => ReplicationError::Transient(msg),
            EmbeddingError::NonTransient(msg) => ReplicationError::non_transient_for(priority, msg),
        }
    }
}

impl CircuitError for EmbeddingError {
    fn circuit_open(name: &str) -> Self {
        EmbeddingError::Transient(format!("circuit breaker for {} is open", name))
    }

    fn trips_circuit(&self) -> bool {
        self.is_transient()
    }
}

/// Provider answer for one input text.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorOrError {
    Vector(Vector),
    Error(String),
    /// The input was empty; not an error worth reporting.
    EmptyInput,
}

/// Workload class an embedding request is billed and throttled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceTier {
    CollectionScan,
    ChangeStream,
}

impl ServiceTier {
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::InitialSyncCollectionScan => ServiceTier::CollectionScan,
            Priority::InitialSyncChangeStream | Priority::SteadyStateChangeStream => {
                ServiceTier::ChangeStream
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process fastembed model.
    Local,
    /// Provider implemented outside this crate and registered at startup.
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModelConfig {
    /// Canonical model name, matched case-insensitively.
    pub name: String,
    pub provider: ProviderKind,
    pub dimensions: usize,
    /// Maximum texts per provider request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Estimated token budget per provider request.
    #[serde(default = "default_batch_token_limit")]
    pub batch_token_limit: usize,
    /// fastembed model code for local providers, e.g. `BGESmallENV15`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_model: Option<String>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_token_limit() -> usize {
    120_000
}

impl EmbeddingModelConfig {
    pub fn local(name: impl Into<String>, local_model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            provider: ProviderKind::Local,
            dimensions,
            batch_size: default_batch_size(),
            batch_token_limit: default_batch_token_limit(),
            local_model: Some(local_model.into()),
        }
    }

    pub fn external(name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            name: name.into(),
            provider: ProviderKind::External,
            dimensions,
            batch_size: default_batch_size(),
            batch_token_limit: default_batch_token_limit(),
            local_model: None,
        }
    }
}

/// Models an index definition may reference.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingModelCatalog {
    models: BTreeMap<String, EmbeddingModelConfig>,
}

impl EmbeddingModelCatalog {
    pub fn new(models: impl IntoIterator<Item = EmbeddingModelConfig>) -> Self {
        let mut catalog = Self::default();
        for model in models {
            catalog.register(model);
        }
        catalog
    }

    pub fn register(&mut self, model: EmbeddingModelConfig) {
        self.models.insert(model.name.to_lowercase(), model);
    }

    pub fn get(&self, name: &str) -> Option<&EmbeddingModelConfig> {
        self.models.get(&name.to_lowercase())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Canonical names of every registered model, sorted.
    pub fn supported_models(&self) -> Vec<&str> {
        self.models.values().map(|m| m.name.as_str()).collect()
    }

    /// The config of `name`, or the non-transient error reported for an
    /// index that references an unknown model.
    pub fn resolve(&self, name: &str) -> Result<&EmbeddingModelConfig, EmbeddingError> {
        self.get(name).ok_or_else(|| {
            EmbeddingError::NonTransient(format!(
                "Model {} is not registered, supported models are: [{}]",
                name,
                self.supported_models().join(", ")
            ))
        })
    }
}

/// Backend that turns texts into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds `texts`; the answer has exactly one entry per input, in order.
    async fn embed(
        &self,
        texts: &[String],
        model: &EmbeddingModelConfig,
        tier: ServiceTier,
    ) -> Result<Vec<VectorOrError>, EmbeddingError>;
}
