//! Routes embedding requests to the provider registered for a model.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::try_join_all;

use crate::error_recovery::{CircuitBreaker, CircuitBreakerConfig};
use crate::replication::Vector;

use super::{EmbeddingError, EmbeddingModelConfig, EmbeddingProvider, ServiceTier, VectorOrError};

/// Heuristic characters per token used to size provider requests.
const AVG_CHARS_PER_TOKEN: f64 = 3.0;

#[derive(Clone)]
struct ProviderEntry {
    provider: Arc<dyn EmbeddingProvider>,
    breaker: CircuitBreaker,
}

/// Holds one provider per model, each behind its own circuit breaker.
pub struct EmbeddingServiceManager {
    providers: RwLock<HashMap<String, ProviderEntry>>,
    breaker_config: CircuitBreakerConfig,
}

impl EmbeddingServiceManager {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            breaker_config,
        }
    }

    /// Registers (or replaces) the provider serving `model`.
    pub fn register_provider(&self, model: &str, provider: Arc<dyn EmbeddingProvider>) {
        let key = model.to_lowercase();
        let entry = ProviderEntry {
            provider,
            breaker: CircuitBreaker::from_config(format!("embedding:{}", key), &self.breaker_config),
        };
        self.providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    pub fn has_provider(&self, model: &str) -> bool {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&model.to_lowercase())
    }

    /// Embeds `texts` with `model` and returns the vector of every text the
    /// provider could embed. Texts the provider rejected individually are
    /// skipped with a warning.
    pub async fn embed(
        &self,
        texts: Vec<String>,
        model: &EmbeddingModelConfig,
        tier: ServiceTier,
    ) -> Result<HashMap<String, Vector>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(HashMap::new());
        }
        let entry = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&model.name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                EmbeddingError::NonTransient(format!(
                    "No embedding provider registered for model {}",
                    model.name
                ))
            })?;

        let requests = generate_batches(texts, model.batch_size, model.batch_token_limit)
            .into_iter()
            .map(|batch| {
                let entry = entry.clone();
                async move {
                    let results = entry
                        .breaker
                        .call(|| entry.provider.embed(&batch, model, tier))
                        .await?;
                    if results.len() != batch.len() {
                        return Err(EmbeddingError::NonTransient(format!(
                            "Provider for {} returned {} vectors for {} texts",
                            model.name,
                            results.len(),
                            batch.len()
                        )));
                    }
                    Ok::<_, EmbeddingError>(batch.into_iter().zip(results).collect::<Vec<_>>())
                }
            });

        let mut embeddings = HashMap::new();
        for (text, result) in try_join_all(requests).await?.into_iter().flatten() {
            match result {
                VectorOrError::Vector(vector) => {
                    embeddings.insert(text, vector);
                }
                VectorOrError::Error(error) => {
                    tracing::warn!(
                        model = %model.name,
                        chars = text.len(),
                        error = %error,
                        "No embedding for text"
                    );
                }
                VectorOrError::EmptyInput => {}
            }
        }
        Ok(embeddings)
    }
}

/// Splits `inputs` into requests of at most `batch_size` texts and an
/// estimated `batch_token_limit` tokens. A single oversized text still gets
/// its own request.
pub fn generate_batches(
    inputs: Vec<String>,
    batch_size: usize,
    batch_token_limit: usize,
) -> Vec<Vec<String>> {
    let batch_size = batch_size.max(1);
    let token_limit = batch_token_limit as f64;
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0.0;

    for input in inputs {
        let tokens = input.chars().count() as f64 / AVG_CHARS_PER_TOKEN;
        let full = current.len() == batch_size;
        let over_budget = !current.is_empty() && current_tokens + tokens >= token_limit;
        if full || over_budget {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0.0;
        }
        current.push(input);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
