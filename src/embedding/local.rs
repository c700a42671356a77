//! In-process embedding provider backed by a pool of fastembed models.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Semaphore;

use super::{EmbeddingError, EmbeddingModelConfig, EmbeddingProvider, ServiceTier, VectorOrError};
use crate::replication::Vector;

pub const MAX_POOL_SIZE: usize = 8;

/// fastembed model and output dimensions for a model code from the config.
pub fn fastembed_model(code: &str) -> Option<(EmbeddingModel, usize)> {
    match code {
        "BGESmallENV15" | "bge-small-en-v1.5" => Some((EmbeddingModel::BGESmallENV15, 384)),
        "BGEBaseENV15" | "bge-base-en-v1.5" => Some((EmbeddingModel::BGEBaseENV15, 768)),
        "AllMiniLML6V2" | "all-MiniLM-L6-v2" => Some((EmbeddingModel::AllMiniLML6V2, 384)),
        _ => None,
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("fastembed")
}

/// One loaded model instance.
struct LocalEmbedder {
    model: Mutex<TextEmbedding>,
}

impl LocalEmbedder {
    fn load(model: EmbeddingModel, cache_dir: &PathBuf) -> Result<Self, EmbeddingError> {
        std::fs::create_dir_all(cache_dir).ok();
        let model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir.clone())
                .with_show_download_progress(false),
        )
        .map_err(|e| EmbeddingError::NonTransient(format!("Failed to load local model: {}", e)))?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }

    /// CPU-bound; call from the blocking pool.
    fn embed(&self, texts: Vec<String>) -> Result<Vec<Vector>, EmbeddingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::NonTransient(format!("Mutex poisoned: {}", e)))?;
        model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::NonTransient(format!("Local inference failed: {}", e)))
    }
}

/// N model instances behind a semaphore, picked round-robin.
pub struct LocalEmbeddingPool {
    instances: Vec<Arc<LocalEmbedder>>,
    permits: Semaphore,
    next_idx: AtomicUsize,
    model_name: String,
    dimensions: usize,
}

impl LocalEmbeddingPool {
    /// Loads `size` instances (1 to [`MAX_POOL_SIZE`]) of the local model
    /// named by `config`. Downloads the model on first use.
    pub fn new(
        config: &EmbeddingModelConfig,
        size: usize,
        cache_dir: Option<PathBuf>,
    ) -> Result<Self, EmbeddingError> {
        let size = size.clamp(1, MAX_POOL_SIZE);
        let code = config.local_model.as_deref().ok_or_else(|| {
            EmbeddingError::NonTransient(format!("Model {} has no local_model", config.name))
        })?;
        let (model, dimensions) = fastembed_model(code).ok_or_else(|| {
            EmbeddingError::NonTransient(format!("Unknown local model '{}'", code))
        })?;
        if dimensions != config.dimensions {
            return Err(EmbeddingError::NonTransient(format!(
                "Model {} produces {} dimensions, {} configured",
                code, dimensions, config.dimensions
            )));
        }

        let cache_dir = cache_dir.unwrap_or_else(default_cache_dir);
        let threads_per_instance = (num_cpus::get_physical() / size).max(1);
        let mut instances = Vec::with_capacity(size);
        for i in 0..size {
            instances.push(Arc::new(LocalEmbedder::load(model.clone(), &cache_dir)?));
            tracing::debug!(model = code, "Local embedder {}/{} loaded", i + 1, size);
        }
        tracing::info!(
            model = %config.name,
            instances = size,
            dimensions,
            threads_per_instance,
            "Local embedding pool initialized"
        );

        Ok(Self {
            instances,
            permits: Semaphore::new(size),
            next_idx: AtomicUsize::new(0),
            model_name: config.name.clone(),
            dimensions,
        })
    }

    pub fn size(&self) -> usize {
        self.instances.len()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingPool {
    async fn embed(
        &self,
        texts: &[String],
        _model: &EmbeddingModelConfig,
        _tier: ServiceTier,
    ) -> Result<Vec<VectorOrError>, EmbeddingError> {
        let inputs: Vec<String> = texts.iter().filter(|t| !t.is_empty()).cloned().collect();
        let vectors: Vec<Vector> = if inputs.is_empty() {
            Vec::new()
        } else {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| EmbeddingError::Transient("Local embedding pool closed".into()))?;
            let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.instances.len();
            let embedder = self.instances[idx].clone();
            tokio::task::spawn_blocking(move || embedder.embed(inputs))
                .await
                .map_err(|e| EmbeddingError::Transient(format!("Embedding task failed: {}", e)))??
        };
        let mut vectors = vectors.into_iter();

        Ok(texts
            .iter()
            .map(|text| {
                if text.is_empty() {
                    return VectorOrError::EmptyInput;
                }
                match vectors.next() {
                    Some(vector) => VectorOrError::Vector(vector),
                    None => VectorOrError::Error("no vector returned".into()),
                }
            })
            .collect())
    }
}
