//! `replsched` configuration (`config.toml` inside a `.replsched/` directory).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::{EmbeddingModelCatalog, EmbeddingModelConfig};
use crate::error_recovery::CircuitBreakerConfig;

pub const CONFIG_DIR: &str = ".replsched";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Config already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ReplschedConfig {
    #[serde(default)]
    pub decoding: DecodingConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DecodingConfig {
    /// Batches decoded concurrently across all generations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexingConfig {
    /// Batches indexed concurrently, shared by every indexing scheduler.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Documents embedded together by the embedding stage.
    #[serde(default = "default_max_bundle_documents")]
    pub max_bundle_documents: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_bundle_documents: default_max_bundle_documents(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// Instances per local model (1-8).
    #[serde(default = "default_local_pool_size")]
    pub local_pool_size: usize,
    /// Cache directory for local model files
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub models: Vec<EmbeddingModelConfig>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            local_pool_size: default_local_pool_size(),
            cache_dir: None,
            models: Vec::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_concurrency() -> usize {
    num_cpus::get().max(2)
}

fn default_max_bundle_documents() -> usize {
    crate::embedding::stage::DEFAULT_MAX_BUNDLE_DOCUMENTS
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:9091".to_string()
}

fn default_local_pool_size() -> usize {
    1
}

impl ReplschedConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.decoding.concurrency == 0 {
            return Err(ConfigError::Invalid("decoding.concurrency must be at least 1".into()));
        }
        if self.indexing.concurrency == 0 {
            return Err(ConfigError::Invalid("indexing.concurrency must be at least 1".into()));
        }
        if self.indexing.max_bundle_documents == 0 {
            return Err(ConfigError::Invalid(
                "indexing.max_bundle_documents must be at least 1".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for model in &self.embedding.models {
            if model.dimensions == 0 {
                return Err(ConfigError::Invalid(format!(
                    "embedding model {} has no dimensions",
                    model.name
                )));
            }
            if !seen.insert(model.name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "embedding model {} is configured twice",
                    model.name
                )));
            }
        }
        Ok(())
    }

    pub fn model_catalog(&self) -> EmbeddingModelCatalog {
        EmbeddingModelCatalog::new(self.embedding.models.iter().cloned())
    }
}

/// Config file locations, most specific first: `./.replsched/config.toml`,
/// then `~/.replsched/config.toml`.
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(CONFIG_DIR).join(CONFIG_FILE));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(CONFIG_DIR).join(CONFIG_FILE));
    }
    paths
}

/// Loads the config from `explicit`, or from the first existing search path.
/// Without any file, the defaults apply. Returns the path that was read.
pub fn load_config(explicit: Option<&Path>) -> Result<(ReplschedConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) if !path.exists() => return Err(ConfigError::NotFound(path.to_path_buf())),
        Some(path) => Some(path.to_path_buf()),
        None => search_paths().into_iter().find(|p| p.exists()),
    };

    let config = match &path {
        Some(path) => load_file(path)?,
        None => {
            tracing::debug!("No config file found, using defaults");
            ReplschedConfig::default()
        }
    };
    config.validate()?;
    Ok((config, path))
}

fn load_file(path: &Path) -> Result<ReplschedConfig> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ReplschedConfig::from_toml(&content, path)
}

/// Writes the default config to `path`, creating parent directories.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, DEFAULT_CONFIG).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

pub const DEFAULT_CONFIG: &str = r#"# replsched configuration
# See: replsched config --help

[decoding]
concurrency = 4

[indexing]
concurrency = 4
max_bundle_documents = 1000

[metrics]
enabled = true
listen_addr = "127.0.0.1:9091"

[embedding]
local_pool_size = 1

[[embedding.models]]
name = "bge-small"
provider = "local"
dimensions = 384
local_model = "BGESmallENV15"
batch_size = 256

[embedding.circuit_breaker]
failure_threshold = 5
recovery_threshold = 2
open_secs = 30
"#;
