use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metrics::CacheMetrics;

/// Default number of relationships read per chain batch.
pub const DEFAULT_CHAIN_BATCH_SIZE: usize = 100;
/// Default number of stripes guarding first-time loads.
pub const DEFAULT_LOAD_LOCK_STRIPES: usize = 64;
/// Default number of shards per entity map.
pub const DEFAULT_MAP_SHARDS: usize = 16;
/// Default relationship count at which a node switches to dense chains.
pub const DEFAULT_DENSE_NODE_THRESHOLD: usize = 50;
/// Default byte budget of the LRU eviction policy.
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 64 * 1024 * 1024;

/// Configuration options supplied when opening a cache or kernel.
#[derive(Clone)]
pub struct CacheOptions {
    /// Maximum relationships read from the store per chain batch
    pub chain_batch_size: usize,
    /// Number of striped locks serializing first-time entity loads
    pub load_lock_stripes: usize,
    /// Number of shards each entity map is split across
    pub map_shards: usize,
    /// Relationship count at which the in-memory store converts a node to dense chains
    pub dense_node_threshold: usize,
    /// Byte budget for the LRU eviction policy
    pub cache_budget_bytes: usize,
    /// How long lock acquisition waits before failing
    pub lock_timeout: Duration,
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn CacheMetrics>>,
}

impl CacheOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            chain_batch_size: DEFAULT_CHAIN_BATCH_SIZE,
            load_lock_stripes: DEFAULT_LOAD_LOCK_STRIPES,
            map_shards: DEFAULT_MAP_SHARDS,
            dense_node_threshold: DEFAULT_DENSE_NODE_THRESHOLD,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            lock_timeout: Duration::from_secs(10),
            metrics: None,
        }
    }

    /// Sets how many relationships one chain batch reads.
    pub fn chain_batch_size(mut self, size: usize) -> Self {
        self.chain_batch_size = size;
        self
    }

    /// Sets the number of load-lock stripes.
    pub fn load_lock_stripes(mut self, stripes: usize) -> Self {
        self.load_lock_stripes = stripes;
        self
    }

    /// Sets the number of shards per entity map.
    pub fn map_shards(mut self, shards: usize) -> Self {
        self.map_shards = shards;
        self
    }

    /// Sets the dense-node threshold.
    pub fn dense_node_threshold(mut self, relationships: usize) -> Self {
        self.dense_node_threshold = relationships;
        self
    }

    /// Sets the LRU byte budget.
    pub fn cache_budget_bytes(mut self, bytes: usize) -> Self {
        self.cache_budget_bytes = bytes;
        self
    }

    /// Sets the lock wait timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// File form of [`CacheOptions`]; every field may be left out.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// See [`CacheOptions::chain_batch_size`].
    pub chain_batch_size: Option<usize>,
    /// See [`CacheOptions::load_lock_stripes`].
    pub load_lock_stripes: Option<usize>,
    /// See [`CacheOptions::map_shards`].
    pub map_shards: Option<usize>,
    /// See [`CacheOptions::dense_node_threshold`].
    pub dense_node_threshold: Option<usize>,
    /// See [`CacheOptions::cache_budget_bytes`].
    pub cache_budget_bytes: Option<usize>,
    /// Lock wait timeout in milliseconds.
    pub lock_timeout_ms: Option<u64>,
}

impl CacheConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the config back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Applies the set fields on top of [`CacheOptions::default`].
    pub fn into_options(self) -> Result<CacheOptions, ConfigError> {
        let mut options = CacheOptions::new();
        if let Some(size) = self.chain_batch_size {
            if size == 0 {
                return Err(ConfigError::Invalid("chain_batch_size must be positive"));
            }
            options = options.chain_batch_size(size);
        }
        if let Some(stripes) = self.load_lock_stripes {
            if stripes == 0 {
                return Err(ConfigError::Invalid("load_lock_stripes must be positive"));
            }
            options = options.load_lock_stripes(stripes);
        }
        if let Some(shards) = self.map_shards {
            if shards == 0 {
                return Err(ConfigError::Invalid("map_shards must be positive"));
            }
            options = options.map_shards(shards);
        }
        if let Some(threshold) = self.dense_node_threshold {
            if threshold < 2 {
                return Err(ConfigError::Invalid("dense_node_threshold must be at least 2"));
            }
            options = options.dense_node_threshold(threshold);
        }
        if let Some(bytes) = self.cache_budget_bytes {
            options = options.cache_budget_bytes(bytes);
        }
        if let Some(ms) = self.lock_timeout_ms {
            options = options.lock_timeout(Duration::from_millis(ms));
        }
        Ok(options)
    }
}

/// Errors raised while reading cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read cache config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not valid TOML or has unknown keys.
    #[error("failed to parse cache config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The config could not be rendered as TOML.
    #[error("failed to serialize cache config: {source}")]
    Serialize {
        /// Underlying serializer error.
        source: toml::ser::Error,
    },
    /// A value is out of range.
    #[error("invalid cache config: {0}")]
    Invalid(&'static str),
}
