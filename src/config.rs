//! YAML configuration for a set of queues.
//!
//! ```yaml
//! queues:
//!   - name: emails
//!     storage:
//!       type: file
//!       path: ./data/queues.log
//!     mode: lifo
//!     dequeue_size: 10
//!     dequeue_interval_ms: 1000
//!     priority: [urgent, normal]
//!     keys:
//!       urgent:
//!         max_retry: 3
//!   - name: events
//!     storage:
//!       type: redis_set
//!       url: redis://localhost:6379
//!       ttl_ms: 60000
//! ```
//!
//! Queues that point at the same file share one log file handle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, StorageError};
use crate::registry::Registry;
use crate::scheduler::{KeyRules, Payload, Queue, QueueBuilder, WILDCARD};
use crate::storage::{
    FileSystemStorage, MemoryStorage, Mode, RedisListStorage, RedisSetStorage, SharedLogFile,
    Storage,
};

fn default_true() -> bool {
    true
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
    RedisList {
        url: String,
    },
    RedisSet {
        url: String,
        /// Items older than this are evicted.
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
}

/// Per-key rule overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub dequeue_size: Option<usize>,
    #[serde(default)]
    pub dequeue_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_retry: Option<u32>,
}

impl KeyConfig {
    fn validate(&self, queue: &str, scope: &str) -> Result<(), ConfigError> {
        if self.dequeue_size == Some(0) {
            return Err(invalid(queue, &format!("{}dequeue_size", scope), "must be at least 1"));
        }
        if self.max_retry == Some(0) {
            return Err(invalid(queue, &format!("{}max_retry", scope), "must be at least 1"));
        }
        Ok(())
    }

    fn apply<T: Payload>(&self, mut rules: KeyRules<T>) -> KeyRules<T> {
        if let Some(mode) = self.mode {
            rules = rules.with_mode(mode);
        }
        if let Some(size) = self.dequeue_size {
            rules = rules.with_dequeue_size(size);
        }
        if let Some(ms) = self.dequeue_interval_ms {
            rules = rules.with_dequeue_interval(Duration::from_millis(ms));
        }
        if let Some(max_retry) = self.max_retry {
            rules = rules.with_max_retry(max_retry);
        }
        rules
    }
}

/// Configuration of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gzip: bool,
    /// Queue-wide rules.
    #[serde(flatten)]
    pub defaults: KeyConfig,
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
    #[serde(default)]
    pub priority: Vec<String>,
    #[serde(default)]
    pub ignore_not_prioritized: bool,
    #[serde(default)]
    pub randomize_priority: bool,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyConfig>,
}

fn has_wildcard<'a>(mut keys: impl Iterator<Item = &'a String>) -> bool {
    keys.any(|k| k == WILDCARD)
}

fn invalid(queue: &str, field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        queue: queue.to_string(),
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl QueueConfig {
    /// A memory-backed queue with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageConfig::default(),
            gzip: false,
            defaults: KeyConfig::default(),
            tick_interval_ms: None,
            priority: Vec::new(),
            ignore_not_prioritized: false,
            randomize_priority: false,
            ignore: Vec::new(),
            autostart: true,
            keys: BTreeMap::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(invalid(name, "name", "must not be empty"));
        }

        self.defaults.validate(name, "")?;
        if self.tick_interval_ms == Some(0) {
            return Err(invalid(name, "tick_interval_ms", "must be at least 1"));
        }

        match &self.storage {
            StorageConfig::File { path } if path.as_os_str().is_empty() => {
                return Err(invalid(name, "storage.path", "must not be empty"));
            }
            StorageConfig::RedisSet {
                ttl_ms: Some(0), ..
            } => {
                return Err(invalid(name, "storage.ttl_ms", "must be at least 1"));
            }
            _ => {}
        }

        if has_wildcard(self.priority.iter()) {
            return Err(invalid(name, "priority", "'*' is reserved"));
        }
        if has_wildcard(self.ignore.iter()) {
            return Err(invalid(name, "ignore", "'*' is reserved; set autostart: false instead"));
        }
        if has_wildcard(self.keys.keys()) {
            return Err(invalid(name, "keys", "'*' is reserved; use queue-level fields"));
        }

        for (key, overrides) in &self.keys {
            overrides.validate(name, &format!("keys.{}.", key))?;
        }
        Ok(())
    }

    /// Creates a builder carrying every configured setting except callbacks.
    pub fn builder<T: Payload>(&self, storage: Arc<dyn Storage>) -> QueueBuilder<T> {
        let mut builder = QueueBuilder::new(self.name.clone(), storage)
            .with_gzip(self.gzip)
            .with_priority(self.priority.iter().cloned())
            .with_ignore_not_prioritized(self.ignore_not_prioritized)
            .with_randomize_priority(self.randomize_priority)
            .with_ignored_keys(self.ignore.iter().cloned())
            .with_autostart(self.autostart);

        if let Some(ms) = self.tick_interval_ms {
            builder = builder.with_tick_interval(Duration::from_millis(ms));
        }
        if let Some(mode) = self.defaults.mode {
            builder = builder.with_mode(mode);
        }
        if let Some(size) = self.defaults.dequeue_size {
            builder = builder.with_dequeue_size(size);
        }
        if let Some(ms) = self.defaults.dequeue_interval_ms {
            builder = builder.with_dequeue_interval(Duration::from_millis(ms));
        }
        if let Some(max_retry) = self.defaults.max_retry {
            builder = builder.with_max_retry(max_retry);
        }

        for (key, overrides) in &self.keys {
            builder = builder.with_key_rules(key.clone(), overrides.apply(KeyRules::new()));
        }
        builder
    }
}

/// Opens storages, sharing file handles between queues.
#[derive(Default)]
pub struct StorageFactory {
    files: HashMap<PathBuf, Arc<SharedLogFile>>,
}

impl StorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the storage configured for `queue`.
    pub async fn open(&mut self, queue: &QueueConfig) -> Result<Arc<dyn Storage>, ConfigError> {
        let name = queue.name.clone();
        let wrap = |source: StorageError| ConfigError::Storage {
            queue: queue.name.clone(),
            source,
        };

        let storage: Arc<dyn Storage> = match &queue.storage {
            StorageConfig::Memory => Arc::new(MemoryStorage::new(name)),
            StorageConfig::File { path } => {
                let file = match self.files.get(path) {
                    Some(file) => Arc::clone(file),
                    None => {
                        let file = SharedLogFile::open(path.clone()).map_err(wrap)?;
                        self.files.insert(path.clone(), Arc::clone(&file));
                        file
                    }
                };
                Arc::new(FileSystemStorage::new(name, file).map_err(wrap)?)
            }
            StorageConfig::RedisList { url } => {
                Arc::new(RedisListStorage::connect(name, url).await.map_err(wrap)?)
            }
            StorageConfig::RedisSet { url, ttl_ms } => {
                let ttl = ttl_ms.map(Duration::from_millis);
                Arc::new(RedisSetStorage::connect(name, url, ttl).await.map_err(wrap)?)
            }
        };

        Ok(storage)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
}

impl Config {
    /// Reads and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates configuration text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::DuplicateQueue(queue.name.clone()));
            }
        }
        Ok(())
    }

    /// Opens every storage, lets `configure` add callbacks, then builds and
    /// registers each queue.
    pub async fn build_all<T, F>(&self, registry: &Registry, configure: F) -> Result<Vec<Queue<T>>, ConfigError>
    where
        T: Payload,
        F: Fn(&QueueConfig, QueueBuilder<T>) -> QueueBuilder<T>,
    {
        let mut factory = StorageFactory::new();
        let mut queues = Vec::with_capacity(self.queues.len());

        for queue_config in &self.queues {
            let storage = factory.open(queue_config).await?;
            let builder = configure(queue_config, queue_config.builder(storage));
            let queue = builder.register(registry).await?;

            info!(
                queue = %queue_config.name,
                storage = %queue.storage().kind(),
                autostart = queue_config.autostart,
                "Queue configured"
            );
            queues.push(queue);
        }

        Ok(queues)
    }
}
