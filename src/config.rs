//! Pipeline configuration.
//!
//! Every field has a default, so a config file only lists what it changes:
//!
//! ```json
//! { "workers": 2, "kind": "instant", "store": { "type": "sqlite" } }
//! ```

use crate::cache::{disk, sqlite, DiskStore, DurableStore, MemoryStore, SqliteStore};
use crate::error::{ConfigError, StorageError};
use crate::pipeline::queue::DEFAULT_QUEUE_CAPACITY;
use crate::state::DerivativeKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on concurrent codec calls; the codec is usually a shared
/// hardware resource.
pub const MAX_WORKERS: usize = 3;

pub const DEFAULT_MEMORY_CAPACITY: usize = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent codec calls (1..=3)
    pub workers: usize,
    /// Display handles kept in memory
    pub memory_capacity: usize,
    /// Pending requests before overflow eviction kicks in
    pub queue_capacity: usize,
    pub kind: DerivativeKind,
    pub store: StoreConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            kind: DerivativeKind::Thumb,
            store: StoreConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: format!("must be between 1 and {MAX_WORKERS}, got {}", self.workers),
            });
        }
        if self.memory_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "memory_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Which durable store backs the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local, lost on exit
    Memory,
    /// One file per derivative; defaults to the platform cache dir
    Disk {
        #[serde(default)]
        dir: Option<PathBuf>,
    },
    /// Single SQLite database; defaults to the platform data dir
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Disk { dir: None }
    }
}

impl StoreConfig {
    /// Open the configured store for a derivative kind.
    pub async fn open(&self, kind: DerivativeKind) -> Result<Arc<dyn DurableStore>, StorageError> {
        let no_default = |what: &str| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not determine a default {what}"),
            ))
        };

        let store: Arc<dyn DurableStore> = match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::Disk { dir } => {
                let dir = match dir {
                    Some(dir) => dir.join(kind.tier_name()),
                    None => disk::default_cache_dir(kind)
                        .ok_or_else(|| no_default("cache directory"))?,
                };
                Arc::new(DiskStore::open(dir).await?)
            }
            StoreConfig::Sqlite { path } => {
                let path = match path {
                    Some(path) => path.clone(),
                    None => sqlite::default_db_path()
                        .ok_or_else(|| no_default("data directory"))?,
                };
                // One database per tier so kinds never share keys
                let path = path.with_extension(format!("{}.db", kind.tier_name()));
                Arc::new(SqliteStore::open(path)?)
            }
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 1);
        assert_eq!(config.queue_capacity, 200);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{ "workers": 2, "kind": "instant", "store": { "type": "sqlite" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.kind, DerivativeKind::Instant);
        assert_eq!(config.store, StoreConfig::Sqlite { path: None });
        assert_eq!(config.memory_capacity, DEFAULT_MEMORY_CAPACITY);
    }

    #[test]
    fn test_rejects_too_many_workers() {
        let config = PipelineConfig {
            workers: 8,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "workers", .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{ "memory_capacity": 0 }"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(&path),
            Err(ConfigError::Invalid { field: "memory_capacity", .. })
        ));

        std::fs::write(&path, r#"{ "store": { "type": "memory" } }"#).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap().store, StoreConfig::Memory);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[tokio::test]
    async fn test_open_disk_store_under_custom_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::Disk {
            dir: Some(dir.path().to_path_buf()),
        };

        let store = config.open(DerivativeKind::Working).await.unwrap();

        assert_eq!(store.name(), "disk");
        assert!(dir.path().join("working").is_dir());
    }
}
