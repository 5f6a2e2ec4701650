use std::sync::Arc;

use serde::Deserialize;
use tallybook_core::{Schema, SchemaStatus, StorageBackend, StorageError};
use tallybook_kv::{FallbackStorage, FileMedium, MemoryMedium};
use tallybook_memory::InMemoryStorage;
use tallybook_sqlite::SqliteStorage;

use crate::config::StorageConfig;

/// Which engine to open first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Sqlite,
    Memory,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageMode {
    Primary,
    /// Running on the key-value fallback: no secondary indexes, no
    /// transactions, whole-store read-modify-write.
    Fallback { reason: String },
}

impl StorageMode {
    pub fn is_fallback(&self) -> bool {
        matches!(self, StorageMode::Fallback { .. })
    }
}

pub struct OpenedStorage {
    pub backend: Arc<dyn StorageBackend>,
    pub mode: StorageMode,
    pub status: SchemaStatus,
}

/// Opens the configured engine at the schema's latest version. A primary
/// engine that reports `StorageUnavailable` is swapped for the fallback
/// adapter; any other error is returned.
pub fn open(config: &StorageConfig, schema: &Schema) -> Result<OpenedStorage, StorageError> {
    let version = schema.latest_version();
    let primary: Result<Arc<dyn StorageBackend>, StorageError> = match config.engine {
        EngineKind::Fallback => return open_fallback(config, schema, "configured".to_string()),
        EngineKind::Memory => Ok(Arc::new(InMemoryStorage::new())),
        EngineKind::Sqlite => SqliteStorage::new(&config.path.to_string_lossy()).map(|s| Arc::new(s) as Arc<dyn StorageBackend>),
    };

    let opened = primary.and_then(|backend| {
        let status = backend.ensure_schema(schema, version)?;
        Ok((backend, status))
    });
    match opened {
        Ok((backend, status)) => {
            tracing::info!(engine = backend.engine_name(), version = status.current, "Storage opened");
            Ok(OpenedStorage {
                backend,
                mode: StorageMode::Primary,
                status,
            })
        }
        Err(e) if e.is_unavailable() => {
            tracing::warn!(engine = ?config.engine, error = %e, "Primary storage unavailable, switching to fallback");
            metrics::increment_counter!("tallybook_fallback_activations_total");
            open_fallback(config, schema, e.to_string())
        }
        Err(e) => Err(e),
    }
}

fn open_fallback(config: &StorageConfig, schema: &Schema, reason: String) -> Result<OpenedStorage, StorageError> {
    let version = schema.latest_version();
    let backend: Arc<dyn StorageBackend> = match &config.fallback_dir {
        Some(dir) => Arc::new(FallbackStorage::new(FileMedium::open(dir)?)?),
        None => {
            tracing::warn!("No fallback directory configured, data will not outlive the process");
            Arc::new(FallbackStorage::new(MemoryMedium::new())?)
        }
    };
    let status = backend.ensure_schema(schema, version)?;
    tracing::info!(engine = backend.engine_name(), reason = %reason, "Fallback storage opened");
    Ok(OpenedStorage {
        backend,
        mode: StorageMode::Fallback { reason },
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallybook_core::SCHEMA_VERSION;

    fn config(engine: EngineKind) -> StorageConfig {
        StorageConfig {
            engine,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_memory_engine_is_primary() {
        let opened = open(&config(EngineKind::Memory), &Schema::accounting()).unwrap();
        assert_eq!(opened.mode, StorageMode::Primary);
        assert_eq!(opened.status.current, SCHEMA_VERSION);
        assert_eq!(opened.backend.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_unopenable_sqlite_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            engine: EngineKind::Sqlite,
            path: dir.path().join("missing").join("tally.db"),
            fallback_dir: Some(dir.path().join("kv")),
        };
        let opened = open(&config, &Schema::accounting()).unwrap();
        assert!(opened.mode.is_fallback());
        assert_eq!(opened.backend.schema_version().unwrap(), SCHEMA_VERSION);
        assert!(dir.path().join("kv").is_dir());
    }

    #[test]
    fn test_sqlite_file_is_primary() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            engine: EngineKind::Sqlite,
            path: dir.path().join("tally.db"),
            fallback_dir: None,
        };
        let opened = open(&config, &Schema::accounting()).unwrap();
        assert_eq!(opened.mode, StorageMode::Primary);
        assert!(!opened.status.is_noop());

        drop(opened);
        let reopened = open(&config, &Schema::accounting()).unwrap();
        assert!(reopened.status.is_noop());
    }
}
