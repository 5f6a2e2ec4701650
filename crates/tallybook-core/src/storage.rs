use std::{fmt::Display, sync::PoisonError};

use crate::models::{query::IndexQuery, IndexValue, Key, Record};
use crate::schema::{Schema, SchemaStatus, StoreDef};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
    #[error("duplicate key in {}{}: {}", .store, index_suffix(.index), .value)]
    DuplicateKey {
        store: String,
        index: Option<String>,
        value: String,
    },
    #[error("record not found in {store}: {key}")]
    NotFound { store: String, key: String },
    #[error("invalid backup format: {0}")]
    InvalidBackupFormat(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("unsupported schema version {requested} (current {current})")]
    UnsupportedSchemaVersion { current: u32, requested: u32 },
    #[error(
        "restore partially applied: restored [{}], failed [{}]",
        .restored.join(", "),
        failed_list(.failed)
    )]
    PartialRestore {
        restored: Vec<String>,
        failed: Vec<(String, String)>,
    },
    #[error("unknown store: {0}")]
    UnknownStore(String),
    #[error("unknown index {index} on {store}")]
    UnknownIndex { store: String, index: String },
    #[error("invalid record for {store}: {reason}")]
    InvalidRecord { store: String, reason: String },
    #[error("{0}")]
    Validation(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("no active transaction")]
    NoActiveTransaction,
}

fn index_suffix(index: &Option<String>) -> String {
    match index {
        Some(i) => format!(" (index {})", i),
        None => String::new(),
    }
}

fn failed_list(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(store, err)| format!("{}: {}", store, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl StorageError {
    /// Whether the failed operation left some persisted state behind. Only a
    /// partially applied restore does; every other error leaves the stores
    /// as they were.
    pub fn state_changed(&self) -> bool {
        match self {
            StorageError::PartialRestore { restored, .. } => !restored.is_empty(),
            _ => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::StorageUnavailable(_))
    }

    pub fn not_found(store: &str, key: &Key) -> Self {
        StorageError::NotFound {
            store: store.to_string(),
            key: key.to_string(),
        }
    }

    pub fn unavailable(reason: impl Display) -> Self {
        StorageError::StorageUnavailable(reason.to_string())
    }
}

impl<T> From<PoisonError<T>> for StorageError {
    fn from(err: PoisonError<T>) -> Self {
        StorageError::unavailable(format!("engine lock poisoned: {}", err))
    }
}

pub type TransactionId = u64;

/// Record store contract shared by the primary engines and the fallback
/// adapter. Every call is durable before it returns.
pub trait StorageBackend: Send + Sync {
    /// Engine label for logs and `info` output.
    fn engine_name(&self) -> &'static str;

    // Schema
    fn ensure_schema(&self, schema: &Schema, version: u32) -> Result<SchemaStatus, StorageError>;
    fn schema_version(&self) -> Result<u32, StorageError>;
    fn store_names(&self) -> Vec<String>;
    fn store_def(&self, store: &str) -> Option<StoreDef>;

    // Record operations
    fn insert(&self, store: &str, record: Record) -> Result<Key, StorageError>;
    fn get(&self, store: &str, key: &Key) -> Result<Option<Record>, StorageError>;
    fn get_all(&self, store: &str, query: Option<&IndexQuery>) -> Result<Vec<Record>, StorageError>;
    /// Full replace of an existing record; fails with `NotFound` when absent.
    fn update(&self, store: &str, key: &Key, record: Record) -> Result<(), StorageError>;
    /// Create-or-replace keyed by the record's own primary key.
    fn put(&self, store: &str, record: Record) -> Result<Key, StorageError>;
    /// Idempotent: deleting a missing key is not an error.
    fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError>;
    fn query_by_index(&self, store: &str, index: &str, value: &IndexValue) -> Result<Vec<Record>, StorageError>;
    fn count(&self, store: &str, query: Option<&IndexQuery>) -> Result<usize, StorageError>;
    fn clear(&self, store: &str) -> Result<(), StorageError>;
    /// Replaces the whole content of a store. Either every record lands or the
    /// store is left untouched.
    fn replace_all(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_restore_message_and_state() {
        let err = StorageError::PartialRestore {
            restored: vec!["users".into(), "customers".into()],
            failed: vec![("invoices".into(), "duplicate key".into())],
        };
        assert!(err.state_changed());
        assert_eq!(
            err.to_string(),
            "restore partially applied: restored [users, customers], failed [invoices: duplicate key]"
        );

        let nothing = StorageError::PartialRestore {
            restored: vec![],
            failed: vec![("users".into(), "boom".into())],
        };
        assert!(!nothing.state_changed());
    }

    #[test]
    fn test_duplicate_key_message() {
        let err = StorageError::DuplicateKey {
            store: "users".into(),
            index: Some("email".into()),
            value: "a@b.c".into(),
        };
        assert_eq!(err.to_string(), "duplicate key in users (index email): a@b.c");
        assert!(!err.state_changed());
    }
}
