//! Core types and traits for Tallybook storage engines.
//!
//! This crate provides the `StorageBackend` trait, the schema registry and
//! the value types shared by the primary engines and the fallback adapter.

pub mod dates;
pub mod models;
pub mod schema;
pub mod storage;
pub mod transaction;

// Re-export key types at crate root for convenience
pub use models::query::{IndexQuery, KeyRange};
pub use models::report::{BulkFailure, BulkReport, StoreOutcome};
pub use models::{IndexValue, Key, Record};
pub use schema::{
    FieldDef, FieldType, IndexDef, Schema, SchemaStatus, StoreDef, UpgradePlan, REQUIRED_BACKUP_STORES,
    SCHEMA_VERSION,
};
pub use storage::{StorageBackend, StorageError, TransactionId};
pub use transaction::{TransactionGate, Turn};
