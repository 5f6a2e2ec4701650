pub mod accounting;
pub mod backup;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod integrity;
pub mod query;
pub mod render;
pub mod scheduler;
pub mod storage;

pub use backup::{BackupEngine, BackupKind, ExportData, RestoreReport};
pub use query::{BulkPolicy, Database};
pub use tallybook_core::{Key, Record, Schema, StorageError};
