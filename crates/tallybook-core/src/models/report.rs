use serde::Serialize;

use super::Key;

/// One record a bulk operation could not apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkFailure {
    /// Position of the record (or key) in the caller's input.
    pub position: usize,
    pub key: Option<Key>,
    pub error: String,
}

/// Outcome of a bulk add/delete. Failures are collected, never swallowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub succeeded: Vec<Key>,
    pub failed: Vec<BulkFailure>,
}

impl BulkReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Result of restoring a single store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StoreOutcome {
    Restored { store: String, records: usize },
    Failed { store: String, error: String },
}

impl StoreOutcome {
    pub fn store(&self) -> &str {
        match self {
            StoreOutcome::Restored { store, .. } | StoreOutcome::Failed { store, .. } => store,
        }
    }

    pub fn is_restored(&self) -> bool {
        matches!(self, StoreOutcome::Restored { .. })
    }
}
