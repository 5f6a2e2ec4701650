use std::sync::Arc;

use time::OffsetDateTime;

use crate::clock::{Clock, SystemClock};
use tallybook_core::{
    BulkFailure, BulkReport, IndexQuery, IndexValue, Key, Record, StorageBackend, StorageError, StoreDef,
};

/// How `bulk_add` treats a failing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BulkPolicy {
    /// Every record is attempted; failures are collected.
    #[default]
    BestEffort,
    /// Runs inside a transaction; the first failure rolls back the batch and
    /// every record is reported as failed.
    AllOrNothing,
}

/// Query façade over one storage engine. Holds no state of its own, so
/// clones share the same engine and clock.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
        }
    }

    /// Timestamps written by the accounting operations come from `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn engine_name(&self) -> &'static str {
        self.backend.engine_name()
    }

    pub fn schema_version(&self) -> Result<u32, StorageError> {
        self.backend.schema_version()
    }

    pub fn store_names(&self) -> Vec<String> {
        self.backend.store_names()
    }

    pub fn store_def(&self, store: &str) -> Result<StoreDef, StorageError> {
        self.backend
            .store_def(store)
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }

    pub fn add(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        self.backend.insert(store, record)
    }

    pub fn get(&self, store: &str, key: &Key) -> Result<Option<Record>, StorageError> {
        self.backend.get(store, key)
    }

    /// Like `get` but absence is a `NotFound` error.
    pub fn require(&self, store: &str, key: &Key) -> Result<Record, StorageError> {
        self.backend
            .get(store, key)?
            .ok_or_else(|| StorageError::not_found(store, key))
    }

    pub fn get_all(&self, store: &str) -> Result<Vec<Record>, StorageError> {
        self.backend.get_all(store, None)
    }

    pub fn get_all_by(&self, store: &str, query: &IndexQuery) -> Result<Vec<Record>, StorageError> {
        self.backend.get_all(store, Some(query))
    }

    pub fn query_by_index(
        &self,
        store: &str,
        index: &str,
        value: impl Into<IndexValue>,
    ) -> Result<Vec<Record>, StorageError> {
        self.backend.query_by_index(store, index, &value.into())
    }

    pub fn update(&self, store: &str, key: &Key, record: Record) -> Result<(), StorageError> {
        self.backend.update(store, key, record)
    }

    pub fn put(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        self.backend.put(store, record)
    }

    pub fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError> {
        self.backend.delete(store, key)
    }

    pub fn count(&self, store: &str) -> Result<usize, StorageError> {
        self.backend.count(store, None)
    }

    pub fn count_by(&self, store: &str, query: &IndexQuery) -> Result<usize, StorageError> {
        self.backend.count(store, Some(query))
    }

    pub fn clear(&self, store: &str) -> Result<(), StorageError> {
        self.backend.clear(store)
    }

    pub fn bulk_add(&self, store: &str, records: Vec<Record>, policy: BulkPolicy) -> Result<BulkReport, StorageError> {
        let def = self.store_def(store)?;
        match policy {
            BulkPolicy::BestEffort => {
                let mut report = BulkReport::default();
                for (position, record) in records.into_iter().enumerate() {
                    let key = def.key_of(&record).ok().flatten();
                    match self.backend.insert(store, record) {
                        Ok(key) => report.succeeded.push(key),
                        Err(e) => report.failed.push(BulkFailure {
                            position,
                            key,
                            error: e.to_string(),
                        }),
                    }
                }
                if !report.is_complete() {
                    tracing::warn!(store, failed = report.failed.len(), "Bulk add partially applied");
                }
                Ok(report)
            }
            BulkPolicy::AllOrNothing => {
                let keys: Vec<Option<Key>> = records.iter().map(|r| def.key_of(r).ok().flatten()).collect();
                let tx_id = self.backend.begin_transaction()?;
                let mut succeeded = Vec::with_capacity(records.len());
                for (position, record) in records.into_iter().enumerate() {
                    match self.backend.insert(store, record) {
                        Ok(key) => succeeded.push(key),
                        Err(e) => {
                            self.backend.rollback_transaction(tx_id)?;
                            tracing::warn!(store, position, error = %e, "Bulk add rolled back");
                            let failed = keys
                                .into_iter()
                                .enumerate()
                                .map(|(i, key)| BulkFailure {
                                    position: i,
                                    key,
                                    error: if i == position {
                                        e.to_string()
                                    } else {
                                        format!("rolled back: record {} failed", position)
                                    },
                                })
                                .collect();
                            return Ok(BulkReport {
                                succeeded: Vec::new(),
                                failed,
                            });
                        }
                    }
                }
                self.backend.commit_transaction(tx_id)?;
                Ok(BulkReport {
                    succeeded,
                    failed: Vec::new(),
                })
            }
        }
    }

    /// Deletes every key. Absent keys count as deleted.
    pub fn bulk_delete(&self, store: &str, keys: &[Key]) -> Result<BulkReport, StorageError> {
        let mut report = BulkReport::default();
        for (position, key) in keys.iter().enumerate() {
            match self.backend.delete(store, key) {
                Ok(()) => report.succeeded.push(key.clone()),
                Err(e) => report.failed.push(BulkFailure {
                    position,
                    key: Some(key.clone()),
                    error: e.to_string(),
                }),
            }
        }
        Ok(report)
    }

    /// Folds every record of `store` that satisfies `predicate`.
    pub fn aggregate<T>(
        &self,
        store: &str,
        predicate: impl Fn(&Record) -> bool,
        init: T,
        reducer: impl Fn(T, &Record) -> T,
    ) -> Result<T, StorageError> {
        Ok(self
            .backend
            .get_all(store, None)?
            .iter()
            .filter(|r| predicate(*r))
            .fold(init, reducer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tallybook_core::{KeyRange, Schema, SCHEMA_VERSION};
    use tallybook_kv::{FallbackStorage, MemoryMedium};
    use tallybook_memory::InMemoryStorage;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn db() -> Database {
        let storage = InMemoryStorage::with_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        Database::new(Arc::new(storage))
    }

    #[test]
    fn test_bulk_add_best_effort_reports_failures() {
        let db = db();
        db.add("customers", record(json!({"id": "c2", "name": "Beta"}))).unwrap();
        let report = db
            .bulk_add(
                "customers",
                vec![
                    record(json!({"id": "c1", "name": "Acme"})),
                    record(json!({"id": "c2", "name": "Dup"})),
                    record(json!({"name": "No key"})),
                    record(json!({"id": "c3", "name": "Gamma"})),
                ],
                BulkPolicy::BestEffort,
            )
            .unwrap();
        assert_eq!(report.succeeded, vec![Key::from("c1"), Key::from("c3")]);
        let positions: Vec<usize> = report.failed.iter().map(|f| f.position).collect();
        assert_eq!(positions, vec![1, 2]);
        assert_eq!(report.failed[0].key, Some(Key::from("c2")));
        assert_eq!(report.failed[1].key, None);
        assert_eq!(db.count("customers").unwrap(), 3);
    }

    #[test]
    fn test_bulk_add_all_or_nothing_rolls_back() {
        let db = db();
        let report = db
            .bulk_add(
                "products",
                vec![
                    record(json!({"id": "p1", "name": "Pen"})),
                    record(json!({"id": "p1", "name": "Pen again"})),
                ],
                BulkPolicy::AllOrNothing,
            )
            .unwrap();
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed[0].error.starts_with("rolled back"));
        assert_eq!(db.count("products").unwrap(), 0);
    }

    #[test]
    fn test_all_or_nothing_needs_transactions() {
        let storage = FallbackStorage::new(MemoryMedium::new()).unwrap();
        storage.ensure_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        let db = Database::new(Arc::new(storage));
        let err = db
            .bulk_add("products", vec![record(json!({"id": "p1"}))], BulkPolicy::AllOrNothing)
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsupported(_)));
        assert_eq!(db.count("products").unwrap(), 0);
    }

    #[test]
    fn test_bulk_delete_tolerates_absent_keys() {
        let db = db();
        db.add("products", record(json!({"id": "p1"}))).unwrap();
        let report = db
            .bulk_delete("products", &[Key::from("p1"), Key::from("missing")])
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.attempted(), 2);
        assert_eq!(db.count("products").unwrap(), 0);
    }

    #[test]
    fn test_aggregate_and_index_helpers() {
        let db = db();
        for (id, category, amount) in [("e1", "rent", 500), ("e2", "travel", 120), ("e3", "rent", 500)] {
            db.add("expenses", record(json!({"id": id, "category": category, "amount": amount})))
                .unwrap();
        }
        let rent = db
            .aggregate(
                "expenses",
                |r| r["category"] == "rent",
                0_i64,
                |sum, r| sum + r["amount"].as_i64().unwrap_or(0),
            )
            .unwrap();
        assert_eq!(rent, 1000);
        assert_eq!(db.query_by_index("expenses", "category", "travel").unwrap().len(), 1);
        let big = IndexQuery::index("amount").with_range(KeyRange::lower_bound(200_i64, false));
        assert_eq!(db.count_by("expenses", &big).unwrap(), 2);
        assert!(matches!(
            db.require("expenses", &Key::from("e9")),
            Err(StorageError::NotFound { .. })
        ));
    }
}
