//! Soft referential check. Fields declared with `references` are looked up
//! in their target store; values with no matching record are reported, never
//! repaired or rejected.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tallybook_core::{Key, StorageError};

use crate::query::Database;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanReference {
    pub store: String,
    pub key: Option<Key>,
    pub field: String,
    pub target_store: String,
    pub missing: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// References looked up, across all stores.
    pub checked: usize,
    pub orphans: Vec<OrphanReference>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty()
    }
}

pub fn check(db: &Database) -> Result<IntegrityReport, StorageError> {
    let stores = db.store_names();
    let mut targets: HashMap<String, HashSet<Key>> = HashMap::new();
    let mut report = IntegrityReport::default();

    for store in &stores {
        let def = db.store_def(store)?;
        let references: Vec<(String, String)> = def
            .references()
            .map(|(field, target)| (field.name.clone(), target.to_string()))
            .collect();
        if references.is_empty() {
            continue;
        }

        let records = db.get_all(store)?;
        for (field, target) in references {
            if !stores.contains(&target) {
                tracing::warn!(store = %store, field = %field, target = %target, "Reference to a store that does not exist");
                continue;
            }
            if !targets.contains_key(&target) {
                let target_def = db.store_def(&target)?;
                let keys = db
                    .get_all(&target)?
                    .iter()
                    .filter_map(|r| target_def.key_of(r).ok().flatten())
                    .collect();
                targets.insert(target.clone(), keys);
            }
            let known = &targets[&target];

            for record in &records {
                let value = match record.get(&field) {
                    None | Some(serde_json::Value::Null) => continue,
                    Some(value) => value,
                };
                report.checked += 1;
                let found = Key::from_value(value).map(|k| known.contains(&k)).unwrap_or(false);
                if !found {
                    report.orphans.push(OrphanReference {
                        store: store.clone(),
                        key: def.key_of(record).ok().flatten(),
                        field: field.clone(),
                        target_store: target.clone(),
                        missing: match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                    });
                }
            }
        }
    }

    tracing::debug!(checked = report.checked, orphans = report.orphans.len(), "Integrity check finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tallybook_core::{Record, Schema, SCHEMA_VERSION};
    use tallybook_memory::InMemoryStorage;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_reports_orphans_without_failing() {
        let storage = InMemoryStorage::with_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        let db = Database::new(Arc::new(storage));
        db.add("customers", record(json!({"id": "c1", "name": "Acme"}))).unwrap();
        db.add("invoices", record(json!({"id": "i1", "customerId": "c1"}))).unwrap();
        db.add("invoices", record(json!({"id": "i2", "customerId": "c9"}))).unwrap();
        db.add("invoices", record(json!({"id": "i3"}))).unwrap();
        db.add("inventory", record(json!({"id": "s1", "productId": 42}))).unwrap();

        let report = check(&db).unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.orphans.len(), 2);
        let invoice = report.orphans.iter().find(|o| o.store == "invoices").unwrap();
        assert_eq!(invoice.key, Some(Key::from("i2")));
        assert_eq!(invoice.field, "customerId");
        assert_eq!(invoice.target_store, "customers");
        assert_eq!(invoice.missing, "c9");
        let stock = report.orphans.iter().find(|o| o.store == "inventory").unwrap();
        assert_eq!(stock.missing, "42");
    }

    #[test]
    fn test_clean_database() {
        let storage = InMemoryStorage::with_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        let db = Database::new(Arc::new(storage));
        let report = check(&db).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, 0);
    }
}
