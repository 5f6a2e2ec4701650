use std::{collections::BTreeMap, sync::RwLock};

use serde::{Deserialize, Serialize};

use tallybook_core::{
    IndexQuery, IndexValue, Key, KeyRange, Record, Schema, SchemaStatus, StorageBackend, StorageError, StoreDef,
    TransactionId,
};

use crate::medium::KvMedium;

const META_KEY: &str = "tallybook_meta";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    version: u32,
    stores: Vec<StoreDef>,
}

fn list_key(store: &str) -> String {
    format!("tallybook_store_{}", store)
}

/// Record store over a flat key-value medium.
///
/// Each operation loads the whole list for one store, changes it and writes
/// it back. Nothing serializes those cycles, so two writers on the same store
/// race and the last write wins.
pub struct FallbackStorage<M: KvMedium> {
    medium: M,
    defs: RwLock<BTreeMap<String, StoreDef>>,
}

impl<M: KvMedium> FallbackStorage<M> {
    pub fn new(medium: M) -> Result<Self, StorageError> {
        let meta = Self::read_meta(&medium)?;
        let defs = meta.stores.into_iter().map(|d| (d.name.clone(), d)).collect();
        Ok(Self {
            medium,
            defs: RwLock::new(defs),
        })
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    fn read_meta(medium: &M) -> Result<Meta, StorageError> {
        match medium.get_item(META_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Meta::default()),
        }
    }

    fn def(&self, store: &str) -> Result<StoreDef, StorageError> {
        self.defs
            .read()?
            .get(store)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }

    fn load(&self, store: &str) -> Result<Vec<Record>, StorageError> {
        match self.medium.get_item(&list_key(store))? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, store: &str, records: &[Record]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(records)?;
        self.medium.set_item(&list_key(store), &raw)
    }

    fn position(def: &StoreDef, records: &[Record], key: &Key) -> Result<Option<usize>, StorageError> {
        for (i, record) in records.iter().enumerate() {
            if def.key_of(record)?.as_ref() == Some(key) {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn next_auto(def: &StoreDef, records: &[Record]) -> i64 {
        records
            .iter()
            .filter_map(|r| match def.key_of(r) {
                Ok(Some(Key::Int(i))) => Some(i),
                _ => None,
            })
            .max()
            .map(|i| i.saturating_add(1))
            .unwrap_or(1)
    }

    /// Adds a record to an already loaded list.
    fn push(def: &StoreDef, records: &mut Vec<Record>, record: Record) -> Result<Key, StorageError> {
        let next = Self::next_auto(def, records);
        let (key, record) = def.prepare(record, || next)?;
        if Self::position(def, records, &key)?.is_some() {
            return Err(StorageError::DuplicateKey {
                store: def.name.clone(),
                index: None,
                value: key.to_string(),
            });
        }
        records.push(record);
        Ok(key)
    }

    fn select(def: &StoreDef, records: Vec<Record>, query: Option<&IndexQuery>) -> Result<Vec<Record>, StorageError> {
        let Some(query) = query else {
            return Ok(records);
        };
        let field = match &query.index {
            Some(index) => Some(def.require_index(index)?.field.clone()),
            None => None,
        };
        Ok(records
            .into_iter()
            .filter(|record| {
                let value = match &field {
                    Some(field) => record.get(field).and_then(IndexValue::from_value),
                    None => def.key_of(record).ok().flatten().map(|k| k.as_index_value()),
                };
                value.map(|v| query.matches(&v)).unwrap_or(false)
            })
            .collect())
    }
}

impl<M: KvMedium> StorageBackend for FallbackStorage<M> {
    fn engine_name(&self) -> &'static str {
        "fallback"
    }

    fn ensure_schema(&self, schema: &Schema, version: u32) -> Result<SchemaStatus, StorageError> {
        let meta = Self::read_meta(&self.medium)?;
        let existing: BTreeMap<String, StoreDef> =
            meta.stores.iter().map(|d| (d.name.clone(), d.clone())).collect();
        let Some(plan) = schema.plan(meta.version, version, &existing)? else {
            return Ok(SchemaStatus::unchanged(meta.version));
        };

        let mut defs = existing;
        for def in &plan.create {
            if self.medium.get_item(&list_key(&def.name))?.is_none() {
                self.save(&def.name, &[])?;
            }
            defs.insert(def.name.clone(), def.clone());
        }
        for (def, _) in &plan.alter {
            defs.insert(def.name.clone(), def.clone());
        }
        let meta = Meta {
            version: plan.to,
            stores: defs.values().cloned().collect(),
        };
        self.medium.set_item(META_KEY, &serde_json::to_string(&meta)?)?;
        *self.defs.write()? = defs;

        let status = SchemaStatus::applied(&plan);
        tracing::info!(from = status.previous, to = status.current, "Fallback schema upgraded");
        Ok(status)
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        Ok(Self::read_meta(&self.medium)?.version)
    }

    fn store_names(&self) -> Vec<String> {
        match self.defs.read() {
            Ok(defs) => defs.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn store_def(&self, store: &str) -> Option<StoreDef> {
        self.def(store).ok()
    }

    fn insert(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        let def = self.def(store)?;
        let mut records = self.load(store)?;
        let key = Self::push(&def, &mut records, record)?;
        self.save(store, &records)?;
        tracing::debug!(store, %key, "Inserted record (fallback)");
        Ok(key)
    }

    fn get(&self, store: &str, key: &Key) -> Result<Option<Record>, StorageError> {
        let def = self.def(store)?;
        let mut records = self.load(store)?;
        Ok(Self::position(&def, &records, key)?.map(|i| records.swap_remove(i)))
    }

    fn get_all(&self, store: &str, query: Option<&IndexQuery>) -> Result<Vec<Record>, StorageError> {
        let def = self.def(store)?;
        let records = self.load(store)?;
        Self::select(&def, records, query)
    }

    fn update(&self, store: &str, key: &Key, record: Record) -> Result<(), StorageError> {
        let def = self.def(store)?;
        let record = def.bind_key(record, key)?;
        def.validate(&record)?;
        let mut records = self.load(store)?;
        let i = Self::position(&def, &records, key)?.ok_or_else(|| StorageError::not_found(store, key))?;
        records[i] = record;
        self.save(store, &records)?;
        tracing::debug!(store, %key, "Updated record (fallback)");
        Ok(())
    }

    fn put(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        let def = self.def(store)?;
        let mut records = self.load(store)?;
        let next = Self::next_auto(&def, &records);
        let (key, record) = def.prepare(record, || next)?;
        match Self::position(&def, &records, &key)? {
            Some(i) => records[i] = record,
            None => records.push(record),
        }
        self.save(store, &records)?;
        Ok(key)
    }

    fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError> {
        let def = self.def(store)?;
        let mut records = self.load(store)?;
        if let Some(i) = Self::position(&def, &records, key)? {
            records.remove(i);
            self.save(store, &records)?;
        }
        Ok(())
    }

    fn query_by_index(&self, store: &str, index: &str, value: &IndexValue) -> Result<Vec<Record>, StorageError> {
        let query = IndexQuery::index(index).with_range(KeyRange::only(value.clone()));
        self.get_all(store, Some(&query))
    }

    fn count(&self, store: &str, query: Option<&IndexQuery>) -> Result<usize, StorageError> {
        Ok(self.get_all(store, query)?.len())
    }

    fn clear(&self, store: &str) -> Result<(), StorageError> {
        self.def(store)?;
        self.save(store, &[])
    }

    fn replace_all(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
        let def = self.def(store)?;
        let mut list = Vec::with_capacity(records.len());
        for record in records {
            Self::push(&def, &mut list, record)?;
        }
        self.save(store, &list)?;
        tracing::debug!(store, count = list.len(), "Replaced store contents (fallback)");
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        Err(StorageError::Unsupported("transactions in fallback mode".to_string()))
    }

    fn commit_transaction(&self, _tx_id: TransactionId) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("transactions in fallback mode".to_string()))
    }

    fn rollback_transaction(&self, _tx_id: TransactionId) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("transactions in fallback mode".to_string()))
    }
}
