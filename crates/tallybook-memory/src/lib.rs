use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
};

use tallybook_core::{
    IndexQuery, IndexValue, Key, Record, Schema, SchemaStatus, StorageBackend, StorageError, StoreDef,
    TransactionGate, TransactionId,
};

/// Smallest possible key; used as the lower half of `(value, key)` range
/// starts so a scan begins at the first entry for `value`.
const MIN_KEY: Key = Key::Int(i64::MIN);

#[derive(Clone)]
struct Table {
    def: StoreDef,
    records: BTreeMap<Key, Record>,
    indexes: HashMap<String, BTreeSet<(IndexValue, Key)>>,
    next_auto: i64,
}

impl Table {
    fn new(def: StoreDef) -> Self {
        let indexes = def
            .indexes
            .iter()
            .map(|i| (i.name.clone(), BTreeSet::new()))
            .collect();
        Self {
            def,
            records: BTreeMap::new(),
            indexes,
            next_auto: 1,
        }
    }

    /// Builds a table from scratch, enforcing every key and unique index.
    fn rebuild(def: StoreDef, records: impl IntoIterator<Item = Record>) -> Result<Self, StorageError> {
        let mut table = Table::new(def);
        for record in records {
            table.insert(record)?;
        }
        Ok(table)
    }

    fn check_unique(&self, record: &Record, own_key: &Key) -> Result<(), StorageError> {
        for (index, value) in self.def.index_entries(record) {
            if !index.unique {
                continue;
            }
            let Some(entries) = self.indexes.get(&index.name) else {
                continue;
            };
            let taken = entries
                .range((value.clone(), MIN_KEY)..)
                .take_while(|(v, _)| *v == value)
                .any(|(_, k)| k != own_key);
            if taken {
                return Err(StorageError::DuplicateKey {
                    store: self.def.name.clone(),
                    index: Some(index.name.clone()),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn index_add(&mut self, key: &Key, record: &Record) {
        for (index, value) in self.def.index_entries(record) {
            if let Some(entries) = self.indexes.get_mut(&index.name) {
                entries.insert((value, key.clone()));
            }
        }
    }

    fn index_remove(&mut self, key: &Key, record: &Record) {
        for (index, value) in self.def.index_entries(record) {
            if let Some(entries) = self.indexes.get_mut(&index.name) {
                entries.remove(&(value, key.clone()));
            }
        }
    }

    fn store(&mut self, key: Key, record: Record) {
        if let Key::Int(i) = key {
            if i >= self.next_auto {
                self.next_auto = i.saturating_add(1);
            }
        }
        self.index_add(&key, &record);
        self.records.insert(key, record);
    }

    fn insert(&mut self, record: Record) -> Result<Key, StorageError> {
        let next = self.next_auto;
        let (key, record) = self.def.prepare(record, || next)?;
        if self.records.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                store: self.def.name.clone(),
                index: None,
                value: key.to_string(),
            });
        }
        self.check_unique(&record, &key)?;
        self.store(key.clone(), record);
        Ok(key)
    }

    fn put(&mut self, record: Record) -> Result<Key, StorageError> {
        let next = self.next_auto;
        let (key, record) = self.def.prepare(record, || next)?;
        self.check_unique(&record, &key)?;
        if let Some(old) = self.records.remove(&key) {
            self.index_remove(&key, &old);
        }
        self.store(key.clone(), record);
        Ok(key)
    }

    fn delete(&mut self, key: &Key) -> bool {
        match self.records.remove(key) {
            Some(old) => {
                self.index_remove(key, &old);
                true
            }
            None => false,
        }
    }

    fn scan(&self, query: Option<&IndexQuery>) -> Result<Vec<&Record>, StorageError> {
        let Some(query) = query else {
            return Ok(self.records.values().collect());
        };
        if query.range.as_ref().map(|r| r.is_empty()).unwrap_or(false) {
            return Ok(Vec::new());
        }

        let Some(index) = &query.index else {
            return Ok(self
                .records
                .iter()
                .filter(|(k, _)| query.matches(&k.as_index_value()))
                .map(|(_, r)| r)
                .collect());
        };

        self.def.require_index(index)?;
        let entries = match self.indexes.get(index) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };
        let start = match query.range.as_ref().map(|r| &r.lower) {
            Some(Bound::Included(v)) | Some(Bound::Excluded(v)) => Bound::Included((v.clone(), MIN_KEY)),
            _ => Bound::Unbounded,
        };
        Ok(entries
            .range((start, Bound::Unbounded))
            .take_while(|(v, _)| query.range.as_ref().map(|r| !r.exceeds_upper(v)).unwrap_or(true))
            .filter(|(v, _)| query.matches(v))
            .filter_map(|(_, k)| self.records.get(k))
            .collect())
    }
}

#[derive(Clone, Default)]
struct State {
    version: u32,
    tables: BTreeMap<String, Table>,
}

impl State {
    fn table(&self, store: &str) -> Result<&Table, StorageError> {
        self.tables
            .get(store)
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }

    fn table_mut(&mut self, store: &str) -> Result<&mut Table, StorageError> {
        self.tables
            .get_mut(store)
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }
}

/// Primary engine that keeps every store in process memory.
///
/// Records are ordered by primary key and each secondary index is an ordered
/// set of `(value, key)` pairs. A transaction snapshots the whole state and
/// restores it on rollback; writes from other threads wait on the gate until
/// it ends.
pub struct InMemoryStorage {
    state: RwLock<State>,
    tx_counter: AtomicU64,
    gate: TransactionGate,
    snapshot: Mutex<Option<State>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            tx_counter: AtomicU64::new(1),
            gate: TransactionGate::new(),
            snapshot: Mutex::new(None),
        }
    }

    /// Convenience constructor that applies `schema` up to `version`.
    pub fn with_schema(schema: &Schema, version: u32) -> Result<Self, StorageError> {
        let storage = Self::new();
        storage.ensure_schema(schema, version)?;
        Ok(storage)
    }
}

impl StorageBackend for InMemoryStorage {
    fn engine_name(&self) -> &'static str {
        "memory"
    }

    fn ensure_schema(&self, schema: &Schema, version: u32) -> Result<SchemaStatus, StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let existing: BTreeMap<String, StoreDef> = state
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), table.def.clone()))
            .collect();
        let Some(plan) = schema.plan(state.version, version, &existing)? else {
            return Ok(SchemaStatus::unchanged(state.version));
        };

        // Rebuild altered stores first so a failed back-fill leaves nothing applied.
        let mut altered = Vec::with_capacity(plan.alter.len());
        for (def, added) in &plan.alter {
            let old = state.table(&def.name)?;
            let mut table = Table::rebuild(def.clone(), old.records.values().cloned())?;
            table.next_auto = table.next_auto.max(old.next_auto);
            tracing::debug!(store = %def.name, indexes = added.len(), "Back-filled indexes");
            altered.push(table);
        }
        for table in altered {
            state.tables.insert(table.def.name.clone(), table);
        }
        for def in &plan.create {
            state.tables.insert(def.name.clone(), Table::new(def.clone()));
        }
        state.version = plan.to;

        let status = SchemaStatus::applied(&plan);
        tracing::info!(
            from = status.previous,
            to = status.current,
            created = status.created_stores.len(),
            "Schema upgraded"
        );
        Ok(status)
    }

    fn schema_version(&self) -> Result<u32, StorageError> {
        Ok(self.state.read()?.version)
    }

    fn store_names(&self) -> Vec<String> {
        match self.state.read() {
            Ok(state) => state.tables.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn store_def(&self, store: &str) -> Option<StoreDef> {
        self.state.read().ok()?.tables.get(store).map(|t| t.def.clone())
    }

    fn insert(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let key = state.table_mut(store)?.insert(record)?;
        tracing::debug!(store, %key, "Inserted record");
        Ok(key)
    }

    fn get(&self, store: &str, key: &Key) -> Result<Option<Record>, StorageError> {
        let state = self.state.read()?;
        Ok(state.table(store)?.records.get(key).cloned())
    }

    fn get_all(&self, store: &str, query: Option<&IndexQuery>) -> Result<Vec<Record>, StorageError> {
        let state = self.state.read()?;
        let records = state.table(store)?.scan(query)?;
        Ok(records.into_iter().cloned().collect())
    }

    fn update(&self, store: &str, key: &Key, record: Record) -> Result<(), StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let table = state.table_mut(store)?;
        if !table.records.contains_key(key) {
            return Err(StorageError::not_found(store, key));
        }
        let record = table.def.bind_key(record, key)?;
        table.put(record)?;
        tracing::debug!(store, %key, "Updated record");
        Ok(())
    }

    fn put(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let key = state.table_mut(store)?.put(record)?;
        tracing::debug!(store, %key, "Put record");
        Ok(key)
    }

    fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let removed = state.table_mut(store)?.delete(key);
        tracing::debug!(store, %key, removed, "Deleted record");
        Ok(())
    }

    fn query_by_index(&self, store: &str, index: &str, value: &IndexValue) -> Result<Vec<Record>, StorageError> {
        let query = IndexQuery::index(index).with_range(tallybook_core::KeyRange::only(value.clone()));
        self.get_all(store, Some(&query))
    }

    fn count(&self, store: &str, query: Option<&IndexQuery>) -> Result<usize, StorageError> {
        let state = self.state.read()?;
        let table = state.table(store)?;
        match query {
            None => Ok(table.records.len()),
            Some(q) => Ok(table.scan(Some(q))?.len()),
        }
    }

    fn clear(&self, store: &str) -> Result<(), StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let table = state.table_mut(store)?;
        let def = table.def.clone();
        let next_auto = table.next_auto;
        *table = Table::new(def);
        table.next_auto = next_auto;
        tracing::debug!(store, "Cleared store");
        Ok(())
    }

    fn replace_all(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut state = self.state.write()?;
        let table = state.table_mut(store)?;
        let count = records.len();
        let replacement = Table::rebuild(table.def.clone(), records)?;
        *table = replacement;
        tracing::debug!(store, count, "Replaced store contents");
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let turn = self.gate.begin(tx_id)?;
        let snapshot = match self.state.read() {
            Ok(state) => state.clone(),
            Err(e) => {
                turn.finish();
                return Err(e.into());
            }
        };
        *self.snapshot.lock()? = Some(snapshot);
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let turn = self.gate.end(tx_id)?;
        self.snapshot.lock()?.take();
        turn.finish();
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let turn = self.gate.end(tx_id)?;
        let snapshot = self.snapshot.lock()?.take();
        if let Some(snapshot) = snapshot {
            *self.state.write()? = snapshot;
        }
        turn.finish();
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }
}
