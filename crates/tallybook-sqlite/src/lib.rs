use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, RwLock,
    },
};

use rusqlite::{
    params, params_from_iter,
    types::Value as SqlValue,
    Connection, ErrorCode, OptionalExtension,
};

use tallybook_core::{
    IndexQuery, IndexValue, Key, KeyRange, Record, Schema, SchemaStatus, StorageBackend, StorageError, StoreDef,
    TransactionGate, TransactionId,
};

/// Durable engine keeping every store in one SQLite file.
///
/// Records are stored as JSON bodies keyed by `(store, key)`; the key column
/// is untyped so integer keys sort numerically ahead of text keys. Secondary
/// index entries live in their own table and are rewritten with the record.
/// An open transaction is a named savepoint on the shared connection, so
/// writes from other threads wait on the gate until it ends.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    defs: RwLock<BTreeMap<String, StoreDef>>,
    tx_counter: AtomicU64,
    gate: TransactionGate,
}

fn sql_err(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        match failure.code {
            ErrorCode::DiskFull
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::ReadOnly
            | ErrorCode::PermissionDenied => return StorageError::unavailable(e),
            _ => {}
        }
    }
    StorageError::Other(e.to_string())
}

fn key_sql(key: &Key) -> SqlValue {
    match key {
        Key::Int(i) => SqlValue::Integer(*i),
        Key::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn index_sql(value: &IndexValue) -> SqlValue {
    match value {
        IndexValue::Number(n) => SqlValue::Real(*n),
        IndexValue::Text(s) => SqlValue::Text(s.clone()),
    }
}

/// Appends the SQL conditions for `range` on `column`.
fn range_sql(column: &str, range: &KeyRange, sql: &mut String, args: &mut Vec<SqlValue>) {
    let mut push = |op: &str, value: &IndexValue| {
        args.push(index_sql(value));
        sql.push_str(&format!(" AND {} {} ?{}", column, op, args.len()));
    };
    match &range.lower {
        Bound::Included(v) => push(">=", v),
        Bound::Excluded(v) => push(">", v),
        Bound::Unbounded => {}
    }
    match &range.upper {
        Bound::Included(v) => push("<=", v),
        Bound::Excluded(v) => push("<", v),
        Bound::Unbounded => {}
    }
}

fn parse_body(body: String) -> Result<Record, StorageError> {
    Ok(serde_json::from_str(&body)?)
}

fn next_auto(conn: &Connection, store: &str) -> Result<i64, StorageError> {
    conn.query_row("SELECT next_auto FROM stores WHERE name = ?1", params![store], |r| r.get(0))
        .map_err(sql_err)
}

fn record_exists(conn: &Connection, store: &str, key: &Key) -> Result<bool, StorageError> {
    conn.query_row(
        "SELECT 1 FROM records WHERE store = ?1 AND key = ?2",
        params![store, key_sql(key)],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(sql_err)
}

fn check_unique(conn: &Connection, def: &StoreDef, record: &Record, own_key: &Key) -> Result<(), StorageError> {
    for (index, value) in def.index_entries(record) {
        if !index.unique {
            continue;
        }
        let taken = conn
            .query_row(
                "SELECT 1 FROM index_entries
                 WHERE store = ?1 AND index_name = ?2 AND value = ?3 AND key != ?4
                 LIMIT 1",
                params![def.name, index.name, index_sql(&value), key_sql(own_key)],
                |_| Ok(()),
            )
            .optional()
            .map_err(sql_err)?
            .is_some();
        if taken {
            return Err(StorageError::DuplicateKey {
                store: def.name.clone(),
                index: Some(index.name.clone()),
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Writes (or overwrites) one record and its index entries.
fn write_record(conn: &Connection, def: &StoreDef, key: &Key, record: &Record) -> Result<(), StorageError> {
    let body = serde_json::to_string(record)?;
    conn.execute(
        "INSERT OR REPLACE INTO records (store, key, body) VALUES (?1, ?2, ?3)",
        params![def.name, key_sql(key), body],
    )
    .map_err(sql_err)?;
    conn.execute(
        "DELETE FROM index_entries WHERE store = ?1 AND key = ?2",
        params![def.name, key_sql(key)],
    )
    .map_err(sql_err)?;
    for (index, value) in def.index_entries(record) {
        conn.execute(
            "INSERT OR IGNORE INTO index_entries (store, index_name, value, key) VALUES (?1, ?2, ?3, ?4)",
            params![def.name, index.name, index_sql(&value), key_sql(key)],
        )
        .map_err(sql_err)?;
    }
    if let Key::Int(i) = key {
        conn.execute(
            "UPDATE stores SET next_auto = MAX(next_auto, ?2 + 1) WHERE name = ?1",
            params![def.name, i],
        )
        .map_err(sql_err)?;
    }
    Ok(())
}

fn insert_record(conn: &Connection, def: &StoreDef, record: Record) -> Result<Key, StorageError> {
    let next = next_auto(conn, &def.name)?;
    let (key, record) = def.prepare(record, || next)?;
    if record_exists(conn, &def.name, &key)? {
        return Err(StorageError::DuplicateKey {
            store: def.name.clone(),
            index: None,
            value: key.to_string(),
        });
    }
    check_unique(conn, def, &record, &key)?;
    write_record(conn, def, &key, &record)?;
    Ok(key)
}

fn put_record(conn: &Connection, def: &StoreDef, record: Record) -> Result<Key, StorageError> {
    let next = next_auto(conn, &def.name)?;
    let (key, record) = def.prepare(record, || next)?;
    check_unique(conn, def, &record, &key)?;
    write_record(conn, def, &key, &record)?;
    Ok(key)
}

fn load_defs(conn: &Connection) -> Result<BTreeMap<String, StoreDef>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT name, definition FROM stores ORDER BY name")
        .map_err(sql_err)?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .map_err(sql_err)?;
    let mut defs = BTreeMap::new();
    for row in rows {
        let (name, definition) = row.map_err(sql_err)?;
        defs.insert(name, serde_json::from_str(&definition)?);
    }
    Ok(defs)
}

impl SqliteStorage {
    /// Opens (creating if needed) the database at `path`; `:memory:` gives a
    /// private in-memory database.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(sql_err)?;
        Self::init_tables(&conn)?;
        let defs = load_defs(&conn)?;
        tracing::debug!(path, stores = defs.len(), "SQLite storage opened");

        Ok(Self {
            conn: Mutex::new(conn),
            defs: RwLock::new(defs),
            tx_counter: AtomicU64::new(1),
            gate: TransactionGate::new(),
        })
    }

    fn init_tables(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_meta (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO schema_meta (id, version) VALUES (1, 0);

            CREATE TABLE IF NOT EXISTS stores (
                name TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                next_auto INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS records (
                store TEXT NOT NULL,
                key NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (store, key)
            );

            CREATE TABLE IF NOT EXISTS index_entries (
                store TEXT NOT NULL,
                index_name TEXT NOT NULL,
                value NOT NULL,
                key NOT NULL,
                PRIMARY KEY (store, index_name, value, key)
            );

            CREATE INDEX IF NOT EXISTS idx_entries_key
                ON index_entries(store, key);
            ",
        )
        .map_err(sql_err)
    }

    fn def(&self, store: &str) -> Result<StoreDef, StorageError> {
        self.defs
            .read()?
            .get(store)
            .cloned()
            .ok_or_else(|| StorageError::UnknownStore(store.to_string()))
    }

    fn reload_defs(&self, conn: &Connection) -> Result<(), StorageError> {
        *self.defs.write()? = load_defs(conn)?;
        Ok(())
    }

    fn select(&self, store: &str, query: Option<&IndexQuery>, count_only: bool) -> Result<(String, Vec<SqlValue>), StorageError> {
        let def = self.def(store)?;
        let mut args = vec![SqlValue::Text(def.name.clone())];
        let sql = match query.and_then(|q| q.index.as_deref()) {
            Some(index) => {
                def.require_index(index)?;
                args.push(SqlValue::Text(index.to_string()));
                let mut sql = if count_only {
                    "SELECT COUNT(*) FROM index_entries e".to_string()
                } else {
                    "SELECT r.body FROM index_entries e
                     JOIN records r ON r.store = e.store AND r.key = e.key"
                        .to_string()
                };
                sql.push_str(" WHERE e.store = ?1 AND e.index_name = ?2");
                if let Some(range) = query.and_then(|q| q.range.as_ref()) {
                    range_sql("e.value", range, &mut sql, &mut args);
                }
                if !count_only {
                    sql.push_str(" ORDER BY e.value, e.key");
                }
                sql
            }
            None => {
                let mut sql = if count_only {
                    "SELECT COUNT(*) FROM records WHERE store = ?1".to_string()
                } else {
                    "SELECT body FROM records WHERE store = ?1".to_string()
                };
                if let Some(range) = query.and_then(|q| q.range.as_ref()) {
                    range_sql("key", range, &mut sql, &mut args);
                }
                if !count_only {
                    sql.push_str(" ORDER BY key");
                }
                sql
            }
        };
        Ok((sql, args))
    }
}

impl StorageBackend for SqliteStorage {
    fn engine_name(&self) -> &'static str {
        "sqlite"
    }

    fn ensure_schema(&self, schema: &Schema, version: u32) -> Result<SchemaStatus, StorageError> {
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        let current: u32 = sp
            .query_row("SELECT version FROM schema_meta WHERE id = 1", [], |r| r.get(0))
            .map_err(sql_err)?;
        let existing = load_defs(&sp)?;
        let Some(plan) = schema.plan(current, version, &existing)? else {
            return Ok(SchemaStatus::unchanged(current));
        };

        for def in &plan.create {
            sp.execute(
                "INSERT INTO stores (name, definition) VALUES (?1, ?2)",
                params![def.name, serde_json::to_string(def)?],
            )
            .map_err(sql_err)?;
        }
        for (def, added) in &plan.alter {
            sp.execute(
                "UPDATE stores SET definition = ?2 WHERE name = ?1",
                params![def.name, serde_json::to_string(def)?],
            )
            .map_err(sql_err)?;
            if added.is_empty() {
                continue;
            }
            let mut only_added = def.clone();
            only_added.indexes = added.clone();
            let records = {
                let mut stmt = sp
                    .prepare("SELECT body FROM records WHERE store = ?1 ORDER BY key")
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![def.name], |r| r.get::<_, String>(0))
                    .map_err(sql_err)?;
                rows.map(|row| row.map_err(sql_err).and_then(parse_body))
                    .collect::<Result<Vec<_>, _>>()?
            };
            for record in &records {
                let key = def.require_key(record)?;
                check_unique(&sp, &only_added, record, &key)?;
                for (index, value) in only_added.index_entries(record) {
                    sp.execute(
                        "INSERT OR IGNORE INTO index_entries (store, index_name, value, key)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![def.name, index.name, index_sql(&value), key_sql(&key)],
                    )
                    .map_err(sql_err)?;
                }
            }
            tracing::debug!(store = %def.name, records = records.len(), "Back-filled indexes");
        }
        sp.execute("UPDATE schema_meta SET version = ?1 WHERE id = 1", params![plan.to])
            .map_err(sql_err)?;
        sp.commit().map_err(sql_err)?;
        self.reload_defs(&conn)?;

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
        let conn = self.conn.lock()?;
        conn.query_row("SELECT version FROM schema_meta WHERE id = 1", [], |r| r.get(0))
            .map_err(sql_err)
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
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        let key = insert_record(&sp, &def, record)?;
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, %key, "Inserted record");
        Ok(key)
    }

    fn get(&self, store: &str, key: &Key) -> Result<Option<Record>, StorageError> {
        self.def(store)?;
        let conn = self.conn.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE store = ?1 AND key = ?2",
                params![store, key_sql(key)],
                |r| r.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        body.map(parse_body).transpose()
    }

    fn get_all(&self, store: &str, query: Option<&IndexQuery>) -> Result<Vec<Record>, StorageError> {
        let (sql, args) = self.select(store, query, false)?;
        if query.and_then(|q| q.range.as_ref()).map(|r| r.is_empty()).unwrap_or(false) {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))
            .map_err(sql_err)?;
        rows.map(|row| row.map_err(sql_err).and_then(parse_body))
            .collect()
    }

    fn update(&self, store: &str, key: &Key, record: Record) -> Result<(), StorageError> {
        let def = self.def(store)?;
        let record = def.bind_key(record, key)?;
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        if !record_exists(&sp, store, key)? {
            return Err(StorageError::not_found(store, key));
        }
        put_record(&sp, &def, record)?;
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, %key, "Updated record");
        Ok(())
    }

    fn put(&self, store: &str, record: Record) -> Result<Key, StorageError> {
        let def = self.def(store)?;
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        let key = put_record(&sp, &def, record)?;
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, %key, "Put record");
        Ok(key)
    }

    fn delete(&self, store: &str, key: &Key) -> Result<(), StorageError> {
        self.def(store)?;
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        let removed = sp
            .execute(
                "DELETE FROM records WHERE store = ?1 AND key = ?2",
                params![store, key_sql(key)],
            )
            .map_err(sql_err)?;
        sp.execute(
            "DELETE FROM index_entries WHERE store = ?1 AND key = ?2",
            params![store, key_sql(key)],
        )
        .map_err(sql_err)?;
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, %key, removed, "Deleted record");
        Ok(())
    }

    fn query_by_index(&self, store: &str, index: &str, value: &IndexValue) -> Result<Vec<Record>, StorageError> {
        let query = IndexQuery::index(index).with_range(KeyRange::only(value.clone()));
        self.get_all(store, Some(&query))
    }

    fn count(&self, store: &str, query: Option<&IndexQuery>) -> Result<usize, StorageError> {
        let (sql, args) = self.select(store, query, true)?;
        if query.and_then(|q| q.range.as_ref()).map(|r| r.is_empty()).unwrap_or(false) {
            return Ok(0);
        }
        let conn = self.conn.lock()?;
        let count: i64 = conn
            .query_row(&sql, params_from_iter(args.iter()), |r| r.get(0))
            .map_err(sql_err)?;
        Ok(count as usize)
    }

    fn clear(&self, store: &str) -> Result<(), StorageError> {
        self.def(store)?;
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        sp.execute("DELETE FROM records WHERE store = ?1", params![store])
            .map_err(sql_err)?;
        sp.execute("DELETE FROM index_entries WHERE store = ?1", params![store])
            .map_err(sql_err)?;
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, "Cleared store");
        Ok(())
    }

    fn replace_all(&self, store: &str, records: Vec<Record>) -> Result<(), StorageError> {
        let def = self.def(store)?;
        let count = records.len();
        let _turn = self.gate.write_turn()?;
        let mut conn = self.conn.lock()?;
        let sp = conn.savepoint().map_err(sql_err)?;
        sp.execute("DELETE FROM records WHERE store = ?1", params![store])
            .map_err(sql_err)?;
        sp.execute("DELETE FROM index_entries WHERE store = ?1", params![store])
            .map_err(sql_err)?;
        sp.execute("UPDATE stores SET next_auto = 1 WHERE name = ?1", params![store])
            .map_err(sql_err)?;
        for record in records {
            insert_record(&sp, &def, record)?;
        }
        sp.commit().map_err(sql_err)?;
        tracing::debug!(store, count, "Replaced store contents");
        Ok(())
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        let turn = self.gate.begin(tx_id)?;
        let opened = self
            .conn
            .lock()
            .map_err(StorageError::from)
            .and_then(|conn| conn.execute_batch("SAVEPOINT tallybook_tx").map_err(sql_err));
        if let Err(e) = opened {
            turn.finish();
            return Err(e);
        }
        tracing::debug!(tx_id, "SQLite transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let turn = self.gate.end(tx_id)?;
        let conn = self.conn.lock()?;
        conn.execute_batch("RELEASE SAVEPOINT tallybook_tx").map_err(sql_err)?;
        turn.finish();
        tracing::debug!(tx_id, "SQLite transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let turn = self.gate.end(tx_id)?;
        let conn = self.conn.lock()?;
        conn.execute_batch("ROLLBACK TO SAVEPOINT tallybook_tx; RELEASE SAVEPOINT tallybook_tx")
            .map_err(sql_err)?;
        turn.finish();
        self.reload_defs(&conn)?;
        tracing::debug!(tx_id, "SQLite transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallybook_core::{FieldDef, SCHEMA_VERSION};

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn storage() -> SqliteStorage {
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.ensure_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        storage
    }

    #[test]
    fn test_sqlite_basic_operations() {
        let storage = storage();
        let invoice = record(serde_json::json!({
            "id": "i1", "invoiceNumber": "INV-001", "customerId": "c1",
            "total": 1000, "paid": 0, "balance": 1000, "status": "unpaid"
        }));
        storage.insert("invoices", invoice.clone()).unwrap();
        assert_eq!(storage.get("invoices", &Key::from("i1")).unwrap(), Some(invoice));

        let err = storage
            .insert("invoices", record(serde_json::json!({"id": "i2", "invoiceNumber": "INV-001"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey { index: Some(_), .. }));
        assert_eq!(storage.count("invoices", None).unwrap(), 1);

        let unpaid = storage
            .query_by_index("invoices", "status", &IndexValue::from("unpaid"))
            .unwrap();
        assert_eq!(unpaid.len(), 1);

        storage.delete("invoices", &Key::from("i1")).unwrap();
        storage.delete("invoices", &Key::from("i1")).unwrap();
        assert!(storage
            .query_by_index("invoices", "status", &IndexValue::from("unpaid"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_sqlite_key_ordering_and_auto_increment() {
        let storage = storage();
        for name in ["a", "b", "c"] {
            storage
                .insert("users", record(serde_json::json!({"username": name})))
                .unwrap();
        }
        storage
            .insert("users", record(serde_json::json!({"id": 10, "username": "z"})))
            .unwrap();
        let key = storage
            .insert("users", record(serde_json::json!({"username": "next"})))
            .unwrap();
        assert_eq!(key, Key::Int(11));

        let ids: Vec<i64> = storage
            .get_all("users", None)
            .unwrap()
            .iter()
            .map(|r| r["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 10, 11]);

        let range = IndexQuery::primary(KeyRange::bound(2_i64, 10_i64, false, true));
        assert_eq!(storage.count("users", Some(&range)).unwrap(), 2);
    }

    #[test]
    fn test_sqlite_update_strict() {
        let storage = storage();
        let err = storage
            .update("customers", &Key::from("c1"), record(serde_json::json!({"name": "Acme"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        storage.put("customers", record(serde_json::json!({"id": "c1", "name": "Acme"}))).unwrap();
        storage
            .update("customers", &Key::from("c1"), record(serde_json::json!({"name": "Acme Ltd"})))
            .unwrap();
        let found = storage.get("customers", &Key::from("c1")).unwrap().unwrap();
        assert_eq!(found["name"], "Acme Ltd");
        assert_eq!(found["id"], "c1");
    }

    #[test]
    fn test_sqlite_replace_all_rolls_back_on_failure() {
        let storage = storage();
        storage.insert("products", record(serde_json::json!({"id": "p1", "name": "Pen"}))).unwrap();
        let err = storage
            .replace_all(
                "products",
                vec![
                    record(serde_json::json!({"id": "p2", "name": "Ink"})),
                    record(serde_json::json!({"id": "p3", "price": "free"})),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
        let names: Vec<String> = storage
            .get_all("products", None)
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Pen"]);
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = storage();
        let tx_id = storage.begin_transaction().unwrap();
        storage.insert("customers", record(serde_json::json!({"id": "c1", "name": "Acme"}))).unwrap();
        storage.rollback_transaction(tx_id).unwrap();
        assert!(storage.get("customers", &Key::from("c1")).unwrap().is_none());

        let tx_id = storage.begin_transaction().unwrap();
        storage.insert("customers", record(serde_json::json!({"id": "c2", "name": "Beta"}))).unwrap();
        storage.commit_transaction(tx_id).unwrap();
        assert!(storage.get("customers", &Key::from("c2")).unwrap().is_some());
    }

    #[test]
    fn test_sqlite_rollback_keeps_other_thread_write() {
        let storage = std::sync::Arc::new(storage());
        let tx_id = storage.begin_transaction().unwrap();
        storage.insert("customers", record(serde_json::json!({"id": "c1", "name": "Acme"}))).unwrap();

        let writer = {
            let storage = storage.clone();
            std::thread::spawn(move || {
                storage.insert("customers", record(serde_json::json!({"id": "c2", "name": "Beta"})))
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        storage.rollback_transaction(tx_id).unwrap();
        writer.join().unwrap().unwrap();

        assert!(storage.get("customers", &Key::from("c1")).unwrap().is_none());
        assert!(storage.get("customers", &Key::from("c2")).unwrap().is_some());
        assert!(matches!(
            storage.commit_transaction(tx_id),
            Err(StorageError::NoActiveTransaction)
        ));
    }

    #[test]
    fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("books.db");
        let path = path.to_str().unwrap();
        {
            let storage = SqliteStorage::new(path).unwrap();
            storage.ensure_schema(&Schema::accounting(), 1).unwrap();
            storage.insert("customers", record(serde_json::json!({"id": "c1", "name": "Acme"}))).unwrap();
        }
        let storage = SqliteStorage::new(path).unwrap();
        assert_eq!(storage.schema_version().unwrap(), 1);
        assert!(storage.store_def("suppliers").is_none());
        let status = storage.ensure_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        assert!(status.created_stores.contains(&"suppliers".to_string()));
        assert!(storage.get("customers", &Key::from("c1")).unwrap().is_some());
    }

    #[test]
    fn test_sqlite_backfills_added_index() {
        let v1 = Schema::new(vec![StoreDef::new("notes").field(FieldDef::text("tag"))]);
        let v2 = Schema::new(vec![
            StoreDef::new("notes").field(FieldDef::text("tag")).index("tag"),
            StoreDef::new("tags").since(2),
        ]);
        let storage = SqliteStorage::new(":memory:").unwrap();
        storage.ensure_schema(&v1, 1).unwrap();
        storage.insert("notes", record(serde_json::json!({"id": "n1", "tag": "red"}))).unwrap();
        storage.insert("notes", record(serde_json::json!({"id": "n2", "tag": "blue"}))).unwrap();

        let status = storage.ensure_schema(&v2, 2).unwrap();
        assert_eq!(status.altered_stores, vec!["notes".to_string()]);
        let red = storage.query_by_index("notes", "tag", &IndexValue::from("red")).unwrap();
        assert_eq!(red.len(), 1);
        assert_eq!(red[0]["id"], "n1");
    }

    #[test]
    fn test_sqlite_unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("books.db");
        let err = SqliteStorage::new(path.to_str().unwrap()).err().unwrap();
        assert!(err.is_unavailable(), "unexpected error: {}", err);
    }
}
