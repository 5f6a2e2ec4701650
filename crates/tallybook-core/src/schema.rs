//! Schema registry: the fixed set of stores, their key paths, secondary
//! indexes and declared field types, versioned so new stores can be added by
//! an upgrade pass without touching existing records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dates::{parse_date, parse_timestamp};
use crate::models::{IndexValue, Key, Record};
use crate::storage::StorageError;

/// Version of the default accounting schema.
pub const SCHEMA_VERSION: u32 = 3;

/// Stores that every backup document must carry.
pub const REQUIRED_BACKUP_STORES: [&str; 8] = [
    "users",
    "customers",
    "invoices",
    "expenses",
    "products",
    "suppliers",
    "projects",
    "settings",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Integer,
    Bool,
    /// `YYYY-MM-DD`
    Date,
    /// RFC 3339
    Timestamp,
    Enum,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values. Only meaningful when `field_type` is `Enum`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_options: Option<Vec<String>>,
    /// Store whose primary key this field points at. Soft reference, only
    /// checked by the integrity pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,
}

impl FieldDef {
    fn simple(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            required: false,
            enum_options: None,
            references: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::simple(name, FieldType::Text)
    }

    pub fn number(name: &str) -> Self {
        Self::simple(name, FieldType::Number)
    }

    pub fn integer(name: &str) -> Self {
        Self::simple(name, FieldType::Integer)
    }

    pub fn bool(name: &str) -> Self {
        Self::simple(name, FieldType::Bool)
    }

    pub fn date(name: &str) -> Self {
        Self::simple(name, FieldType::Date)
    }

    pub fn timestamp(name: &str) -> Self {
        Self::simple(name, FieldType::Timestamp)
    }

    pub fn json(name: &str) -> Self {
        Self::simple(name, FieldType::Json)
    }

    pub fn enumeration(name: &str, options: &[&str]) -> Self {
        Self {
            enum_options: Some(options.iter().map(|o| o.to_string()).collect()),
            ..Self::simple(name, FieldType::Enum)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn references(mut self, store: &str) -> Self {
        self.references = Some(store.to_string());
        self
    }

    /// Checks a present, non-null value against the declared type.
    fn check(&self, value: &Value) -> Result<(), String> {
        let ok = match self.field_type {
            FieldType::Text => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64() || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false),
            FieldType::Bool => value.is_boolean(),
            FieldType::Date => value.as_str().and_then(parse_date).is_some(),
            FieldType::Timestamp => value.as_str().and_then(parse_timestamp).is_some(),
            FieldType::Enum => match (value.as_str(), &self.enum_options) {
                (Some(s), Some(options)) => options.iter().any(|o| o == s),
                (Some(_), None) => true,
                (None, _) => false,
            },
            FieldType::Json => true,
        };
        if ok {
            Ok(())
        } else {
            Err(format!("field '{}' expected {:?}, got {}", self.name, self.field_type, value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub field: String,
    #[serde(default)]
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDef {
    pub name: String,
    pub key_path: String,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// First schema version that declares this store.
    pub since_version: u32,
    #[serde(default)]
    pub backup_required: bool,
}

impl StoreDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            key_path: "id".to_string(),
            auto_increment: false,
            indexes: Vec::new(),
            fields: Vec::new(),
            since_version: 1,
            backup_required: false,
        }
    }

    pub fn key_path(mut self, key_path: &str) -> Self {
        self.key_path = key_path.to_string();
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn index(mut self, field: &str) -> Self {
        self.indexes.push(IndexDef {
            name: field.to_string(),
            field: field.to_string(),
            unique: false,
        });
        self
    }

    pub fn unique_index(mut self, field: &str) -> Self {
        self.indexes.push(IndexDef {
            name: field.to_string(),
            field: field.to_string(),
            unique: true,
        });
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn since(mut self, version: u32) -> Self {
        self.since_version = version;
        self
    }

    pub fn backup_required(mut self) -> Self {
        self.backup_required = true;
        self
    }

    pub fn index_def(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn require_index(&self, name: &str) -> Result<&IndexDef, StorageError> {
        self.index_def(name).ok_or_else(|| StorageError::UnknownIndex {
            store: self.name.clone(),
            index: name.to_string(),
        })
    }

    fn invalid(&self, reason: impl Into<String>) -> StorageError {
        StorageError::InvalidRecord {
            store: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Primary key of a record. `Ok(None)` when the key field is absent or
    /// null, an error when it holds something that cannot be a key.
    pub fn key_of(&self, record: &Record) -> Result<Option<Key>, StorageError> {
        match record.get(&self.key_path) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => Key::from_value(v)
                .map(Some)
                .ok_or_else(|| self.invalid(format!("'{}' is not a valid key: {}", self.key_path, v))),
        }
    }

    /// Like `key_of` but absence is an error too.
    pub fn require_key(&self, record: &Record) -> Result<Key, StorageError> {
        self.key_of(record)?
            .ok_or_else(|| self.invalid(format!("missing primary key '{}'", self.key_path)))
    }

    pub fn validate(&self, record: &Record) -> Result<(), StorageError> {
        for field in &self.fields {
            match record.get(&field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(self.invalid(format!("missing required field '{}'", field.name)));
                    }
                }
                Some(value) => field.check(value).map_err(|reason| self.invalid(reason))?,
            }
        }
        Ok(())
    }

    /// Ties a record to the key it is being written under. A record that
    /// carries a different key is rejected.
    pub fn bind_key(&self, mut record: Record, key: &Key) -> Result<Record, StorageError> {
        match self.key_of(&record)? {
            Some(own) if &own != key => {
                return Err(self.invalid(format!("key '{}' does not match target key '{}'", own, key)));
            }
            Some(_) => {}
            None => {
                record.insert(self.key_path.clone(), key.to_value());
            }
        }
        Ok(record)
    }

    /// Resolves the primary key of a record about to be inserted, assigning
    /// one from `next_auto` for auto-increment stores, and validates it.
    pub fn prepare(&self, mut record: Record, next_auto: impl FnOnce() -> i64) -> Result<(Key, Record), StorageError> {
        let key = match self.key_of(&record)? {
            Some(key) => key,
            None if self.auto_increment => {
                let key = Key::Int(next_auto());
                record.insert(self.key_path.clone(), key.to_value());
                key
            }
            None => return Err(self.invalid(format!("missing primary key '{}'", self.key_path))),
        };
        self.validate(&record)?;
        Ok((key, record))
    }

    /// Index entries a record contributes. Records whose indexed field is
    /// absent or not a number/string are left out of that index.
    pub fn index_entries<'a>(&'a self, record: &Record) -> Vec<(&'a IndexDef, IndexValue)> {
        self.indexes
            .iter()
            .filter_map(|index| {
                record
                    .get(&index.field)
                    .and_then(IndexValue::from_value)
                    .map(|value| (index, value))
            })
            .collect()
    }

    /// Fields pointing at other stores.
    pub fn references(&self) -> impl Iterator<Item = (&FieldDef, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.references.as_deref().map(|target| (f, target)))
    }
}

/// Changes needed to bring a medium from one schema version to another.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradePlan {
    pub from: u32,
    pub to: u32,
    pub create: Vec<StoreDef>,
    /// Existing stores whose definition changed, with the indexes that must be
    /// back-filled from existing records.
    pub alter: Vec<(StoreDef, Vec<IndexDef>)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStatus {
    pub previous: u32,
    pub current: u32,
    pub created_stores: Vec<String>,
    pub altered_stores: Vec<String>,
}

impl SchemaStatus {
    pub fn unchanged(version: u32) -> Self {
        Self {
            previous: version,
            current: version,
            created_stores: Vec::new(),
            altered_stores: Vec::new(),
        }
    }

    pub fn applied(plan: &UpgradePlan) -> Self {
        Self {
            previous: plan.from,
            current: plan.to,
            created_stores: plan.create.iter().map(|s| s.name.clone()).collect(),
            altered_stores: plan.alter.iter().map(|(s, _)| s.name.clone()).collect(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub stores: Vec<StoreDef>,
}

impl Schema {
    pub fn new(stores: Vec<StoreDef>) -> Self {
        Self { stores }
    }

    pub fn latest_version(&self) -> u32 {
        self.stores.iter().map(|s| s.since_version).max().unwrap_or(0)
    }

    pub fn store(&self, name: &str) -> Option<&StoreDef> {
        self.stores.iter().find(|s| s.name == name)
    }

    pub fn stores_at(&self, version: u32) -> impl Iterator<Item = &StoreDef> {
        self.stores.iter().filter(move |s| s.since_version <= version)
    }

    pub fn required_for_backup(&self) -> Vec<String> {
        self.stores
            .iter()
            .filter(|s| s.backup_required)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Works out what an engine at `current` must do to reach `requested`.
    ///
    /// `None` when the medium is already at or above the requested version.
    /// Asking for a version this registry does not know, or opening a medium
    /// written by a newer registry, is a downgrade and is refused.
    pub fn plan(
        &self,
        current: u32,
        requested: u32,
        existing: &BTreeMap<String, StoreDef>,
    ) -> Result<Option<UpgradePlan>, StorageError> {
        let latest = self.latest_version();
        if requested > latest || current > latest {
            return Err(StorageError::UnsupportedSchemaVersion { current, requested });
        }
        if current >= requested {
            return Ok(None);
        }

        let mut plan = UpgradePlan {
            from: current,
            to: requested,
            create: Vec::new(),
            alter: Vec::new(),
        };
        for def in self.stores_at(requested) {
            match existing.get(&def.name) {
                None => plan.create.push(def.clone()),
                Some(old) if old != def => {
                    let added = def
                        .indexes
                        .iter()
                        .filter(|i| old.index_def(&i.name).is_none())
                        .cloned()
                        .collect();
                    let mut merged = def.clone();
                    merged.key_path = old.key_path.clone();
                    plan.alter.push((merged, added));
                }
                Some(_) => {}
            }
        }
        Ok(Some(plan))
    }

    /// The accounting application's stores.
    pub fn accounting() -> Self {
        let invoice_status = ["draft", "unpaid", "partial", "paid", "overdue", "cancelled"];
        let backup_types = ["manual", "auto", "initial", "pre_restore"];

        Schema::new(vec![
            StoreDef::new("users")
                .auto_increment()
                .unique_index("username")
                .unique_index("email")
                .field(FieldDef::text("username").required())
                .field(FieldDef::text("email"))
                .field(FieldDef::text("role"))
                .field(FieldDef::timestamp("createdAt"))
                .backup_required(),
            StoreDef::new("customers")
                .index("name")
                .index("email")
                .index("phone")
                .field(FieldDef::text("name").required())
                .field(FieldDef::text("email"))
                .field(FieldDef::text("phone"))
                .field(FieldDef::number("balance"))
                .field(FieldDef::bool("isActive"))
                .field(FieldDef::timestamp("createdAt"))
                .backup_required(),
            StoreDef::new("invoices")
                .unique_index("invoiceNumber")
                .index("customerId")
                .index("date")
                .index("status")
                .field(FieldDef::text("invoiceNumber"))
                .field(FieldDef::json("customerId").references("customers"))
                .field(FieldDef::date("date"))
                .field(FieldDef::date("dueDate"))
                .field(FieldDef::number("subtotal"))
                .field(FieldDef::number("tax"))
                .field(FieldDef::number("total"))
                .field(FieldDef::number("paid"))
                .field(FieldDef::number("balance"))
                .field(FieldDef::enumeration("status", &invoice_status))
                .field(FieldDef::timestamp("createdAt"))
                .field(FieldDef::timestamp("updatedAt"))
                .backup_required(),
            StoreDef::new("expenses")
                .index("category")
                .index("date")
                .index("amount")
                .field(FieldDef::text("category"))
                .field(FieldDef::date("date"))
                .field(FieldDef::number("amount"))
                .field(FieldDef::bool("isRecurring"))
                .field(FieldDef::timestamp("createdAt"))
                .backup_required(),
            StoreDef::new("products")
                .index("name")
                .index("category")
                .index("price")
                .field(FieldDef::text("name"))
                .field(FieldDef::text("category"))
                .field(FieldDef::number("price"))
                .backup_required(),
            StoreDef::new("settings").key_path("key").backup_required(),
            StoreDef::new("suppliers")
                .index("name")
                .index("category")
                .field(FieldDef::text("name"))
                .field(FieldDef::text("category"))
                .since(2)
                .backup_required(),
            StoreDef::new("projects")
                .index("name")
                .index("status")
                .index("startDate")
                .field(FieldDef::text("name"))
                .field(FieldDef::text("status"))
                .field(FieldDef::date("startDate"))
                .field(FieldDef::json("customerId").references("customers"))
                .since(2)
                .backup_required(),
            StoreDef::new("inventory")
                .index("productId")
                .index("quantity")
                .index("location")
                .field(FieldDef::json("productId").references("products"))
                .field(FieldDef::number("quantity"))
                .field(FieldDef::text("location"))
                .since(2),
            StoreDef::new("transactions")
                .index("type")
                .index("date")
                .index("amount")
                .field(FieldDef::text("type"))
                .field(FieldDef::date("date"))
                .field(FieldDef::number("amount"))
                .since(2),
            StoreDef::new("activities")
                .index("userId")
                .index("timestamp")
                .index("action")
                .field(FieldDef::text("action").required())
                .field(FieldDef::timestamp("timestamp").required())
                .since(3),
            StoreDef::new("backups")
                .index("timestamp")
                .index("type")
                .field(FieldDef::enumeration("type", &backup_types).required())
                .field(FieldDef::timestamp("timestamp").required())
                .field(FieldDef::json("payload").required())
                .field(FieldDef::integer("sizeBytes"))
                .field(FieldDef::integer("schemaVersion"))
                .since(3),
            StoreDef::new("payments")
                .index("invoiceId")
                .index("date")
                .field(FieldDef::json("invoiceId").references("invoices"))
                .field(FieldDef::number("amount").required())
                .field(FieldDef::date("date"))
                .since(3),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_accounting_schema_shape() {
        let schema = Schema::accounting();
        assert_eq!(schema.latest_version(), SCHEMA_VERSION);
        let mut required = schema.required_for_backup();
        required.sort();
        let mut expected: Vec<String> = REQUIRED_BACKUP_STORES.iter().map(|s| s.to_string()).collect();
        expected.sort();
        assert_eq!(required, expected);
        assert_eq!(schema.store("settings").unwrap().key_path, "key");
        assert!(schema.store("users").unwrap().index_def("email").unwrap().unique);
        assert_eq!(schema.stores_at(1).count(), 6);
    }

    #[test]
    fn test_prepare_assigns_auto_increment_key() {
        let schema = Schema::accounting();
        let users = schema.store("users").unwrap();
        let (key, rec) = users.prepare(record(json!({"username": "noor"})), || 42).unwrap();
        assert_eq!(key, Key::Int(42));
        assert_eq!(rec["id"], json!(42));

        let customers = schema.store("customers").unwrap();
        let err = customers.prepare(record(json!({"name": "Acme"})), || 1).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
    }

    #[test]
    fn test_validate_field_types() {
        let schema = Schema::accounting();
        let invoices = schema.store("invoices").unwrap();
        assert!(invoices
            .validate(&record(json!({"id": "i1", "date": "2024-01-15", "status": "unpaid", "total": 10})))
            .is_ok());
        assert!(invoices.validate(&record(json!({"id": "i1", "status": "lost"}))).is_err());
        assert!(invoices.validate(&record(json!({"id": "i1", "date": "15/01/2024"}))).is_err());
        assert!(invoices.validate(&record(json!({"id": "i1", "total": "ten"}))).is_err());
        // nulls and undeclared fields are allowed
        assert!(invoices.validate(&record(json!({"id": "i1", "total": null, "notes": "x"}))).is_ok());
    }

    #[test]
    fn test_index_entries_skip_unindexable_values() {
        let schema = Schema::accounting();
        let invoices = schema.store("invoices").unwrap();
        let entries = invoices.index_entries(&record(json!({
            "id": "i1", "customerId": "c1", "status": null, "date": "2024-01-01"
        })));
        let names: Vec<&str> = entries.iter().map(|(i, _)| i.name.as_str()).collect();
        assert_eq!(names, vec!["customerId", "date"]);
    }

    #[test]
    fn test_plan_versions() {
        let schema = Schema::accounting();
        let empty = BTreeMap::new();

        let plan = schema.plan(0, 1, &empty).unwrap().unwrap();
        assert_eq!(plan.create.len(), 6);

        let existing: BTreeMap<String, StoreDef> = schema
            .stores_at(1)
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let plan = schema.plan(1, 3, &existing).unwrap().unwrap();
        let created: Vec<&str> = plan.create.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            created,
            vec!["suppliers", "projects", "inventory", "transactions", "activities", "backups", "payments"]
        );
        assert!(plan.alter.is_empty());

        assert!(schema.plan(3, 3, &existing).unwrap().is_none());
        assert!(schema.plan(3, 2, &existing).unwrap().is_none());
        assert!(matches!(
            schema.plan(4, 3, &existing),
            Err(StorageError::UnsupportedSchemaVersion { current: 4, requested: 3 })
        ));
        assert!(matches!(
            schema.plan(3, 9, &existing),
            Err(StorageError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_plan_backfills_new_index() {
        let v1 = Schema::new(vec![StoreDef::new("notes").index("title")]);
        let existing: BTreeMap<String, StoreDef> =
            v1.stores.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let v2 = Schema::new(vec![
            StoreDef::new("notes").index("title").index("tag"),
            StoreDef::new("tags").since(2),
        ]);
        let plan = v2.plan(1, 2, &existing).unwrap().unwrap();
        assert_eq!(plan.create.len(), 1);
        assert_eq!(plan.alter.len(), 1);
        assert_eq!(plan.alter[0].1[0].name, "tag");
    }
}
