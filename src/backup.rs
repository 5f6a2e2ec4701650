//! Snapshot-and-restore over the required stores.
//!
//! A backup is the export document of every required store wrapped with an
//! id, type, timestamp and size, saved into the `backups` store. A restore
//! validates the document, takes a `pre_restore` safety backup and then
//! replaces one store at a time. Stores are not restored under one lock, so
//! a restore that fails halfway reports which stores were replaced.

use std::{
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tallybook_core::{
    dates::{format_timestamp, parse_timestamp},
    Key, Record, Schema, StorageError, StoreOutcome,
};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    collaborators::Collaborators,
    config::BackupConfig,
    integrity::{self, IntegrityReport},
    query::Database,
};

pub const BACKUPS_STORE: &str = "backups";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Auto,
    Initial,
    PreRestore,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Manual => "manual",
            BackupKind::Auto => "auto",
            BackupKind::Initial => "initial",
            BackupKind::PreRestore => "pre_restore",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub export_date: String,
    pub version: u32,
    pub record_count: usize,
}

/// The export / backup file: one array per required store plus `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    #[serde(flatten)]
    pub stores: BTreeMap<String, Vec<Record>>,
    pub metadata: ExportMetadata,
}

impl ExportData {
    /// Validates an untrusted document and builds the export from it. Every
    /// required store must be present as a (possibly empty) list of objects;
    /// keys that are not required stores are ignored.
    pub fn from_value(value: Value, required: &[String]) -> Result<Self, StorageError> {
        let Value::Object(mut map) = value else {
            return Err(StorageError::InvalidBackupFormat(
                "backup document must be a JSON object".to_string(),
            ));
        };

        let mut stores = BTreeMap::new();
        for store in required {
            let items = match map.remove(store) {
                Some(Value::Array(items)) => items,
                None | Some(Value::Null) => {
                    return Err(StorageError::InvalidBackupFormat(format!("missing store '{}'", store)));
                }
                Some(_) => {
                    return Err(StorageError::InvalidBackupFormat(format!("store '{}' is not a list", store)));
                }
            };
            let mut records = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(record) => records.push(record),
                    _ => {
                        return Err(StorageError::InvalidBackupFormat(format!(
                            "store '{}' item {} is not an object",
                            store, i
                        )));
                    }
                }
            }
            stores.insert(store.clone(), records);
        }

        let record_count = stores.values().map(Vec::len).sum();
        let metadata = match map.remove("metadata") {
            Some(Value::Null) | None => ExportMetadata {
                record_count,
                ..ExportMetadata::default()
            },
            Some(meta) => serde_json::from_value(meta)
                .map_err(|e| StorageError::InvalidBackupFormat(format!("invalid metadata: {}", e)))?,
        };
        for ignored in map.keys() {
            tracing::debug!(key = %ignored, "Ignoring non-required key in backup document");
        }
        Ok(Self { stores, metadata })
    }

    pub fn record_count(&self) -> usize {
        self.stores.values().map(Vec::len).sum()
    }

    fn check_required(&self, required: &[String]) -> Result<(), StorageError> {
        match required.iter().find(|s| !self.stores.contains_key(*s)) {
            Some(missing) => Err(StorageError::InvalidBackupFormat(format!("missing store '{}'", missing))),
            None => Ok(()),
        }
    }
}

/// A stored backup, as kept in the `backups` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub timestamp: String,
    #[serde(default)]
    pub description: String,
    pub payload: ExportData,
    pub size_bytes: u64,
    pub schema_version: u32,
    #[serde(default)]
    pub app_version: String,
}

impl BackupDocument {
    fn to_record(&self) -> Result<Record, StorageError> {
        match serde_json::to_value(self)? {
            Value::Object(record) => Ok(record),
            _ => Err(StorageError::Other("backup did not serialize to an object".to_string())),
        }
    }

    fn from_record(record: Record) -> Result<Self, StorageError> {
        Ok(serde_json::from_value(Value::Object(record))?)
    }
}

/// A backup without its payload, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub timestamp: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub schema_version: u32,
}

impl BackupSummary {
    fn taken_at(&self) -> Option<OffsetDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStats {
    pub total_backups: usize,
    pub total_size: u64,
    pub auto_backups: usize,
    pub manual_backups: usize,
    pub last_backup: Option<String>,
    pub average_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    /// The `pre_restore` backup taken before anything was replaced. `None`
    /// for a retry, which reuses the first attempt's safety backup.
    pub safety_backup_id: Option<String>,
    pub stores: Vec<StoreOutcome>,
    pub integrity: Option<IntegrityReport>,
}

pub struct BackupEngine {
    db: Database,
    required: Vec<String>,
    config: BackupConfig,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
}

impl BackupEngine {
    pub fn new(db: Database, schema: &Schema, config: BackupConfig) -> Self {
        Self {
            db,
            required: schema.required_for_backup(),
            config,
            collaborators: Collaborators::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn required_stores(&self) -> &[String] {
        &self.required
    }

    fn log_activity(&self, action: &str, description: &str) {
        let user = self.collaborators.session.current_user_id();
        self.collaborators
            .activity
            .log_activity(user.as_deref(), action, description);
    }

    pub fn export_data(&self) -> Result<ExportData, StorageError> {
        let mut stores = BTreeMap::new();
        for store in &self.required {
            stores.insert(store.clone(), self.db.get_all(store)?);
        }
        let record_count = stores.values().map(Vec::len).sum();
        Ok(ExportData {
            stores,
            metadata: ExportMetadata {
                export_date: format_timestamp(self.clock.now()),
                version: self.db.schema_version()?,
                record_count,
            },
        })
    }

    pub fn export_to_file(&self, path: &Path) -> Result<ExportData, StorageError> {
        let export = self.export_data()?;
        std::fs::write(path, serde_json::to_vec_pretty(&export)?)?;
        tracing::info!(path = %path.display(), records = export.metadata.record_count, "Data exported");
        Ok(export)
    }

    pub fn create_backup(&self, kind: BackupKind, description: &str) -> Result<BackupDocument, StorageError> {
        let payload = self.export_data()?;
        let size_bytes = serde_json::to_vec(&payload)?.len() as u64;
        let backup = BackupDocument {
            id: format!("backup_{}", Uuid::new_v4()),
            kind,
            timestamp: format_timestamp(self.clock.now()),
            description: description.to_string(),
            schema_version: payload.metadata.version,
            payload,
            size_bytes,
            app_version: APP_VERSION.to_string(),
        };
        self.db.add(BACKUPS_STORE, backup.to_record()?)?;

        if let Some(sink) = &self.collaborators.artifacts {
            if let Err(e) = sink.write_backup(&backup, &backup.payload) {
                tracing::warn!(backup_id = %backup.id, error = %e, "Failed to write backup artifact");
            }
        }
        if self.config.cloud_backup {
            if let Err(e) = self.collaborators.cloud.save_cloud_backup(&backup) {
                tracing::warn!(backup_id = %backup.id, error = %e, "Cloud backup failed");
            }
        }

        metrics::increment_counter!("tallybook_backups_created_total", "type" => kind.as_str());
        metrics::histogram!("tallybook_backup_size_bytes", size_bytes as f64);
        tracing::info!(
            backup_id = %backup.id,
            kind = %kind,
            size_bytes,
            records = backup.payload.metadata.record_count,
            "Backup created"
        );
        self.log_activity("backup", &format!("created backup ({})", kind));
        Ok(backup)
    }

    pub fn get_backup(&self, id: &str) -> Result<BackupDocument, StorageError> {
        let record = self.db.require(BACKUPS_STORE, &Key::from(id))?;
        BackupDocument::from_record(record)
    }

    pub fn restore_backup(&self, id: &str) -> Result<RestoreReport, StorageError> {
        let backup = self.get_backup(id)?;
        let report = self.restore_data(&backup.payload)?;
        self.log_activity("restore", &format!("restored backup {} ({})", backup.id, backup.timestamp));
        Ok(report)
    }

    pub fn restore_from_file(&self, path: &Path) -> Result<RestoreReport, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        let report = self.restore_from_str(&contents)?;
        self.log_activity("restore", &format!("restored from file {}", path.display()));
        Ok(report)
    }

    pub fn restore_from_str(&self, json: &str) -> Result<RestoreReport, StorageError> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| StorageError::InvalidBackupFormat(format!("not valid JSON: {}", e)))?;
        let data = ExportData::from_value(value, &self.required)?;
        self.restore_data(&data)
    }

    /// Validates, takes the safety backup, then replaces every required store.
    pub fn restore_data(&self, data: &ExportData) -> Result<RestoreReport, StorageError> {
        data.check_required(&self.required)?;
        let current = self.db.schema_version()?;
        if data.metadata.version > current {
            return Err(StorageError::UnsupportedSchemaVersion {
                current,
                requested: data.metadata.version,
            });
        }

        let safety = self
            .create_backup(BackupKind::PreRestore, "before restore")
            .map_err(|e| {
                tracing::error!(error = %e, "Safety backup failed, restore aborted");
                e
            })?;

        let outcomes = self.apply(data, &self.required);
        self.finish(Some(safety.id), outcomes)
    }

    /// Re-applies only `stores` from `data`, typically the failed stores of a
    /// `PartialRestore`.
    pub fn retry_restore(&self, data: &ExportData, stores: &[String]) -> Result<RestoreReport, StorageError> {
        if let Some(unknown) = stores.iter().find(|s| !self.required.contains(s)) {
            return Err(StorageError::Validation(format!("'{}' is not a restorable store", unknown)));
        }
        data.check_required(stores)?;
        let outcomes = self.apply(data, stores);
        self.finish(None, outcomes)
    }

    fn apply(&self, data: &ExportData, stores: &[String]) -> Vec<StoreOutcome> {
        let mut outcomes = Vec::with_capacity(stores.len());
        for store in stores {
            let records = data.stores.get(store).cloned().unwrap_or_default();
            let count = records.len();
            match self.db.backend().replace_all(store, records) {
                Ok(()) => {
                    tracing::debug!(store = %store, records = count, "Store restored");
                    outcomes.push(StoreOutcome::Restored {
                        store: store.clone(),
                        records: count,
                    });
                }
                Err(e) => {
                    tracing::warn!(store = %store, error = %e, "Store restore failed");
                    outcomes.push(StoreOutcome::Failed {
                        store: store.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        outcomes
    }

    fn finish(&self, safety_backup_id: Option<String>, outcomes: Vec<StoreOutcome>) -> Result<RestoreReport, StorageError> {
        let failed: Vec<(String, String)> = outcomes
            .iter()
            .filter_map(|o| match o {
                StoreOutcome::Failed { store, error } => Some((store.clone(), error.clone())),
                StoreOutcome::Restored { .. } => None,
            })
            .collect();
        if !failed.is_empty() {
            metrics::increment_counter!("tallybook_restores_total", "outcome" => "partial");
            let restored = outcomes
                .iter()
                .filter(|o| o.is_restored())
                .map(|o| o.store().to_string())
                .collect();
            return Err(StorageError::PartialRestore { restored, failed });
        }

        let integrity = if self.config.verify_after_restore {
            let report = integrity::check(&self.db)?;
            if !report.is_clean() {
                tracing::warn!(orphans = report.orphans.len(), "Restored data has orphaned references");
            }
            Some(report)
        } else {
            None
        };
        metrics::increment_counter!("tallybook_restores_total", "outcome" => "success");
        tracing::info!(stores = outcomes.len(), "Restore completed");
        Ok(RestoreReport {
            safety_backup_id,
            stores: outcomes,
            integrity,
        })
    }

    fn summaries(&self) -> Result<Vec<BackupSummary>, StorageError> {
        let mut summaries = Vec::new();
        for record in self.db.get_all(BACKUPS_STORE)? {
            match serde_json::from_value::<BackupSummary>(Value::Object(record)) {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable backup record"),
            }
        }
        summaries.sort_by(|a, b| b.taken_at().cmp(&a.taken_at()).then_with(|| b.id.cmp(&a.id)));
        Ok(summaries)
    }

    /// Newest first.
    pub fn list_backups(&self, limit: usize) -> Result<Vec<BackupSummary>, StorageError> {
        let mut summaries = self.summaries()?;
        summaries.truncate(limit);
        Ok(summaries)
    }

    pub fn delete_backup(&self, id: &str) -> Result<(), StorageError> {
        self.db.delete(BACKUPS_STORE, &Key::from(id))?;
        metrics::increment_counter!("tallybook_backups_deleted_total");
        tracing::info!(backup_id = id, "Backup deleted");
        self.log_activity("delete_backup", &format!("deleted backup {}", id));
        Ok(())
    }

    pub fn cleanup_old_backups(&self) -> Result<usize, StorageError> {
        self.cleanup_old_backups_at(self.clock.now())
    }

    /// Deletes every backup older than the retention window ending at `now`.
    pub fn cleanup_old_backups_at(&self, now: OffsetDateTime) -> Result<usize, StorageError> {
        let cutoff = now - Duration::days(i64::from(self.config.retention_days));
        let mut deleted = 0;
        for summary in self.summaries()? {
            match summary.taken_at() {
                Some(taken) if taken < cutoff => {
                    self.db.delete(BACKUPS_STORE, &Key::from(summary.id.as_str()))?;
                    metrics::increment_counter!("tallybook_backups_deleted_total");
                    deleted += 1;
                }
                Some(_) => {}
                None => tracing::warn!(backup_id = %summary.id, "Backup has an unreadable timestamp"),
            }
        }
        if deleted > 0 {
            tracing::info!(deleted, retention_days = self.config.retention_days, "Old backups removed");
            self.log_activity("cleanup_backups", &format!("removed {} old backups", deleted));
        }
        Ok(deleted)
    }

    pub fn backup_stats(&self) -> Result<BackupStats, StorageError> {
        let summaries = self.summaries()?;
        let total_size: u64 = summaries.iter().map(|s| s.size_bytes).sum();
        let total_backups = summaries.len();
        Ok(BackupStats {
            total_backups,
            total_size,
            auto_backups: summaries.iter().filter(|s| s.kind == BackupKind::Auto).count(),
            manual_backups: summaries.iter().filter(|s| s.kind == BackupKind::Manual).count(),
            last_backup: summaries.first().map(|s| s.timestamp.clone()),
            average_size: if total_backups > 0 {
                total_size as f64 / total_backups as f64
            } else {
                0.0
            },
        })
    }
}
