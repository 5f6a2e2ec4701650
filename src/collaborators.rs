//! Outside services the core calls into: the session, the activity log,
//! backup destinations and the integration endpoints. Each is a trait object
//! handed in at composition time.

use std::{fs, path::PathBuf, sync::Arc};

use serde_json::json;
use tallybook_core::{Record, StorageError};
use uuid::Uuid;

use crate::{
    backup::{BackupDocument, ExportData},
    clock::{Clock, SystemClock},
    query::Database,
};

pub trait SessionContext: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

pub trait ActivityLog: Send + Sync {
    fn log_activity(&self, user_id: Option<&str>, action: &str, description: &str);
}

pub trait CloudBackup: Send + Sync {
    fn save_cloud_backup(&self, backup: &BackupDocument) -> Result<(), StorageError>;
}

/// Materializes a backup as a file a user can keep.
pub trait ArtifactSink: Send + Sync {
    fn write_backup(&self, backup: &BackupDocument, export: &ExportData) -> Result<PathBuf, StorageError>;
}

pub trait Mailer: Send + Sync {
    /// Returns the message id.
    fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<String, StorageError>;
}

pub trait TaxAuthority: Send + Sync {
    /// Returns the submission id.
    fn submit_to_tax_authority(&self, invoice: &Record) -> Result<String, StorageError>;
}

#[derive(Debug, Default)]
pub struct NoSession;

impl SessionContext for NoSession {
    fn current_user_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct StaticSession(pub String);

impl SessionContext for StaticSession {
    fn current_user_id(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Emits activities as tracing events only.
#[derive(Debug, Default)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn log_activity(&self, user_id: Option<&str>, action: &str, description: &str) {
        tracing::info!(user_id, action, description, "Activity");
    }
}

/// Appends activities to the `activities` store.
pub struct StoreActivityLog {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl StoreActivityLog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

impl ActivityLog for StoreActivityLog {
    fn log_activity(&self, user_id: Option<&str>, action: &str, description: &str) {
        let activity = json!({
            "id": format!("activity_{}", Uuid::new_v4()),
            "userId": user_id,
            "action": action,
            "description": description,
            "timestamp": tallybook_core::dates::format_timestamp(self.clock.now()),
        });
        let serde_json::Value::Object(record) = activity else {
            return;
        };
        if let Err(e) = self.db.add("activities", record) {
            tracing::warn!(action, error = %e, "Failed to record activity");
        }
    }
}

/// Writes `backup_<date>_<id>.json` files into a directory.
pub struct DirectoryArtifactSink {
    dir: PathBuf,
}

impl DirectoryArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSink for DirectoryArtifactSink {
    fn write_backup(&self, backup: &BackupDocument, export: &ExportData) -> Result<PathBuf, StorageError> {
        fs::create_dir_all(&self.dir)?;
        let date = backup.timestamp.get(..10).unwrap_or("unknown");
        let path = self.dir.join(format!("backup_{}_{}.json", date, backup.id));
        fs::write(&path, serde_json::to_vec_pretty(export)?)?;
        tracing::debug!(path = %path.display(), "Backup artifact written");
        Ok(path)
    }
}

#[derive(Debug, Default)]
pub struct NoopCloudBackup;

impl CloudBackup for NoopCloudBackup {
    fn save_cloud_backup(&self, backup: &BackupDocument) -> Result<(), StorageError> {
        tracing::info!(backup_id = %backup.id, "Cloud backup not configured, skipping upload");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoopMailer;

impl Mailer for NoopMailer {
    fn send_email(&self, to: &str, subject: &str, _body: &str) -> Result<String, StorageError> {
        tracing::info!(to, subject, "Email not sent, no mailer configured");
        Ok(format!("msg_{}", Uuid::new_v4()))
    }
}

#[derive(Debug, Default)]
pub struct NoopTaxAuthority;

impl TaxAuthority for NoopTaxAuthority {
    fn submit_to_tax_authority(&self, invoice: &Record) -> Result<String, StorageError> {
        let id = invoice.get("id").map(|v| v.to_string()).unwrap_or_default();
        tracing::info!(invoice = %id, "Tax submission skipped, no authority configured");
        Ok(format!("sub_{}", Uuid::new_v4()))
    }
}

/// The full set of collaborators, composed once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub session: Arc<dyn SessionContext>,
    pub activity: Arc<dyn ActivityLog>,
    pub cloud: Arc<dyn CloudBackup>,
    pub artifacts: Option<Arc<dyn ArtifactSink>>,
    pub mailer: Arc<dyn Mailer>,
    pub tax: Arc<dyn TaxAuthority>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            session: Arc::new(NoSession),
            activity: Arc::new(TracingActivityLog),
            cloud: Arc::new(NoopCloudBackup),
            artifacts: None,
            mailer: Arc::new(NoopMailer),
            tax: Arc::new(NoopTaxAuthority),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tallybook_core::{Schema, SCHEMA_VERSION};
    use tallybook_memory::InMemoryStorage;
    use time::macros::datetime;

    #[test]
    fn test_store_activity_log_appends() {
        let storage = InMemoryStorage::with_schema(&Schema::accounting(), SCHEMA_VERSION).unwrap();
        let db = Database::new(Arc::new(storage));
        let log = StoreActivityLog::with_clock(db.clone(), Arc::new(crate::clock::FixedClock(datetime!(2024-05-01 12:00 UTC))));
        log.log_activity(Some("1"), "backup", "created backup (manual)");
        log.log_activity(None, "restore", "restored");

        let activities = db.get_all("activities").unwrap();
        assert_eq!(activities.len(), 2);
        let backup = activities.iter().find(|a| a["action"] == "backup").unwrap();
        assert_eq!(backup["userId"], "1");
        assert_eq!(backup["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn test_noop_integrations_return_ids() {
        let collaborators = Collaborators::default();
        assert!(collaborators.session.current_user_id().is_none());
        let msg = collaborators.mailer.send_email("a@b.c", "Invoice INV-1", "body").unwrap();
        assert!(msg.starts_with("msg_"));
        let sub = collaborators.tax.submit_to_tax_authority(&Record::new()).unwrap();
        assert!(sub.starts_with("sub_"));
        assert_eq!(StaticSession("7".into()).current_user_id().as_deref(), Some("7"));
    }
}
