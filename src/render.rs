use std::fmt::{Display, Formatter, Result};

use prettytable::{row, Table};

use crate::{
    accounting::DatabaseInfo,
    backup::{BackupStats, BackupSummary, RestoreReport},
    integrity::IntegrityReport,
};
use tallybook_core::StoreOutcome;

impl Display for DatabaseInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let mut table = Table::new();
        table.add_row(row!["Store", "Records"]);
        table.add_empty_row();
        for (store, count) in &self.stores {
            table.add_row(row![store, r -> count]);
        }
        table.add_empty_row();
        table.add_row(row!["Total", r -> self.total_records]);

        writeln!(f, "Engine:         {}", self.engine)?;
        writeln!(f, "Schema version: {}", self.schema_version)?;
        writeln!(f, "Estimated size: {} bytes", self.estimated_size)?;
        writeln!(f, "Last backup:    {}", self.last_backup.as_deref().unwrap_or("never"))?;
        write!(f, "\n{}\n", table)
    }
}

/// Table of backups, newest first.
pub struct BackupList<'a>(pub &'a [BackupSummary]);

impl Display for BackupList<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if self.0.is_empty() {
            return f.write_str("No backups\n");
        }
        let mut table = Table::new();
        table.add_row(row!["Id", "Type", "Timestamp", "Size (bytes)", "Schema", "Description"]);
        table.add_empty_row();
        for backup in self.0 {
            table.add_row(row![
                backup.id,
                backup.kind,
                backup.timestamp,
                r -> backup.size_bytes,
                backup.schema_version,
                backup.description
            ]);
        }
        write!(f, "\n{}\n", table)
    }
}

impl Display for BackupStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let mut table = Table::new();
        table.add_row(row!["Total backups", r -> self.total_backups]);
        table.add_row(row!["Auto", r -> self.auto_backups]);
        table.add_row(row!["Manual", r -> self.manual_backups]);
        table.add_row(row!["Total size (bytes)", r -> self.total_size]);
        table.add_row(row!["Average size (bytes)", r -> format!("{:.0}", self.average_size)]);
        table.add_row(row!["Last backup", self.last_backup.as_deref().unwrap_or("never")]);
        write!(f, "\n{}\n", table)
    }
}

impl Display for IntegrityReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        writeln!(f, "References checked: {}", self.checked)?;
        if self.is_clean() {
            return f.write_str("No orphaned references\n");
        }
        let mut table = Table::new();
        table.add_row(row!["Store", "Key", "Field", "Target", "Missing"]);
        table.add_empty_row();
        for orphan in &self.orphans {
            let key = orphan.key.as_ref().map(|k| k.to_string()).unwrap_or_default();
            table.add_row(row![orphan.store, key, orphan.field, orphan.target_store, orphan.missing]);
        }
        write!(f, "\n{}\n", table)
    }
}

impl Display for RestoreReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        if let Some(id) = &self.safety_backup_id {
            writeln!(f, "Safety backup: {}", id)?;
        }
        let mut table = Table::new();
        table.add_row(row!["Store", "Result"]);
        table.add_empty_row();
        for outcome in &self.stores {
            match outcome {
                StoreOutcome::Restored { store, records } => {
                    table.add_row(row![store, format!("{} records", records)]);
                }
                StoreOutcome::Failed { store, error } => {
                    table.add_row(row![store, format!("failed: {}", error)]);
                }
            }
        }
        write!(f, "\n{}\n", table)?;
        match &self.integrity {
            Some(report) => write!(f, "{}", report),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupKind;
    use std::collections::BTreeMap;

    #[test]
    fn test_backup_list_rendering() {
        assert_eq!(BackupList(&[]).to_string(), "No backups\n");
        let summary = BackupSummary {
            id: "backup_1".into(),
            kind: BackupKind::PreRestore,
            timestamp: "2024-01-01T00:00:00Z".into(),
            description: "before restore".into(),
            size_bytes: 2048,
            schema_version: 3,
        };
        let out = BackupList(&[summary]).to_string();
        assert!(out.contains("backup_1"));
        assert!(out.contains("pre_restore"));
        assert!(out.contains("2048"));
    }

    #[test]
    fn test_info_rendering() {
        let info = DatabaseInfo {
            engine: "memory".into(),
            schema_version: 3,
            stores: BTreeMap::from([("customers".to_string(), 2), ("users".to_string(), 1)]),
            total_records: 3,
            estimated_size: 100,
            last_backup: None,
        };
        let out = info.to_string();
        assert!(out.contains("Engine:         memory"));
        assert!(out.contains("customers"));
        assert!(out.contains("never"));
    }
}
