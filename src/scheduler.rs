use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::backup::{BackupEngine, BackupKind};

/// Periodic backups: one `initial` backup after the start delay, then an
/// `auto` backup and a retention cleanup on every interval.
pub struct BackupScheduler {
    engine: Arc<BackupEngine>,
    initial_delay: Duration,
    interval: Duration,
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<usize>,
}

impl SchedulerHandle {
    /// Stops the scheduler and returns how many backups it created.
    pub async fn stop(self) -> usize {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "Backup scheduler task failed");
                0
            }
        }
    }
}

impl BackupScheduler {
    pub fn new(engine: Arc<BackupEngine>) -> Self {
        let initial_delay = engine.config().initial_delay();
        let interval = engine.config().interval();
        Self {
            engine,
            initial_delay,
            interval,
        }
    }

    pub fn with_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (stop, rx) = watch::channel(false);
        let task = tokio::spawn(self.run(rx));
        SchedulerHandle { stop, task }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) -> usize {
        tracing::info!(
            initial_delay_secs = self.initial_delay.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Backup scheduler started"
        );
        let mut ticker = tokio::time::interval_at(Instant::now() + self.initial_delay, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut created = 0;
        let mut kind = BackupKind::Initial;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let engine = self.engine.clone();
                    match tokio::task::spawn_blocking(move || scheduled_backup(&engine, kind)).await {
                        Ok(true) => created += 1,
                        Ok(false) => {}
                        Err(e) => tracing::error!(kind = %kind, error = %e, "Scheduled backup task failed"),
                    }
                    kind = BackupKind::Auto;
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(created, "Backup scheduler stopped");
        created
    }
}

/// One scheduled run on a blocking thread. Returns whether a backup was
/// created.
fn scheduled_backup(engine: &BackupEngine, kind: BackupKind) -> bool {
    let created = match engine.create_backup(kind, "scheduled backup") {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(kind = %kind, error = %e, "Scheduled backup failed");
            false
        }
    };
    if kind == BackupKind::Auto {
        if let Err(e) = engine.cleanup_old_backups() {
            tracing::warn!(error = %e, "Backup cleanup failed");
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backup::{BackupDocument, ExportData},
        collaborators::{ArtifactSink, Collaborators},
        config::BackupConfig,
        query::Database,
    };
    use std::path::PathBuf;
    use tallybook_core::{Schema, StorageError, SCHEMA_VERSION};
    use tallybook_memory::InMemoryStorage;

    fn engine() -> Arc<BackupEngine> {
        engine_with(Collaborators::default())
    }

    fn engine_with(collaborators: Collaborators) -> Arc<BackupEngine> {
        let schema = Schema::accounting();
        let storage = InMemoryStorage::with_schema(&schema, SCHEMA_VERSION).unwrap();
        Arc::new(
            BackupEngine::new(Database::new(Arc::new(storage)), &schema, BackupConfig::default())
                .with_collaborators(collaborators),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_then_interval_backups() {
        let engine = engine();
        let handle = BackupScheduler::new(engine.clone())
            .with_timing(Duration::from_secs(5), Duration::from_secs(60))
            .spawn();

        tokio::time::sleep(Duration::from_secs(130)).await;
        assert_eq!(handle.stop().await, 3);

        let stats = engine.backup_stats().unwrap();
        assert_eq!(stats.total_backups, 3);
        assert_eq!(stats.auto_backups, 2);
        let kinds: Vec<BackupKind> = engine.list_backups(10).unwrap().into_iter().map(|b| b.kind).collect();
        assert!(kinds.contains(&BackupKind::Initial));
    }

    struct SlowSink(Duration);

    impl ArtifactSink for SlowSink {
        fn write_backup(&self, backup: &BackupDocument, _export: &ExportData) -> Result<PathBuf, StorageError> {
            std::thread::sleep(self.0);
            Ok(PathBuf::from(&backup.id))
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_backup_leaves_runtime_responsive() {
        let engine = engine_with(Collaborators {
            artifacts: Some(Arc::new(SlowSink(Duration::from_millis(400)))),
            ..Collaborators::default()
        });
        let started = std::time::Instant::now();
        let handle = BackupScheduler::new(engine.clone())
            .with_timing(Duration::ZERO, Duration::from_secs(3600))
            .spawn();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(handle.stop().await, 1);
        assert_eq!(engine.backup_stats().unwrap().total_backups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_backup() {
        let engine = engine();
        let handle = BackupScheduler::new(engine.clone()).spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.stop().await, 0);
        assert_eq!(engine.backup_stats().unwrap().total_backups, 0);
    }
}
