use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::EnvFilter;

use tallybook::{
    backup::{BackupEngine, BackupKind},
    collaborators::{Collaborators, DirectoryArtifactSink, StoreActivityLog},
    config::{BackupCommand, CliArgs, Command, Config, LoggingConfig},
    integrity,
    render::BackupList,
    scheduler::BackupScheduler,
    storage, Database, Schema, StorageError,
};

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    if config.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_logging(&config.logging);

    if config.metrics.enabled {
        if let Some(addr) = config.metrics_addr() {
            match PrometheusBuilder::new().with_http_listener(addr).install() {
                Ok(()) => tracing::info!(%addr, "Metrics endpoint listening"),
                Err(e) => tracing::warn!(error = %e, "Failed to install metrics exporter"),
            }
        }
    }

    if let Err(e) = run(cli.command, config).await {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        if e.state_changed() {
            eprintln!("Some stores were modified before the failure; the pre_restore backup holds the previous data.");
        }
        std::process::exit(1);
    }
}

async fn run(command: Command, config: Config) -> Result<(), StorageError> {
    let schema = Schema::accounting();
    let opened = storage::open(&config.storage, &schema)?;
    if let storage::StorageMode::Fallback { reason } = &opened.mode {
        eprintln!("Warning: running on fallback storage ({})", reason);
    }
    let db = Database::new(opened.backend);

    let mut collaborators = Collaborators {
        activity: Arc::new(StoreActivityLog::new(db.clone())),
        ..Collaborators::default()
    };
    if let Some(dir) = &config.backup.export_dir {
        collaborators.artifacts = Some(Arc::new(DirectoryArtifactSink::new(dir)));
    }
    let engine = BackupEngine::new(db.clone(), &schema, config.backup.clone()).with_collaborators(collaborators);

    match command {
        Command::Info => print!("{}", db.database_info()?),
        Command::Export { file } => {
            let export = engine.export_to_file(&file)?;
            println!("Exported {} records to {}", export.metadata.record_count, file.display());
        }
        Command::Import { file } => print!("{}", engine.restore_from_file(&file)?),
        Command::Check => print!("{}", integrity::check(&db)?),
        Command::Run => {
            if !config.backup.auto_backup {
                println!("Automatic backups are disabled");
                return Ok(());
            }
            let handle = BackupScheduler::new(Arc::new(engine)).spawn();
            tokio::signal::ctrl_c().await?;
            let created = handle.stop().await;
            println!("Stopped after {} backups", created);
        }
        Command::Backup(command) => match command {
            BackupCommand::Create { description } => {
                let backup = engine.create_backup(BackupKind::Manual, &description)?;
                println!("Created {} ({} bytes)", backup.id, backup.size_bytes);
            }
            BackupCommand::List { limit } => print!("{}", BackupList(&engine.list_backups(limit)?)),
            BackupCommand::Restore { id } => print!("{}", engine.restore_backup(&id)?),
            BackupCommand::Delete { id } => {
                engine.delete_backup(&id)?;
                println!("Deleted {}", id);
            }
            BackupCommand::Cleanup => {
                let deleted = engine.cleanup_old_backups()?;
                println!("Removed {} backups older than {} days", deleted, config.backup.retention_days);
            }
            BackupCommand::Stats => print!("{}", engine.backup_stats()?),
        },
    }
    Ok(())
}
