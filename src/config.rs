use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::storage::EngineKind;

#[derive(Parser, Debug)]
#[command(name = "tallybook", about = "Tallybook - accounting data store with backup and restore")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "tallybook.toml")]
    pub config: String,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Storage engine (overrides config file)
    #[arg(short, long, value_enum)]
    pub engine: Option<EngineKind>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show engine, schema version and per-store record counts
    Info,
    /// Write every required store to a JSON export file
    Export { file: PathBuf },
    /// Restore every required store from a JSON export file
    Import { file: PathBuf },
    /// Report orphaned references between stores
    Check,
    /// Run scheduled backups until interrupted
    Run,
    #[command(subcommand)]
    Backup(BackupCommand),
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    Create {
        #[arg(short, long, default_value = "")]
        description: String,
    },
    List {
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
    },
    Restore { id: String },
    Delete { id: String },
    Cleanup,
    Stats,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub engine: EngineKind,

    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Directory for the fallback key-value medium. Without it the fallback
    /// keeps its data in memory for the life of the process.
    #[serde(default)]
    pub fallback_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub auto_backup: bool,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Where backup files are written. No files when unset.
    #[serde(default)]
    pub export_dir: Option<PathBuf>,

    #[serde(default)]
    pub cloud_backup: bool,

    #[serde(default = "default_true")]
    pub verify_after_restore: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// When true, a Prometheus scrape endpoint is served on `listen`.
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("tallybook.db")
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_initial_delay_secs() -> u64 {
    5
}

fn default_retention_days() -> u32 {
    30
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9100".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            engine: EngineKind::default(),
            path: default_storage_path(),
            fallback_dir: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            auto_backup: true,
            interval_secs: default_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            retention_days: default_retention_days(),
            export_dir: None,
            cloud_backup: false,
            verify_after_restore: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

impl BackupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            backup: BackupConfig::default(),
            logging: default_logging(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(engine) = cli.engine {
            config.storage.engine = engine;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        match self.metrics.listen.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!(listen = %self.metrics.listen, error = %e, "Invalid metrics listen address");
                None
            }
        }
    }
}
