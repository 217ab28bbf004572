//! Wharf Configuration
//!
//! This module provides configuration structures for the dump/load
//! replication engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::event::JSON_MESSAGE_FORMAT;

/// Main Wharf configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WharfConfig {
    /// Source cluster configuration
    pub source: SourceConfig,

    /// Replica cluster configuration
    pub target: TargetConfig,

    /// Dump configuration
    #[serde(default)]
    pub dump: DumpConfig,

    /// Change management (recycle store) configuration
    #[serde(default)]
    pub cm: CmConfig,

    /// Load configuration
    #[serde(default)]
    pub load: LoadConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Source cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Root holding the warehouse, catalog, notification log and CM root
    pub data_dir: PathBuf,

    /// Message format expected in the notification log
    #[serde(default = "default_message_format")]
    pub message_format: String,
}

/// Replica cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Root holding the replica warehouse and catalog
    pub data_dir: PathBuf,
}

/// Dump configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Directory under which dump roots are created
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,

    /// Number of raw events fetched from the notification log per round trip
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
}

/// Change management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmConfig {
    /// Preserve files made unreachable by destructive operations
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long recycled content is kept, in seconds
    #[serde(default = "default_cm_retention_secs")]
    pub retention_secs: u64,

    /// Maximum lag between a dump and its load in this environment, in seconds
    #[serde(default = "default_max_dump_lag_secs")]
    pub max_dump_lag_secs: u64,
}

/// Load configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Maximum catalog operations executed per iteration
    #[serde(default = "default_max_ops_per_iteration")]
    pub max_ops_per_iteration: usize,

    /// Execute independent objects in parallel within an iteration
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Worker count (0 = auto-tune from hardware)
    #[serde(default)]
    pub workers: usize,

    /// Relocate data files straight into their final location
    #[serde(default)]
    pub move_optimization: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_message_format() -> String {
    JSON_MESSAGE_FORMAT.to_string()
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/var/lib/wharf/dumps")
}

fn default_fetch_batch_size() -> usize {
    500
}

fn default_cm_retention_secs() -> u64 {
    24 * 3600
}

fn default_max_dump_lag_secs() -> u64 {
    12 * 3600
}

fn default_max_ops_per_iteration() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            dump_dir: default_dump_dir(),
            fetch_batch_size: default_fetch_batch_size(),
        }
    }
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: default_cm_retention_secs(),
            max_dump_lag_secs: default_max_dump_lag_secs(),
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            max_ops_per_iteration: default_max_ops_per_iteration(),
            parallel: true,
            workers: 0,
            move_optimization: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CmConfig {
    /// Retention window as a Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl WharfConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WharfConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WharfConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.source.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("source.data_dir cannot be empty".into()));
        }

        if self.target.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("target.data_dir cannot be empty".into()));
        }

        if self.source.data_dir == self.target.data_dir {
            return Err(crate::Error::Config(
                "source.data_dir and target.data_dir must differ".into(),
            ));
        }

        if self.source.message_format.is_empty() {
            return Err(crate::Error::Config("source.message_format cannot be empty".into()));
        }

        if self.dump.fetch_batch_size == 0 {
            return Err(crate::Error::Config("dump.fetch_batch_size must be positive".into()));
        }

        if self.load.max_ops_per_iteration == 0 {
            return Err(crate::Error::Config(
                "load.max_ops_per_iteration must be positive".into(),
            ));
        }

        if self.cm.retention_secs < self.cm.max_dump_lag_secs {
            return Err(crate::Error::Config(format!(
                "cm.retention_secs ({}) must cover cm.max_dump_lag_secs ({})",
                self.cm.retention_secs, self.cm.max_dump_lag_secs
            )));
        }

        Ok(())
    }

    /// Source warehouse root
    pub fn source_warehouse_dir(&self) -> PathBuf {
        self.source.data_dir.join("warehouse")
    }

    /// Source catalog database file
    pub fn source_catalog_path(&self) -> PathBuf {
        self.source.data_dir.join("catalog.db")
    }

    /// Source notification log file
    pub fn source_events_path(&self) -> PathBuf {
        self.source.data_dir.join("events.db")
    }

    /// Source CM root
    pub fn cm_root(&self) -> PathBuf {
        self.source.data_dir.join("cmroot")
    }

    /// Replica warehouse root
    pub fn target_warehouse_dir(&self) -> PathBuf {
        self.target.data_dir.join("warehouse")
    }

    /// Replica catalog database file
    pub fn target_catalog_path(&self) -> PathBuf {
        self.target.data_dir.join("catalog.db")
    }

    /// Number of load workers, auto-tuned when not configured
    pub fn load_workers(&self) -> usize {
        if self.load.workers > 0 {
            self.load.workers
        } else {
            crate::tuning::auto_tune().load_workers
        }
    }
}
