//! Wharf Error Types
//!
//! Every failure carries a stable [`ErrorCode`] so that tooling driving
//! dump/load can branch on the category (retry the same dump vs. re-dump).

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Wharf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wharf error types
#[derive(Error, Debug)]
pub enum Error {
    // Event log errors
    #[error("Events from id {requested} are no longer available, oldest retained event is {oldest}")]
    RetentionGap { requested: String, oldest: String },

    #[error("Notification log is missing events between {after} and {next}")]
    EventsMissing { after: String, next: String },

    // Data movement errors
    #[error("Data file {file} is missing from source path {path:?} and from the CM store (checksum {checksum})")]
    SourcePathMissing {
        file: String,
        path: PathBuf,
        checksum: String,
    },

    #[error("Data directory missing for {object}: {path:?}")]
    DataDirMissing { object: String, path: PathBuf },

    // Target errors
    #[error("Target database {0} is not empty and was not replicated from this dump")]
    TargetNotEmpty(String),

    #[error("Bootstrap of {database} already completed from another dump (last replicated id {last_id})")]
    BootstrapAlreadyComplete { database: String, last_id: String },

    // Source errors
    #[error("Database {0} is not a source of replication (missing repl.source.for)")]
    NotReplicationSource(String),

    // Dump directory errors
    #[error("Invalid dump directory {path:?}: {reason}")]
    InvalidDump { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Catalog errors
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable, enumerable error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RetentionGap,
    EventsMissing,
    SourcePathMissing,
    TargetNotEmpty,
    BootstrapAlreadyComplete,
    NotReplicationSource,
    InvalidDump,
    Configuration,
    Catalog,
    State,
    Io,
    Serialization,
    Internal,
}

impl ErrorCode {
    /// Numeric code reported to the command layer
    pub fn as_u32(&self) -> u32 {
        match self {
            ErrorCode::RetentionGap => 20001,
            ErrorCode::EventsMissing => 20002,
            ErrorCode::SourcePathMissing => 20011,
            ErrorCode::TargetNotEmpty => 20021,
            ErrorCode::BootstrapAlreadyComplete => 20022,
            ErrorCode::NotReplicationSource => 20031,
            ErrorCode::InvalidDump => 20041,
            ErrorCode::Configuration => 20051,
            ErrorCode::Catalog => 20061,
            ErrorCode::State => 20071,
            ErrorCode::Io => 20081,
            ErrorCode::Serialization => 20091,
            ErrorCode::Internal => 20099,
        }
    }

    /// Upper-snake name of the category
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::RetentionGap => "RETENTION_GAP",
            ErrorCode::EventsMissing => "EVENTS_MISSING",
            ErrorCode::SourcePathMissing => "SOURCE_PATH_MISSING",
            ErrorCode::TargetNotEmpty => "TARGET_NOT_EMPTY",
            ErrorCode::BootstrapAlreadyComplete => "BOOTSTRAP_ALREADY_COMPLETE",
            ErrorCode::NotReplicationSource => "NOT_REPLICATION_SOURCE",
            ErrorCode::InvalidDump => "INVALID_DUMP",
            ErrorCode::Configuration => "CONFIGURATION",
            ErrorCode::Catalog => "CATALOG",
            ErrorCode::State => "STATE",
            ErrorCode::Io => "IO",
            ErrorCode::Serialization => "SERIALIZATION",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Error {
    /// Stable category of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::RetentionGap { .. } => ErrorCode::RetentionGap,
            Error::EventsMissing { .. } => ErrorCode::EventsMissing,
            Error::SourcePathMissing { .. } | Error::DataDirMissing { .. } => {
                ErrorCode::SourcePathMissing
            }
            Error::TargetNotEmpty(_) => ErrorCode::TargetNotEmpty,
            Error::BootstrapAlreadyComplete { .. } => ErrorCode::BootstrapAlreadyComplete,
            Error::NotReplicationSource(_) => ErrorCode::NotReplicationSource,
            Error::InvalidDump { .. } => ErrorCode::InvalidDump,
            Error::Config(_) | Error::ConfigParse(_) => ErrorCode::Configuration,
            Error::Catalog(_) | Error::AlreadyExists(_) | Error::NotFound(_) => ErrorCode::Catalog,
            Error::State(_) => ErrorCode::State,
            Error::Io(_) => ErrorCode::Io,
            Error::Serialization(_) => ErrorCode::Serialization,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Check if re-running the same load with the same dump can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourcePathMissing { .. }
                | Error::Io(_)
                | Error::Catalog(_)
                | Error::State(_)
        )
    }

    /// Check if the caller has to produce a fresh dump instead of retrying
    pub fn requires_redump(&self) -> bool {
        matches!(
            self,
            Error::RetentionGap { .. } | Error::EventsMissing { .. } | Error::InvalidDump { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let codes = [
            ErrorCode::RetentionGap,
            ErrorCode::EventsMissing,
            ErrorCode::SourcePathMissing,
            ErrorCode::TargetNotEmpty,
            ErrorCode::BootstrapAlreadyComplete,
            ErrorCode::NotReplicationSource,
            ErrorCode::InvalidDump,
            ErrorCode::Configuration,
            ErrorCode::Catalog,
            ErrorCode::State,
            ErrorCode::Io,
            ErrorCode::Serialization,
            ErrorCode::Internal,
        ];
        let mut numbers: Vec<u32> = codes.iter().map(|c| c.as_u32()).collect();
        numbers.sort();
        numbers.dedup();
        assert_eq!(numbers.len(), codes.len());
    }

    #[test]
    fn test_retry_classification() {
        let gap = Error::RetentionGap {
            requested: "5".into(),
            oldest: "10".into(),
        };
        assert_eq!(gap.code(), ErrorCode::RetentionGap);
        assert!(gap.requires_redump());
        assert!(!gap.is_retryable());

        let missing = Error::SourcePathMissing {
            file: "data_1".into(),
            path: PathBuf::from("/tmp/x"),
            checksum: "abc".into(),
        };
        assert_eq!(missing.code().name(), "SOURCE_PATH_MISSING");
        assert!(missing.is_retryable());

        let config = Error::Config("bad".into());
        assert_eq!(config.code().as_u32(), 20051);
    }
}
