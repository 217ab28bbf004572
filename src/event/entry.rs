//! Replication Event Types
//!
//! Defines the change events recorded in the notification log and the
//! message payloads they carry.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::EventId;
use super::JSON_MESSAGE_FORMAT;
use crate::catalog::{Database, Function, Partition, PartitionSpec, Table};
use crate::error::{Error, Result};

/// Kind of catalog change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    CreateTable,
    DropTable,
    AlterTable,
    RenameTable,
    AddPartition,
    DropPartition,
    RenamePartition,
    AlterPartition,
    Insert,
    InsertOverwrite,
    TruncateTable,
    TruncatePartition,
    CreateFunction,
    DropFunction,
    CreateDatabase,
    AlterDatabase,
    Concatenate,
}

impl EventType {
    pub const ALL: [EventType; 17] = [
        EventType::CreateTable,
        EventType::DropTable,
        EventType::AlterTable,
        EventType::RenameTable,
        EventType::AddPartition,
        EventType::DropPartition,
        EventType::RenamePartition,
        EventType::AlterPartition,
        EventType::Insert,
        EventType::InsertOverwrite,
        EventType::TruncateTable,
        EventType::TruncatePartition,
        EventType::CreateFunction,
        EventType::DropFunction,
        EventType::CreateDatabase,
        EventType::AlterDatabase,
        EventType::Concatenate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CreateTable => "CREATE_TABLE",
            EventType::DropTable => "DROP_TABLE",
            EventType::AlterTable => "ALTER_TABLE",
            EventType::RenameTable => "RENAME_TABLE",
            EventType::AddPartition => "ADD_PARTITION",
            EventType::DropPartition => "DROP_PARTITION",
            EventType::RenamePartition => "RENAME_PARTITION",
            EventType::AlterPartition => "ALTER_PARTITION",
            EventType::Insert => "INSERT",
            EventType::InsertOverwrite => "INSERT_OVERWRITE",
            EventType::TruncateTable => "TRUNCATE_TABLE",
            EventType::TruncatePartition => "TRUNCATE_PARTITION",
            EventType::CreateFunction => "CREATE_FUNCTION",
            EventType::DropFunction => "DROP_FUNCTION",
            EventType::CreateDatabase => "CREATE_DATABASE",
            EventType::AlterDatabase => "ALTER_DATABASE",
            EventType::Concatenate => "CONCATENATE",
        }
    }

    /// Events that are not tied to a table
    pub fn is_database_scoped(&self) -> bool {
        matches!(
            self,
            EventType::CreateDatabase
                | EventType::AlterDatabase
                | EventType::CreateFunction
                | EventType::DropFunction
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Internal(format!("unknown event type '{}'", s)))
    }
}

/// Data file referenced by an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// File name inside its table or partition directory
    pub name: String,
    /// Location of the file when the event was generated
    pub path: PathBuf,
    /// SHA-256 of the content, hex encoded
    pub checksum: String,
    pub size: u64,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventMessage {
    CreateDatabase {
        database: Database,
    },
    AlterDatabase {
        before: Database,
        after: Database,
    },
    CreateTable {
        table: Table,
    },
    DropTable {
        table: Table,
    },
    AlterTable {
        before: Table,
        after: Table,
    },
    RenameTable {
        before: Table,
        after: Table,
    },
    AddPartition {
        table: Table,
        partitions: Vec<Partition>,
    },
    DropPartition {
        table: Table,
        specs: Vec<PartitionSpec>,
    },
    AlterPartition {
        table: Table,
        before: Partition,
        after: Partition,
    },
    RenamePartition {
        table: Table,
        before: PartitionSpec,
        after: Partition,
    },
    Insert {
        table: Table,
        #[serde(default)]
        partition: Option<Partition>,
        files: Vec<FileRef>,
        /// INSERT OVERWRITE: the written files are the whole new file set
        #[serde(default)]
        replace: bool,
        /// The insert created the target partition dynamically
        #[serde(default)]
        partition_created: bool,
    },
    Truncate {
        table: Table,
        #[serde(default)]
        partition: Option<PartitionSpec>,
    },
    Concatenate {
        table: Table,
        #[serde(default)]
        partition: Option<Partition>,
        files: Vec<FileRef>,
    },
    CreateFunction {
        function: Function,
        #[serde(default)]
        resources: Vec<FileRef>,
    },
    DropFunction {
        db: String,
        name: String,
    },
}

impl EventMessage {
    /// Encode with the current message format
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One entry of the notification log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub db: String,
    /// None for database-scoped events
    pub table: Option<String>,
    pub partition: Option<PartitionSpec>,
    pub message_format: String,
    pub message: String,
    pub event_time: DateTime<Utc>,
}

impl ReplicationEvent {
    /// Decode the payload
    pub fn decode(&self) -> Result<EventMessage> {
        if self.message_format != JSON_MESSAGE_FORMAT {
            return Err(Error::Internal(format!(
                "event {} uses unsupported message format '{}'",
                self.id, self.message_format
            )));
        }
        Ok(serde_json::from_str(&self.message)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
        assert!("MERGE".parse::<EventType>().is_err());
    }

    #[test]
    fn test_decode_rejects_foreign_format() {
        let msg = EventMessage::DropFunction {
            db: "db".into(),
            name: "f".into(),
        };
        let mut event = ReplicationEvent {
            id: EventId::from(7),
            event_type: EventType::DropFunction,
            db: "db".into(),
            table: None,
            partition: None,
            message_format: JSON_MESSAGE_FORMAT.to_string(),
            message: msg.encode().unwrap(),
            event_time: Utc::now(),
        };
        assert_eq!(event.decode().unwrap(), msg);

        event.message_format = "gzip(json-2.0)".into();
        assert!(event.decode().is_err());
    }
}
