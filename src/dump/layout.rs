//! Dump Directory Layout
//!
//! ```text
//! <dump_dir>/<uuid>/
//!     _dumpmetadata          {dump_type, from_id, to_id, databases, ...}
//!     <id>/_metadata         DumpEntry: the ops of one event or object
//!     <id>/_files            manifest of the data files those ops move
//! ```
//!
//! `_dumpmetadata` is written last; a root without it is an aborted dump.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{Database, Function, ObjectRef, Partition, PartitionSpec, Table};
use crate::error::{Error, Result};
use crate::event::id::{is_numeric_name, sort_numeric};
use crate::event::{EventId, EventType};

pub const DUMP_METADATA_FILE: &str = "_dumpmetadata";
pub const ENTRY_METADATA_FILE: &str = "_metadata";
pub const ENTRY_FILES_FILE: &str = "_files";

/// Layout version written into every dump
pub const DUMP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpType {
    Bootstrap,
    Incremental,
}

/// Top-level dump description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub version: u32,
    pub dump_type: DumpType,
    /// None for bootstrap
    pub from_id: Option<EventId>,
    /// Last event covered by the dump
    pub to_id: EventId,
    /// Source databases contained in the dump
    pub databases: Vec<String>,
    /// Set for table-scoped dumps
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub metadata_only: bool,
    pub created_at: DateTime<Utc>,
}

impl DumpMetadata {
    pub fn is_bootstrap(&self) -> bool {
        self.dump_type == DumpType::Bootstrap
    }
}

/// How written files combine with what the target already holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Add files not yet present, by name
    Append,
    /// Make the file set equal to the manifest
    Replace,
}

/// Target-side operation recorded in a dump entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DumpOp {
    CreateDatabase {
        database: Database,
    },
    AlterDatabase {
        database: Database,
    },
    CreateTable {
        table: Table,
    },
    AlterTable {
        table: Table,
    },
    DropTable {
        table: String,
    },
    RenameTable {
        from: String,
        to: String,
        table: Table,
    },
    AddPartition {
        table: String,
        partition: Partition,
    },
    AlterPartition {
        table: String,
        partition: Partition,
    },
    DropPartition {
        table: String,
        spec: PartitionSpec,
    },
    RenamePartition {
        table: String,
        from: PartitionSpec,
        to: PartitionSpec,
    },
    WriteData {
        table: String,
        #[serde(default)]
        partition: Option<PartitionSpec>,
        mode: WriteMode,
        /// Manifest file names
        files: Vec<String>,
    },
    Truncate {
        table: String,
        #[serde(default)]
        partition: Option<PartitionSpec>,
    },
    CreateFunction {
        function: Function,
        /// Manifest file names of the resources
        #[serde(default)]
        resources: Vec<String>,
    },
    DropFunction {
        name: String,
    },
}

impl DumpOp {
    /// Narrowest object the op affects, in source database `db`
    pub fn object(&self, db: &str) -> ObjectRef {
        match self {
            DumpOp::CreateDatabase { .. } | DumpOp::AlterDatabase { .. } => ObjectRef::database(db),
            DumpOp::CreateTable { table } | DumpOp::AlterTable { table } => {
                ObjectRef::table(db, &table.name)
            }
            DumpOp::DropTable { table } => ObjectRef::table(db, table),
            DumpOp::RenameTable { to, .. } => ObjectRef::table(db, to),
            DumpOp::AddPartition { table, partition } | DumpOp::AlterPartition { table, partition } => {
                ObjectRef::partition(db, table, partition.spec.clone())
            }
            DumpOp::DropPartition { table, spec } => ObjectRef::partition(db, table, spec.clone()),
            DumpOp::RenamePartition { table, to, .. } => ObjectRef::partition(db, table, to.clone()),
            DumpOp::WriteData { table, partition, .. } | DumpOp::Truncate { table, partition } => {
                match partition {
                    Some(spec) => ObjectRef::partition(db, table, spec.clone()),
                    None => ObjectRef::table(db, table),
                }
            }
            DumpOp::CreateFunction { function, .. } => {
                ObjectRef::function(db, &function.name)
            }
            DumpOp::DropFunction { name } => ObjectRef::function(db, name),
        }
    }

    /// Table the op belongs to, if any
    pub fn table_name(&self) -> Option<&str> {
        match self {
            DumpOp::CreateTable { table } | DumpOp::AlterTable { table } => Some(table.name.as_str()),
            DumpOp::RenameTable { from, .. } => Some(from.as_str()),
            DumpOp::DropTable { table }
            | DumpOp::AddPartition { table, .. }
            | DumpOp::AlterPartition { table, .. }
            | DumpOp::DropPartition { table, .. }
            | DumpOp::RenamePartition { table, .. }
            | DumpOp::WriteData { table, .. }
            | DumpOp::Truncate { table, .. } => Some(table.as_str()),
            _ => None,
        }
    }

    /// Ops that must not run concurrently with anything else
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            DumpOp::CreateDatabase { .. } | DumpOp::AlterDatabase { .. } | DumpOp::RenameTable { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DumpOp::CreateDatabase { .. } => "create_database",
            DumpOp::AlterDatabase { .. } => "alter_database",
            DumpOp::CreateTable { .. } => "create_table",
            DumpOp::AlterTable { .. } => "alter_table",
            DumpOp::DropTable { .. } => "drop_table",
            DumpOp::RenameTable { .. } => "rename_table",
            DumpOp::AddPartition { .. } => "add_partition",
            DumpOp::AlterPartition { .. } => "alter_partition",
            DumpOp::DropPartition { .. } => "drop_partition",
            DumpOp::RenamePartition { .. } => "rename_partition",
            DumpOp::WriteData { .. } => "write_data",
            DumpOp::Truncate { .. } => "truncate",
            DumpOp::CreateFunction { .. } => "create_function",
            DumpOp::DropFunction { .. } => "drop_function",
        }
    }
}

/// One dump subdirectory: an event (incremental) or an object (bootstrap)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry {
    /// Event id, or bootstrap ordinal
    pub id: EventId,
    /// Source database
    pub db: String,
    /// Originating event; None for bootstrap entries
    #[serde(default)]
    pub event_type: Option<EventType>,
    pub ops: Vec<DumpOp>,
}

/// Where the dump found a file's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FileSource {
    Original,
    Cm { path: PathBuf },
    Missing,
}

/// A data or resource file to move during load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    /// Table the file belongs to; None for function resources
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub partition: Option<PartitionSpec>,
    pub original_path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub source: FileSource,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path, root: &Path) -> Result<T> {
    let content = fs::read(path).map_err(|e| Error::InvalidDump {
        path: root.to_path_buf(),
        reason: format!("cannot read {:?}: {}", path, e),
    })?;
    serde_json::from_slice(&content).map_err(|e| Error::InvalidDump {
        path: root.to_path_buf(),
        reason: format!("corrupt {:?}: {}", path, e),
    })
}

/// Writes a dump directory
pub struct DumpWriter {
    root: PathBuf,
}

impl DumpWriter {
    /// Create a fresh, uniquely named dump root under `dump_dir`
    pub fn create(dump_dir: &Path) -> Result<Self> {
        let root = dump_dir.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write an entry and its manifest
    pub fn write_entry(&self, entry: &DumpEntry, manifest: &[ManifestEntry]) -> Result<()> {
        let dir = self.root.join(entry.id.as_str());
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(ENTRY_METADATA_FILE), entry)?;
        if !manifest.is_empty() {
            write_json(&dir.join(ENTRY_FILES_FILE), &manifest)?;
        }
        Ok(())
    }

    /// Seal the dump
    pub fn finish(self, metadata: &DumpMetadata) -> Result<PathBuf> {
        write_json(&self.root.join(DUMP_METADATA_FILE), metadata)?;
        Ok(self.root)
    }
}

/// Reads a sealed dump directory
pub struct DumpReader {
    root: PathBuf,
    metadata: DumpMetadata,
}

impl DumpReader {
    pub fn open(root: &Path) -> Result<Self> {
        let metadata_path = root.join(DUMP_METADATA_FILE);
        if !metadata_path.exists() {
            return Err(Error::InvalidDump {
                path: root.to_path_buf(),
                reason: format!("missing {}", DUMP_METADATA_FILE),
            });
        }
        let metadata: DumpMetadata = read_json(&metadata_path, root)?;
        if metadata.version > DUMP_FORMAT_VERSION {
            return Err(Error::InvalidDump {
                path: root.to_path_buf(),
                reason: format!("unsupported dump version {}", metadata.version),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            metadata,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &DumpMetadata {
        &self.metadata
    }

    /// Entry directory names in ascending numeric order
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() && is_numeric_name(&name) {
                names.push(name);
            }
        }
        sort_numeric(&mut names);
        Ok(names)
    }

    /// Read one entry with its manifest
    pub fn read_entry(&self, name: &str) -> Result<(DumpEntry, Vec<ManifestEntry>)> {
        let dir = self.root.join(name);
        let entry: DumpEntry = read_json(&dir.join(ENTRY_METADATA_FILE), &self.root)?;
        let files_path = dir.join(ENTRY_FILES_FILE);
        let manifest = if files_path.exists() {
            read_json(&files_path, &self.root)?
        } else {
            Vec::new()
        };
        Ok((entry, manifest))
    }

    /// Every entry, in order
    pub fn entries(&self) -> Result<Vec<(DumpEntry, Vec<ManifestEntry>)>> {
        self.entry_names()?
            .iter()
            .map(|name| self.read_entry(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: u64) -> DumpEntry {
        DumpEntry {
            id: EventId::from(id),
            db: "db".into(),
            event_type: Some(EventType::DropTable),
            ops: vec![DumpOp::DropTable { table: format!("t{}", id) }],
        }
    }

    fn metadata() -> DumpMetadata {
        DumpMetadata {
            version: DUMP_FORMAT_VERSION,
            dump_type: DumpType::Incremental,
            from_id: Some(EventId::from(1)),
            to_id: EventId::from(100),
            databases: vec!["db".into()],
            table: None,
            metadata_only: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_entries_read_in_numeric_order() {
        let dir = tempdir().unwrap();
        let writer = DumpWriter::create(dir.path()).unwrap();
        for id in [100, 5, 20] {
            writer.write_entry(&entry(id), &[]).unwrap();
        }
        let root = writer.finish(&metadata()).unwrap();

        let reader = DumpReader::open(&root).unwrap();
        assert_eq!(reader.entry_names().unwrap(), vec!["5", "20", "100"]);
        let ids: Vec<String> = reader
            .entries()
            .unwrap()
            .into_iter()
            .map(|(e, _)| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["5", "20", "100"]);
        assert_eq!(reader.metadata().to_id, EventId::from(100));
    }

    #[test]
    fn test_unsealed_dump_is_invalid() {
        let dir = tempdir().unwrap();
        let writer = DumpWriter::create(dir.path()).unwrap();
        writer.write_entry(&entry(1), &[]).unwrap();

        let err = DumpReader::open(writer.root()).err().unwrap();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidDump);
    }

    #[test]
    fn test_op_objects() {
        let op = DumpOp::WriteData {
            table: "t".into(),
            partition: Some(PartitionSpec::new(&[("b", "1")])),
            mode: WriteMode::Append,
            files: vec![],
        };
        assert!(matches!(op.object("db"), ObjectRef::Partition { .. }));
        assert_eq!(op.table_name(), Some("t"));
        assert!(!op.is_barrier());

        let rename = DumpOp::RenameTable {
            from: "a".into(),
            to: "b".into(),
            table: crate::catalog::Table {
                db: "db".into(),
                name: "b".into(),
                kind: crate::catalog::TableKind::Managed,
                columns: vec![],
                partition_keys: vec![],
                location: PathBuf::new(),
                view_text: None,
                properties: Default::default(),
            },
        };
        assert_eq!(rename.object("db"), ObjectRef::table("db", "b"));
        assert!(rename.is_barrier());
    }
}
