//! Dump Planner
//!
//! Writes a self-describing dump directory for one or more source
//! databases. Without a starting event id the dump is a bootstrap: a walk
//! of the current catalog. With one, it is incremental: a replay of the
//! filtered notification log from that id.

pub mod bootstrap;
pub mod incremental;
pub mod layout;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{is_replication_source, Catalog, Database, Lookup, PartitionSpec};
use crate::cm::{checksum_file, ChangeManager};
use crate::error::{Error, Result};
use crate::event::{EventId, FileRef, NamePattern, NotificationLog};

pub use layout::{
    DumpEntry, DumpMetadata, DumpOp, DumpReader, DumpType, DumpWriter, FileSource, ManifestEntry,
    WriteMode,
};

/// What to dump
#[derive(Debug, Clone, Default)]
pub struct DumpRequest {
    /// Database name or pattern (`*` wildcards, `|` alternatives)
    pub db_pattern: String,
    /// Restrict to matching tables
    pub table: Option<String>,
    /// Last event already replicated; None dumps a bootstrap
    pub from: Option<EventId>,
    /// Inclusive upper bound; defaults to the newest event at dump start
    pub to: Option<EventId>,
    /// Maximum number of events to dump
    pub limit: Option<usize>,
    /// Skip data manifests and movement
    pub metadata_only: bool,
}

/// Outcome of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpResult {
    pub dump_root: PathBuf,
    /// Resume point for the next incremental dump
    pub last_event_id: EventId,
}

/// Produces dump directories from the source catalog and event log
pub struct DumpPlanner {
    catalog: Arc<dyn Catalog>,
    log: Arc<dyn NotificationLog>,
    cm: Option<Arc<ChangeManager>>,
    dump_dir: PathBuf,
    message_format: String,
    fetch_batch_size: usize,
}

impl DumpPlanner {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        log: Arc<dyn NotificationLog>,
        cm: Option<Arc<ChangeManager>>,
        dump_dir: PathBuf,
        message_format: String,
        fetch_batch_size: usize,
    ) -> Self {
        Self {
            catalog,
            log,
            cm,
            dump_dir,
            message_format,
            fetch_batch_size,
        }
    }

    /// Write a dump for `request`
    pub async fn dump(&self, request: &DumpRequest) -> Result<DumpResult> {
        let databases = self.source_databases(&request.db_pattern).await?;
        let table = request.table.as_deref().map(NamePattern::parse);

        let result = match &request.from {
            None => self.dump_bootstrap(&databases, table.as_ref(), request).await?,
            Some(from) => {
                self.dump_incremental(&databases, table, from, request)
                    .await?
            }
        };

        tracing::info!(
            dump_root = %result.dump_root.display(),
            last_event_id = %result.last_event_id,
            "Dump of {} complete",
            request.db_pattern
        );
        Ok(result)
    }

    /// Databases matching the pattern that are a source of replication
    async fn source_databases(&self, pattern: &str) -> Result<Vec<Database>> {
        let names = NamePattern::parse(pattern);

        if let Some(name) = names.as_literal() {
            return match self.catalog.get_database(name).await? {
                Lookup::Found(db) if is_replication_source(&db.properties) => Ok(vec![db]),
                Lookup::Found(_) => Err(Error::NotReplicationSource(name.to_string())),
                Lookup::NotFound => Err(Error::NotFound(format!("database {}", name))),
            };
        }

        let mut databases = Vec::new();
        for name in self.catalog.list_databases().await? {
            if !names.matches(&name) {
                continue;
            }
            match self.catalog.get_database(&name).await? {
                Lookup::Found(db) if is_replication_source(&db.properties) => databases.push(db),
                Lookup::Found(_) => {
                    tracing::warn!("Skipping database {}: not a source of replication", name)
                }
                Lookup::NotFound => {}
            }
        }

        if databases.is_empty() {
            return Err(Error::NotReplicationSource(pattern.to_string()));
        }
        Ok(databases)
    }

    /// Locate a file's content for the manifest: original path first, then CM
    async fn resolve_file(
        &self,
        file: &FileRef,
        table: Option<&str>,
        partition: Option<&PartitionSpec>,
    ) -> Result<ManifestEntry> {
        let source = if original_matches(&file.path, &file.checksum) {
            FileSource::Original
        } else {
            let found = match &self.cm {
                Some(cm) => cm.resolve(&file.checksum, &file.path).await?,
                None => None,
            };
            match found {
                Some(entry) => FileSource::Cm {
                    path: entry.recycled_path,
                },
                None => {
                    tracing::warn!(
                        file = %file.name,
                        checksum = %file.checksum,
                        "File is missing from its original path and the CM store, load will fail"
                    );
                    FileSource::Missing
                }
            }
        };

        Ok(ManifestEntry {
            name: file.name.clone(),
            table: table.map(str::to_string),
            partition: partition.cloned(),
            original_path: file.path.clone(),
            checksum: file.checksum.clone(),
            size: file.size,
            source,
        })
    }
}

fn original_matches(path: &Path, checksum: &str) -> bool {
    path.is_file() && checksum_file(path).map(|c| c == checksum).unwrap_or(false)
}

