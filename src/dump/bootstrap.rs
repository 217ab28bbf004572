//! Bootstrap Dump
//!
//! Walks databases, tables, partitions and functions as they are now. The
//! walk races with source mutations: an object that disappears between
//! being listed and being fetched is left out of the dump, since the
//! incremental dump that follows carries its drop.

use std::path::Path;

use chrono::Utc;

use super::layout::{DumpEntry, DumpMetadata, DumpOp, DumpType, DumpWriter, FileSource, ManifestEntry, WriteMode, DUMP_FORMAT_VERSION};
use super::{DumpPlanner, DumpRequest, DumpResult};
use crate::catalog::{Database, HasProperties, Lookup, PartitionSpec, Table};
use crate::error::{Error, Result};
use crate::event::{EventId, NamePattern};
use crate::warehouse::files::{file_ref, list_data_files};

/// Entries written so far, numbered from 1
struct Ordinals(u64);

impl Ordinals {
    fn next(&mut self) -> EventId {
        self.0 += 1;
        EventId::from(self.0)
    }
}

impl DumpPlanner {
    pub(super) async fn dump_bootstrap(
        &self,
        databases: &[Database],
        table: Option<&NamePattern>,
        request: &DumpRequest,
    ) -> Result<DumpResult> {
        // Events after this id are replayed by the next incremental dump
        let to_id = self.log.current_id().await?;
        let writer = DumpWriter::create(&self.dump_dir)?;
        let mut ordinals = Ordinals(0);

        tracing::info!(
            "Bootstrap dump of {} database(s) into {}",
            databases.len(),
            writer.root().display()
        );

        for database in databases {
            let entry = DumpEntry {
                id: ordinals.next(),
                db: database.name.clone(),
                event_type: None,
                ops: vec![DumpOp::CreateDatabase {
                    database: database.without_replication_properties(),
                }],
            };
            writer.write_entry(&entry, &[])?;

            for name in self.catalog.list_tables(&database.name).await? {
                if !table.map_or(true, |p| p.matches(&name)) {
                    continue;
                }
                let Some((ops, manifest)) = self
                    .dump_table(&database.name, &name, request.metadata_only)
                    .await?
                else {
                    continue;
                };
                let entry = DumpEntry {
                    id: ordinals.next(),
                    db: database.name.clone(),
                    event_type: None,
                    ops,
                };
                writer.write_entry(&entry, &manifest)?;
            }

            if table.is_none() {
                self.dump_functions(database, &writer, &mut ordinals, request.metadata_only)
                    .await?;
            }
        }

        let metadata = DumpMetadata {
            version: DUMP_FORMAT_VERSION,
            dump_type: DumpType::Bootstrap,
            from_id: None,
            to_id: to_id.clone(),
            databases: databases.iter().map(|d| d.name.clone()).collect(),
            table: request.table.clone(),
            metadata_only: request.metadata_only,
            created_at: Utc::now(),
        };
        let dump_root = writer.finish(&metadata)?;

        Ok(DumpResult {
            dump_root,
            last_event_id: to_id,
        })
    }

    /// Ops and manifest for one table; None if it was dropped concurrently
    async fn dump_table(
        &self,
        db: &str,
        name: &str,
        metadata_only: bool,
    ) -> Result<Option<(Vec<DumpOp>, Vec<ManifestEntry>)>> {
        let table = match self.catalog.get_table(db, name).await? {
            Lookup::Found(t) => t.without_replication_properties(),
            Lookup::NotFound => {
                tracing::warn!("Table {}.{} dropped during bootstrap dump, skipping", db, name);
                return Ok(None);
            }
        };

        let mut ops = vec![DumpOp::CreateTable {
            table: table.clone(),
        }];
        let mut manifest = Vec::new();

        if table.is_view() {
            return Ok(Some((ops, manifest)));
        }

        if !table.is_partitioned() {
            if !metadata_only {
                if !table.location.is_dir() {
                    return self.missing_table_dir(&table).await;
                }
                let files = snapshot_files(&table.location, &table.name, None)?;
                ops.push(write_op(&table.name, None, &files));
                manifest.extend(files);
            }
            return Ok(Some((ops, manifest)));
        }

        for spec in self.catalog.list_partition_specs(db, name).await? {
            let partition = match self.catalog.get_partition(db, name, &spec).await? {
                Lookup::Found(p) => p.without_replication_properties(),
                Lookup::NotFound => {
                    tracing::warn!(
                        "Partition {}.{}{} dropped during bootstrap dump, skipping",
                        db,
                        name,
                        spec
                    );
                    continue;
                }
            };

            let files = if metadata_only {
                None
            } else if partition.location.is_dir() {
                Some(snapshot_files(&partition.location, &table.name, Some(&spec))?)
            } else if self.catalog.get_partition(db, name, &spec).await?.is_found() {
                return Err(Error::DataDirMissing {
                    object: format!("partition {}{}", table.qualified_name(), spec),
                    path: partition.location.clone(),
                });
            } else {
                continue;
            };

            ops.push(DumpOp::AddPartition {
                table: table.name.clone(),
                partition,
            });
            if let Some(files) = files {
                ops.push(write_op(&table.name, Some(&spec), &files));
                manifest.extend(files);
            }
        }

        Ok(Some((ops, manifest)))
    }

    /// A table whose directory vanished is only tolerated if the table did too
    async fn missing_table_dir(
        &self,
        table: &Table,
    ) -> Result<Option<(Vec<DumpOp>, Vec<ManifestEntry>)>> {
        match self.catalog.get_table(&table.db, &table.name).await? {
            Lookup::NotFound => {
                tracing::warn!(
                    "Table {} dropped during bootstrap dump, skipping",
                    table.qualified_name()
                );
                Ok(None)
            }
            Lookup::Found(_) => Err(Error::DataDirMissing {
                object: format!("table {}", table.qualified_name()),
                path: table.location.clone(),
            }),
        }
    }

    async fn dump_functions(
        &self,
        database: &Database,
        writer: &DumpWriter,
        ordinals: &mut Ordinals,
        metadata_only: bool,
    ) -> Result<()> {
        for name in self.catalog.list_functions(&database.name).await? {
            let function = match self.catalog.get_function(&database.name, &name).await? {
                Lookup::Found(f) => f.without_replication_properties(),
                Lookup::NotFound => continue,
            };

            let mut manifest = Vec::new();
            if !metadata_only {
                for resource in &function.resources {
                    let file = file_ref(&resource.uri)?;
                    manifest.push(self.resolve_file(&file, None, None).await?);
                }
            }

            let entry = DumpEntry {
                id: ordinals.next(),
                db: database.name.clone(),
                event_type: None,
                ops: vec![DumpOp::CreateFunction {
                    resources: manifest.iter().map(|m| m.name.clone()).collect(),
                    function,
                }],
            };
            writer.write_entry(&entry, &manifest)?;
        }
        Ok(())
    }
}

fn write_op(table: &str, partition: Option<&PartitionSpec>, files: &[ManifestEntry]) -> DumpOp {
    DumpOp::WriteData {
        table: table.to_string(),
        partition: partition.cloned(),
        mode: WriteMode::Replace,
        files: files.iter().map(|f| f.name.clone()).collect(),
    }
}

/// Current data files of a directory; files removed mid-walk are skipped
fn snapshot_files(
    dir: &Path,
    table: &str,
    partition: Option<&PartitionSpec>,
) -> Result<Vec<ManifestEntry>> {
    let mut manifest = Vec::new();
    for path in list_data_files(dir)? {
        let file = match file_ref(&path) {
            Ok(file) => file,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("Data file {:?} removed during bootstrap dump", path);
                continue;
            }
            Err(e) => return Err(e),
        };
        manifest.push(ManifestEntry {
            name: file.name,
            table: Some(table.to_string()),
            partition: partition.cloned(),
            original_path: file.path,
            checksum: file.checksum,
            size: file.size,
            source: FileSource::Original,
        });
    }
    Ok(manifest)
}
