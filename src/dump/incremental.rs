//! Incremental Dump
//!
//! Translates the filtered event range after `from` into dump entries, one
//! per event, named by event id.

use std::collections::HashSet;

use chrono::Utc;

use super::layout::{DumpEntry, DumpMetadata, DumpOp, DumpType, DumpWriter, ManifestEntry, WriteMode, DUMP_FORMAT_VERSION};
use super::{DumpPlanner, DumpRequest, DumpResult};
use crate::catalog::{Database, HasProperties, PartitionSpec};
use crate::error::Result;
use crate::event::{EventId, EventMessage, EventRequest, EventSource, FileRef, NamePattern, ReplicationEvent};

/// Partitions added earlier in the same dump: (db, table, spec)
type AddedPartitions = HashSet<(String, String, PartitionSpec)>;

impl DumpPlanner {
    pub(super) async fn dump_incremental(
        &self,
        databases: &[Database],
        table: Option<NamePattern>,
        from: &EventId,
        request: &DumpRequest,
    ) -> Result<DumpResult> {
        let head = self.log.current_id().await?;
        let to = request.to.clone().unwrap_or(head);

        let names: Vec<&str> = databases.iter().map(|d| d.name.as_str()).collect();
        let mut source = EventSource::new(
            self.log.clone(),
            EventRequest {
                db: NamePattern::parse(&names.join("|")),
                table,
                after: from.clone(),
                to: Some(to.clone()),
                message_format: self.message_format.clone(),
                batch_size: self.fetch_batch_size,
            },
        );

        let writer = DumpWriter::create(&self.dump_dir)?;
        let mut added = AddedPartitions::new();
        let mut emitted = 0usize;
        let mut last_emitted: Option<EventId> = None;
        let mut truncated = false;

        tracing::info!(
            "Incremental dump of events ({}, {}] into {}",
            from,
            to,
            writer.root().display()
        );

        loop {
            if request.limit.map_or(false, |limit| emitted >= limit) {
                truncated = true;
                break;
            }
            let Some(event) = source.next().await? else {
                break;
            };

            let (ops, manifest) = self
                .translate(&event, &mut added, request.metadata_only)
                .await?;
            let entry = DumpEntry {
                id: event.id.clone(),
                db: event.db.clone(),
                event_type: Some(event.event_type),
                ops,
            };
            writer.write_entry(&entry, &manifest)?;

            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Dumped event");
            emitted += 1;
            last_emitted = Some(event.id);
        }

        // A LIMIT stops the dump at the last event actually written
        let to_id = if truncated {
            last_emitted.unwrap_or_else(|| from.clone())
        } else {
            to
        };

        let metadata = DumpMetadata {
            version: DUMP_FORMAT_VERSION,
            dump_type: DumpType::Incremental,
            from_id: Some(from.clone()),
            to_id: to_id.clone(),
            databases: databases.iter().map(|d| d.name.clone()).collect(),
            table: request.table.clone(),
            metadata_only: request.metadata_only,
            created_at: Utc::now(),
        };
        let dump_root = writer.finish(&metadata)?;

        tracing::info!("Dumped {} event(s), last event id {}", emitted, to_id);
        Ok(DumpResult {
            dump_root,
            last_event_id: to_id,
        })
    }

    async fn manifest_for(
        &self,
        files: &[FileRef],
        table: Option<&str>,
        partition: Option<&PartitionSpec>,
    ) -> Result<Vec<ManifestEntry>> {
        let mut manifest = Vec::with_capacity(files.len());
        for file in files {
            manifest.push(self.resolve_file(file, table, partition).await?);
        }
        Ok(manifest)
    }

    /// Ops and manifest for one event
    async fn translate(
        &self,
        event: &ReplicationEvent,
        added: &mut AddedPartitions,
        metadata_only: bool,
    ) -> Result<(Vec<DumpOp>, Vec<ManifestEntry>)> {
        let mut manifest = Vec::new();

        let ops = match event.decode()? {
            EventMessage::CreateDatabase { database } => vec![DumpOp::CreateDatabase {
                database: database.without_replication_properties(),
            }],
            EventMessage::AlterDatabase { after, .. } => vec![DumpOp::AlterDatabase {
                database: after.without_replication_properties(),
            }],
            EventMessage::CreateTable { table } => vec![DumpOp::CreateTable {
                table: table.without_replication_properties(),
            }],
            EventMessage::AlterTable { after, .. } => vec![DumpOp::AlterTable {
                table: after.without_replication_properties(),
            }],
            EventMessage::RenameTable { before, after } => vec![DumpOp::RenameTable {
                from: before.name,
                to: after.name.clone(),
                table: after.without_replication_properties(),
            }],
            EventMessage::DropTable { table } => vec![DumpOp::DropTable { table: table.name }],
            EventMessage::AddPartition { table, partitions } => partitions
                .into_iter()
                .map(|p| {
                    added.insert((event.db.clone(), table.name.clone(), p.spec.clone()));
                    DumpOp::AddPartition {
                        table: table.name.clone(),
                        partition: p.without_replication_properties(),
                    }
                })
                .collect(),
            EventMessage::AlterPartition { table, after, .. } => vec![DumpOp::AlterPartition {
                table: table.name,
                partition: after.without_replication_properties(),
            }],
            EventMessage::RenamePartition { table, before, after } => {
                vec![DumpOp::RenamePartition {
                    table: table.name,
                    from: before,
                    to: after.spec,
                }]
            }
            EventMessage::DropPartition { table, specs } => specs
                .into_iter()
                .map(|spec| DumpOp::DropPartition {
                    table: table.name.clone(),
                    spec,
                })
                .collect(),
            EventMessage::Insert {
                table,
                partition,
                files,
                replace,
                partition_created,
            } => {
                let mut ops = Vec::new();
                let spec = partition.as_ref().map(|p| p.spec.clone());

                if let Some(p) = &partition {
                    let key = (event.db.clone(), table.name.clone(), p.spec.clone());
                    if partition_created && !added.contains(&key) {
                        ops.push(DumpOp::AddPartition {
                            table: table.name.clone(),
                            partition: p.without_replication_properties(),
                        });
                        added.insert(key);
                    }
                }

                if !metadata_only {
                    manifest = self.manifest_for(&files, Some(&table.name), spec.as_ref()).await?;
                    ops.push(DumpOp::WriteData {
                        table: table.name.clone(),
                        partition: spec,
                        mode: if replace {
                            WriteMode::Replace
                        } else {
                            WriteMode::Append
                        },
                        files: files.iter().map(|f| f.name.clone()).collect(),
                    });
                }
                ops
            }
            EventMessage::Concatenate {
                table,
                partition,
                files,
            } => {
                let spec = partition.map(|p| p.spec);
                if metadata_only {
                    Vec::new()
                } else {
                    manifest = self.manifest_for(&files, Some(&table.name), spec.as_ref()).await?;
                    vec![DumpOp::WriteData {
                        table: table.name.clone(),
                        partition: spec,
                        mode: WriteMode::Replace,
                        files: files.iter().map(|f| f.name.clone()).collect(),
                    }]
                }
            }
            EventMessage::Truncate { table, partition } => vec![DumpOp::Truncate {
                table: table.name,
                partition,
            }],
            EventMessage::CreateFunction {
                function,
                resources,
            } => {
                if !metadata_only {
                    manifest = self.manifest_for(&resources, None, None).await?;
                }
                vec![DumpOp::CreateFunction {
                    function: function.without_replication_properties(),
                    resources: manifest.iter().map(|m| m.name.clone()).collect(),
                }]
            }
            EventMessage::DropFunction { name, .. } => vec![DumpOp::DropFunction { name }],
        };

        Ok((ops, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::layout::{DumpReader, FileSource};
    use crate::error::ErrorCode;
    use crate::event::EventType;
    use crate::testing::SourceFixture;

    #[tokio::test]
    async fn test_limit_sets_to_id_to_last_emitted() {
        let fx = SourceFixture::new().await;
        let start = fx.head().await;
        fx.wh.create_table("db", "t", &[("a", "string")], &[]).await.unwrap();
        for row in ["1", "2", "3"] {
            fx.wh.insert("db", "t", None, &[row]).await.unwrap();
        }

        let mut request = fx.request(Some(start.clone()));
        request.limit = Some(2);
        let first = fx.planner().dump(&request).await.unwrap();
        assert_eq!(first.last_event_id, start.next().next());

        let entries = DumpReader::open(&first.dump_root).unwrap().entries().unwrap();
        assert_eq!(entries.len(), 2);

        let rest = fx
            .planner()
            .dump(&fx.request(Some(first.last_event_id.clone())))
            .await
            .unwrap();
        assert_eq!(rest.last_event_id, fx.head().await);
        let entries = DumpReader::open(&rest.dump_root).unwrap().entries().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_dynamic_partition_is_not_added_twice() {
        let fx = SourceFixture::new().await;
        fx.wh
            .create_table("db", "ptned", &[("a", "string")], &[("b", "int")])
            .await
            .unwrap();
        let start = fx.head().await;
        let spec = PartitionSpec::new(&[("b", "1")]);
        fx.wh.insert("db", "ptned", Some(&spec), &["one"]).await.unwrap();

        // Whole window: the ADD_PARTITION event is in the dump
        let full = fx.planner().dump(&fx.request(Some(start.clone()))).await.unwrap();
        let entries = DumpReader::open(&full.dump_root).unwrap().entries().unwrap();
        let adds: usize = entries
            .iter()
            .flat_map(|(e, _)| e.ops.iter())
            .filter(|op| matches!(op, DumpOp::AddPartition { .. }))
            .count();
        assert_eq!(adds, 1);

        // Window starting after ADD_PARTITION: the insert synthesizes it
        let late = fx
            .planner()
            .dump(&fx.request(Some(start.next())))
            .await
            .unwrap();
        let entries = DumpReader::open(&late.dump_root).unwrap().entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.event_type, Some(EventType::Insert));
        assert!(matches!(entries[0].0.ops[0], DumpOp::AddPartition { .. }));
        assert!(matches!(entries[0].0.ops[1], DumpOp::WriteData { .. }));
    }

    #[tokio::test]
    async fn test_manifest_falls_back_to_cm_and_records_missing() {
        let fx = SourceFixture::new().await;
        fx.wh.create_table("db", "t", &[("a", "string")], &[]).await.unwrap();
        let start = fx.head().await;
        let kept = fx.wh.insert("db", "t", None, &["ten"]).await.unwrap();
        fx.wh.truncate_table("db", "t").await.unwrap();
        let lost = fx.wh.insert("db", "t", None, &["eleven"]).await.unwrap();
        std::fs::remove_file(&lost.path).unwrap();

        let result = fx.planner().dump(&fx.request(Some(start))).await.unwrap();
        let entries = DumpReader::open(&result.dump_root).unwrap().entries().unwrap();
        let manifests: Vec<&ManifestEntry> = entries.iter().flat_map(|(_, m)| m.iter()).collect();
        assert_eq!(manifests.len(), 2);

        assert_eq!(manifests[0].checksum, kept.checksum);
        assert!(matches!(manifests[0].source, FileSource::Cm { .. }));
        assert_eq!(manifests[1].source, FileSource::Missing);
    }

    #[tokio::test]
    async fn test_retired_range_fails_the_dump() {
        let fx = SourceFixture::new().await;
        fx.wh.create_table("db", "t", &[("a", "string")], &[]).await.unwrap();
        fx.wh.insert("db", "t", None, &["x"]).await.unwrap();
        let head = fx.head().await;
        fx.wh.log().retire_before(&head).await.unwrap();

        let err = fx
            .planner()
            .dump(&fx.request(Some(EventId::from(1))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RetentionGap);
    }
}
