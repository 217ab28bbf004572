//! Operation Applier
//!
//! Applies dump operations to the replica. Every operation is idempotent:
//! creating an object that already exists with the same definition, dropping
//! an absent one or renaming to a name that is already in place are no-ops.
//! Incoming definitions are rewritten to the target database name and the
//! replica's own locations, and never carry replication bookkeeping.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{
    is_replication_key, normalize, Catalog, Database, Function, HasProperties, Lookup, Partition,
    PartitionSpec, Properties, ResourceUri, Table,
};
use crate::dump::{DumpOp, ManifestEntry, WriteMode};
use crate::error::{Error, Result};
use crate::warehouse::files::list_data_files;

use super::mover::{remove_if_present, DataMover};

/// Directory under the replica root holding function resources
const FUNCTION_RESOURCE_DIR: &str = "_functions";

/// Replica-side executor of dump operations
pub struct Applier {
    catalog: Arc<dyn Catalog>,
    root: PathBuf,
    mover: DataMover,
}

/// Carry the replica's own bookkeeping over to an incoming definition
fn keep_replication_properties(existing: &Properties, incoming: &mut Properties) {
    for (k, v) in existing {
        if is_replication_key(k) {
            incoming.insert(k.clone(), v.clone());
        }
    }
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Rename a directory unless it already moved
fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if from.as_os_str().is_empty() || !from.exists() || to.exists() {
        return Ok(());
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)?;
    Ok(())
}

impl Applier {
    pub fn new(catalog: Arc<dyn Catalog>, root: PathBuf, mover: DataMover) -> Self {
        Self {
            catalog,
            root,
            mover,
        }
    }

    pub fn mover(&self) -> &DataMover {
        &self.mover
    }

    fn database_location(&self, db: &str) -> PathBuf {
        self.root.join(format!("{}.db", normalize(db)))
    }

    fn function_dir(&self, db: &str, name: &str) -> PathBuf {
        self.root
            .join(FUNCTION_RESOURCE_DIR)
            .join(normalize(db))
            .join(normalize(name))
    }

    /// Incoming table rewritten into database `db` of the replica
    fn local_table(&self, db: &str, table: &Table) -> Table {
        let mut local = table.without_replication_properties();
        local.db = normalize(db);
        local.location = if table.is_view() {
            PathBuf::new()
        } else {
            self.database_location(db).join(&local.name)
        };
        local
    }

    fn local_partition(&self, table: &Table, partition: &Partition) -> Partition {
        let mut local = partition.without_replication_properties();
        local.db = table.db.clone();
        local.table = table.name.clone();
        local.location = table.location.join(partition.spec.to_path_name());
        local
    }

    async fn require_table(&self, db: &str, name: &str) -> Result<Table> {
        self.catalog
            .get_table(db, name)
            .await?
            .found()
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", db, name)))
    }

    /// Apply one operation to database `db`
    pub async fn apply(
        &self,
        db: &str,
        op: &DumpOp,
        manifest: &[ManifestEntry],
        metadata_only: bool,
    ) -> Result<()> {
        match op {
            DumpOp::CreateDatabase { database } | DumpOp::AlterDatabase { database } => {
                self.upsert_database(db, database).await
            }
            DumpOp::CreateTable { table } | DumpOp::AlterTable { table } => {
                self.upsert_table(db, table).await
            }
            DumpOp::DropTable { table } => self.drop_table(db, table).await,
            DumpOp::RenameTable { from, to, table } => self.rename_table(db, from, to, table).await,
            DumpOp::AddPartition { table, partition } => {
                self.add_partition(db, table, partition).await
            }
            DumpOp::AlterPartition { table, partition } => {
                self.alter_partition(db, table, partition).await
            }
            DumpOp::DropPartition { table, spec } => self.drop_partition(db, table, spec).await,
            DumpOp::RenamePartition { table, from, to } => {
                self.rename_partition(db, table, from, to).await
            }
            DumpOp::WriteData {
                table,
                partition,
                mode,
                files,
            } => {
                if metadata_only {
                    return Ok(());
                }
                self.write_data(db, table, partition.as_ref(), *mode, files, manifest)
                    .await
            }
            DumpOp::Truncate { table, partition } => {
                self.truncate(db, table, partition.as_ref()).await
            }
            DumpOp::CreateFunction {
                function,
                resources,
            } => {
                self.create_function(db, function, resources, manifest, metadata_only)
                    .await
            }
            DumpOp::DropFunction { name } => self.drop_function(db, name).await,
        }
    }

    async fn upsert_database(&self, db: &str, incoming: &Database) -> Result<()> {
        let mut local = incoming.without_replication_properties();
        local.name = normalize(db);
        local.location = self.database_location(db);

        match self.catalog.get_database(db).await? {
            Lookup::Found(existing) => {
                keep_replication_properties(&existing.properties, &mut local.properties);
                local.location = existing.location.clone();
                if existing != local {
                    self.catalog.alter_database(&local).await?;
                }
            }
            Lookup::NotFound => {
                fs::create_dir_all(&local.location)?;
                self.catalog.create_database(&local).await?;
            }
        }
        Ok(())
    }

    async fn upsert_table(&self, db: &str, incoming: &Table) -> Result<()> {
        let mut local = self.local_table(db, incoming);

        match self.catalog.get_table(db, &local.name).await? {
            Lookup::Found(existing) => {
                if existing.same_definition(&local) {
                    return Ok(());
                }
                keep_replication_properties(&existing.properties, &mut local.properties);
                self.catalog.alter_table(db, &local.name, &local).await?;
            }
            Lookup::NotFound => {
                if !local.is_view() {
                    fs::create_dir_all(&local.location)?;
                }
                self.catalog.create_table(&local).await?;
            }
        }
        Ok(())
    }

    async fn drop_table(&self, db: &str, name: &str) -> Result<()> {
        let Lookup::Found(table) = self.catalog.get_table(db, name).await? else {
            return Ok(());
        };
        self.catalog.drop_table(db, name).await?;
        if !table.is_view() {
            remove_dir_if_present(&table.location)?;
        }
        Ok(())
    }

    async fn rename_table(&self, db: &str, from: &str, to: &str, incoming: &Table) -> Result<()> {
        let old = match self.catalog.get_table(db, from).await? {
            Lookup::Found(old) => old,
            Lookup::NotFound => {
                if self.catalog.get_table(db, to).await?.is_found() {
                    return Ok(());
                }
                return Err(Error::NotFound(format!(
                    "table {}.{} to rename to {}",
                    db, from, to
                )));
            }
        };

        let mut renamed = self.local_table(db, incoming);
        renamed.name = normalize(to);
        if !renamed.is_view() {
            renamed.location = self.database_location(db).join(&renamed.name);
        }
        keep_replication_properties(&old.properties, &mut renamed.properties);

        // Files first: a rerun after a crash finds the catalog still at `from`
        if !old.is_view() {
            move_dir(&old.location, &renamed.location)?;
        }
        self.catalog.alter_table(db, from, &renamed).await
    }

    async fn add_partition(&self, db: &str, table: &str, incoming: &Partition) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let local = self.local_partition(&table, incoming);
        if self
            .catalog
            .get_partition(db, &table.name, &local.spec)
            .await?
            .is_found()
        {
            return Ok(());
        }
        fs::create_dir_all(&local.location)?;
        self.catalog.add_partition(&local).await
    }

    async fn alter_partition(&self, db: &str, table: &str, incoming: &Partition) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let mut local = self.local_partition(&table, incoming);
        match self.catalog.get_partition(db, &table.name, &local.spec).await? {
            Lookup::Found(existing) => {
                keep_replication_properties(&existing.properties, &mut local.properties);
                if existing == local {
                    return Ok(());
                }
                self.catalog
                    .alter_partition(db, &table.name, &local.spec, &local)
                    .await
            }
            Lookup::NotFound => {
                fs::create_dir_all(&local.location)?;
                self.catalog.add_partition(&local).await
            }
        }
    }

    async fn drop_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<()> {
        let Lookup::Found(partition) = self.catalog.get_partition(db, table, spec).await? else {
            return Ok(());
        };
        self.catalog.drop_partition(db, table, spec).await?;
        remove_dir_if_present(&partition.location)
    }

    async fn rename_partition(
        &self,
        db: &str,
        table: &str,
        from: &PartitionSpec,
        to: &PartitionSpec,
    ) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let old = match self.catalog.get_partition(db, &table.name, from).await? {
            Lookup::Found(old) => old,
            Lookup::NotFound => {
                if self.catalog.get_partition(db, &table.name, to).await?.is_found() {
                    return Ok(());
                }
                return Err(Error::NotFound(format!(
                    "partition {}{} to rename to {}",
                    table.qualified_name(),
                    from,
                    to
                )));
            }
        };

        let mut renamed = old.clone();
        renamed.spec = to.clone();
        renamed.location = table.location.join(to.to_path_name());

        move_dir(&old.location, &renamed.location)?;
        self.catalog
            .alter_partition(db, &table.name, from, &renamed)
            .await
    }

    async fn data_dir(&self, db: &str, table: &str, partition: Option<&PartitionSpec>) -> Result<PathBuf> {
        let table = self.require_table(db, table).await?;
        match partition {
            None => Ok(table.location),
            Some(spec) => self
                .catalog
                .get_partition(db, &table.name, spec)
                .await?
                .found()
                .map(|p| p.location)
                .ok_or_else(|| {
                    Error::NotFound(format!("partition {}{}", table.qualified_name(), spec))
                }),
        }
    }

    async fn write_data(
        &self,
        db: &str,
        table: &str,
        partition: Option<&PartitionSpec>,
        mode: WriteMode,
        files: &[String],
        manifest: &[ManifestEntry],
    ) -> Result<()> {
        let dir = self.data_dir(db, table, partition).await?;
        let wanted = files
            .iter()
            .map(|name| {
                manifest
                    .iter()
                    .find(|m| {
                        m.name == *name
                            && m.table.as_deref().map(normalize) == Some(normalize(table))
                            && m.partition.as_ref() == partition
                    })
                    .ok_or_else(|| Error::InvalidDump {
                        path: dir.clone(),
                        reason: format!("file {} of {} missing from the manifest", name, table),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        self.mover.write(&dir, &wanted, mode).await?;
        Ok(())
    }

    async fn truncate(&self, db: &str, table: &str, partition: Option<&PartitionSpec>) -> Result<()> {
        let mut dirs = Vec::new();
        match partition {
            Some(spec) => dirs.push(self.data_dir(db, table, Some(spec)).await?),
            None => {
                let table = self.require_table(db, table).await?;
                for spec in self.catalog.list_partition_specs(db, &table.name).await? {
                    if let Lookup::Found(p) = self.catalog.get_partition(db, &table.name, &spec).await? {
                        dirs.push(p.location);
                    }
                }
                dirs.push(table.location);
            }
        }
        for dir in dirs {
            for file in list_data_files(&dir)? {
                remove_if_present(&file)?;
            }
        }
        Ok(())
    }

    async fn create_function(
        &self,
        db: &str,
        incoming: &Function,
        resources: &[String],
        manifest: &[ManifestEntry],
        metadata_only: bool,
    ) -> Result<()> {
        let dir = self.function_dir(db, &incoming.name);
        let mut local = incoming.without_replication_properties();
        local.db = normalize(db);
        local.resources = incoming
            .resources
            .iter()
            .map(|r| ResourceUri {
                kind: r.kind,
                uri: r
                    .uri
                    .file_name()
                    .map(|name| dir.join(name))
                    .unwrap_or_else(|| dir.clone()),
            })
            .collect();

        if !metadata_only && !resources.is_empty() {
            let files = resources
                .iter()
                .map(|name| {
                    manifest
                        .iter()
                        .find(|m| m.table.is_none() && m.name == *name)
                        .ok_or_else(|| Error::InvalidDump {
                            path: dir.clone(),
                            reason: format!("resource {} missing from the manifest", name),
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            self.mover.write(&dir, &files, WriteMode::Replace).await?;
        }

        match self.catalog.get_function(db, &local.name).await? {
            Lookup::Found(existing) if existing.same_definition(&local) => Ok(()),
            Lookup::Found(_) => {
                self.catalog.drop_function(db, &local.name).await?;
                self.catalog.create_function(&local).await
            }
            Lookup::NotFound => self.catalog.create_function(&local).await,
        }
    }

    async fn drop_function(&self, db: &str, name: &str) -> Result<()> {
        if self.catalog.drop_function(db, name).await? {
            remove_dir_if_present(&self.function_dir(db, name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, SqliteCatalog, TableKind};
    use tempfile::{tempdir, TempDir};

    fn applier(dir: &TempDir) -> Applier {
        let catalog = Arc::new(SqliteCatalog::open(&dir.path().join("replica.db")).unwrap());
        let root = dir.path().join("replica");
        let mover = DataMover::new(root.join(".staging"), None, false);
        Applier::new(catalog, root, mover)
    }

    fn source_table(name: &str) -> Table {
        let mut properties = Properties::new();
        properties.insert("owner".into(), "etl".into());
        Table {
            db: "src".into(),
            name: name.into(),
            kind: TableKind::Managed,
            columns: vec![Column::new("a", "string")],
            partition_keys: vec![Column::new("b", "int")],
            location: PathBuf::from("/source/src.db").join(name),
            view_text: None,
            properties,
        }
    }

    async fn with_database(a: &Applier) {
        let mut db = Database::new("src", PathBuf::from("/source/src.db"));
        db.properties
            .insert(crate::catalog::SOURCE_OF_REPLICATION.into(), "policy".into());
        a.apply("replica", &DumpOp::CreateDatabase { database: db }, &[], false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_is_rewritten_and_idempotent() {
        let dir = tempdir().unwrap();
        let a = applier(&dir);
        with_database(&a).await;

        let db = a.catalog.get_database("replica").await.unwrap().found().unwrap();
        assert!(!crate::catalog::is_replication_source(&db.properties));
        assert_eq!(db.location, dir.path().join("replica/replica.db"));

        let op = DumpOp::CreateTable { table: source_table("t") };
        a.apply("replica", &op, &[], false).await.unwrap();
        a.apply("replica", &op, &[], false).await.unwrap();

        let t = a.catalog.get_table("replica", "t").await.unwrap().found().unwrap();
        assert_eq!(t.db, "replica");
        assert_eq!(t.location, dir.path().join("replica/replica.db/t"));
        assert!(t.location.is_dir());
    }

    #[tokio::test]
    async fn test_drop_and_rename_tolerate_replay() {
        let dir = tempdir().unwrap();
        let a = applier(&dir);
        with_database(&a).await;
        a.apply("replica", &DumpOp::CreateTable { table: source_table("t") }, &[], false)
            .await
            .unwrap();

        let rename = DumpOp::RenameTable {
            from: "t".into(),
            to: "t2".into(),
            table: source_table("t2"),
        };
        a.apply("replica", &rename, &[], false).await.unwrap();
        a.apply("replica", &rename, &[], false).await.unwrap();
        let t2 = a.catalog.get_table("replica", "t2").await.unwrap().found().unwrap();
        assert!(t2.location.ends_with("t2"));
        assert!(t2.location.is_dir());
        assert!(!a.catalog.get_table("replica", "t").await.unwrap().is_found());

        let drop = DumpOp::DropTable { table: "t2".into() };
        a.apply("replica", &drop, &[], false).await.unwrap();
        a.apply("replica", &drop, &[], false).await.unwrap();
        assert!(!t2.location.exists());
    }

    #[tokio::test]
    async fn test_partition_ops_are_idempotent() {
        let dir = tempdir().unwrap();
        let a = applier(&dir);
        with_database(&a).await;
        a.apply("replica", &DumpOp::CreateTable { table: source_table("p") }, &[], false)
            .await
            .unwrap();

        let spec = PartitionSpec::new(&[("b", "1")]);
        let add = DumpOp::AddPartition {
            table: "p".into(),
            partition: Partition {
                db: "src".into(),
                table: "p".into(),
                spec: spec.clone(),
                location: PathBuf::from("/source/elsewhere"),
                properties: Properties::new(),
            },
        };
        a.apply("replica", &add, &[], false).await.unwrap();
        a.apply("replica", &add, &[], false).await.unwrap();

        let to = PartitionSpec::new(&[("b", "2")]);
        let rename = DumpOp::RenamePartition {
            table: "p".into(),
            from: spec.clone(),
            to: to.clone(),
        };
        a.apply("replica", &rename, &[], false).await.unwrap();
        a.apply("replica", &rename, &[], false).await.unwrap();

        let renamed = a
            .catalog
            .get_partition("replica", "p", &to)
            .await
            .unwrap()
            .found()
            .unwrap();
        assert!(renamed.location.ends_with(to.to_path_name()));
        assert!(renamed.location.is_dir());
        assert_eq!(a.catalog.list_partition_specs("replica", "p").await.unwrap(), vec![to]);
    }
}
