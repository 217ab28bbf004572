//! Source Warehouse
//!
//! The catalog-mutation path of the source cluster. Every mutation updates
//! the catalog, records a notification event, and, for databases that are a
//! source of replication, hands files to the change manager before they
//! become unreachable at their original path.

pub mod files;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::{
    is_replication_source, normalize, Catalog, Column, Database, Function, Lookup, Partition,
    PartitionSpec, Properties, ResourceKind, ResourceUri, SqliteCatalog, Table, TableKind,
    SOURCE_OF_REPLICATION,
};
use crate::cm::{list_files_recursive, ChangeManager};
use crate::config::WharfConfig;
use crate::error::{Error, Result};
use crate::event::{
    EventId, EventMessage, EventType, FileRef, NewEvent, SqliteNotificationLog,
};

pub use files::read_rows;

/// Directory under the warehouse root holding function resources
const FUNCTION_RESOURCE_DIR: &str = "_functions";

/// Source-side warehouse: catalog, notification log and data files
pub struct Warehouse {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
    log: Arc<SqliteNotificationLog>,
    cm: Option<Arc<ChangeManager>>,
    message_format: String,
}

impl Warehouse {
    pub fn new(
        root: PathBuf,
        catalog: Arc<dyn Catalog>,
        log: Arc<SqliteNotificationLog>,
        cm: Option<Arc<ChangeManager>>,
        message_format: String,
    ) -> Self {
        Self {
            root,
            catalog,
            log,
            cm,
            message_format,
        }
    }

    /// Open the source side described by the configuration
    pub fn open(config: &WharfConfig) -> Result<Self> {
        let root = config.source_warehouse_dir();
        fs::create_dir_all(&root)?;

        let catalog = Arc::new(SqliteCatalog::open(&config.source_catalog_path())?);
        let log = Arc::new(SqliteNotificationLog::open(&config.source_events_path())?);
        let cm = if config.cm.enabled {
            Some(Arc::new(ChangeManager::open(
                &config.cm_root(),
                config.cm.retention(),
            )?))
        } else {
            None
        };

        Ok(Self::new(
            root,
            catalog,
            log,
            cm,
            config.source.message_format.clone(),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> Arc<dyn Catalog> {
        self.catalog.clone()
    }

    pub fn log(&self) -> Arc<SqliteNotificationLog> {
        self.log.clone()
    }

    pub fn cm(&self) -> Option<Arc<ChangeManager>> {
        self.cm.clone()
    }

    fn database_location(&self, db: &str) -> PathBuf {
        self.root.join(format!("{}.db", normalize(db)))
    }

    async fn emit(
        &self,
        event_type: EventType,
        db: &str,
        table: Option<&str>,
        partition: Option<&PartitionSpec>,
        message: &EventMessage,
    ) -> Result<EventId> {
        self.log
            .append(NewEvent {
                event_type,
                db: normalize(db),
                table: table.map(normalize),
                partition: partition.cloned(),
                message_format: self.message_format.clone(),
                message: message.encode()?,
            })
            .await
    }

    async fn require_database(&self, db: &str) -> Result<Database> {
        self.catalog
            .get_database(db)
            .await?
            .found()
            .ok_or_else(|| Error::NotFound(format!("database {}", db)))
    }

    async fn require_table(&self, db: &str, table: &str) -> Result<Table> {
        self.catalog
            .get_table(db, table)
            .await?
            .found()
            .ok_or_else(|| Error::NotFound(format!("table {}.{}", db, table)))
    }

    async fn require_partition(&self, table: &Table, spec: &PartitionSpec) -> Result<Partition> {
        self.catalog
            .get_partition(&table.db, &table.name, spec)
            .await?
            .found()
            .ok_or_else(|| {
                Error::NotFound(format!("partition {}{}", table.qualified_name(), spec))
            })
    }

    /// Change manager to use for `db`, if it is a replication source
    async fn cm_for(&self, db: &str) -> Result<Option<Arc<ChangeManager>>> {
        let Some(cm) = &self.cm else {
            return Ok(None);
        };
        match self.catalog.get_database(db).await? {
            Lookup::Found(database) if is_replication_source(&database.properties) => {
                Ok(Some(cm.clone()))
            }
            _ => Ok(None),
        }
    }

    /// Make files unreachable, recycling them first when required
    async fn discard_files(&self, db: &str, files: &[PathBuf]) -> Result<()> {
        let cm = self.cm_for(db).await?;
        for file in files {
            match &cm {
                Some(cm) => {
                    cm.recycle(file).await?;
                }
                None => fs::remove_file(file)?,
            }
        }
        Ok(())
    }

    async fn discard_dir(&self, db: &str, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        match self.cm_for(db).await? {
            Some(cm) => {
                cm.recycle_dir(dir).await?;
            }
            None => fs::remove_dir_all(dir)?,
        }
        Ok(())
    }

    /// Keep a CM copy of every file under `dir` before it moves
    async fn preserve_dir(&self, db: &str, dir: &Path) -> Result<()> {
        if !dir.exists() {
            return Ok(());
        }
        if let Some(cm) = self.cm_for(db).await? {
            for file in list_files_recursive(dir)? {
                cm.preserve(&file).await?;
            }
        }
        Ok(())
    }

    // Databases

    /// Create a database and its directory
    pub async fn create_database(&self, name: &str) -> Result<Database> {
        let database = Database::new(name, self.database_location(name));
        fs::create_dir_all(&database.location)?;
        self.catalog.create_database(&database).await?;

        self.emit(
            EventType::CreateDatabase,
            &database.name,
            None,
            None,
            &EventMessage::CreateDatabase {
                database: database.clone(),
            },
        )
        .await?;

        tracing::info!("Created database {}", database.name);
        Ok(database)
    }

    /// Alter database properties or description
    pub async fn alter_database<F>(&self, name: &str, update: F) -> Result<Database>
    where
        F: FnOnce(&mut Database) + Send,
    {
        let before = self.require_database(name).await?;
        let mut after = before.clone();
        update(&mut after);
        after.name = before.name.clone();
        self.catalog.alter_database(&after).await?;

        self.emit(
            EventType::AlterDatabase,
            &after.name,
            None,
            None,
            &EventMessage::AlterDatabase {
                before,
                after: after.clone(),
            },
        )
        .await?;
        Ok(after)
    }

    /// Mark a database as a source of replication
    pub async fn enable_replication(&self, name: &str, policy: &str) -> Result<Database> {
        let policy = policy.to_string();
        self.alter_database(name, move |db| {
            db.properties.insert(SOURCE_OF_REPLICATION.to_string(), policy);
        })
        .await
    }

    // Tables

    /// Create a managed table
    pub async fn create_table(
        &self,
        db: &str,
        name: &str,
        columns: &[(&str, &str)],
        partition_keys: &[(&str, &str)],
    ) -> Result<Table> {
        let database = self.require_database(db).await?;
        let name = normalize(name);
        let table = Table {
            db: database.name.clone(),
            name: name.clone(),
            kind: TableKind::Managed,
            columns: columns.iter().map(|(n, t)| Column::new(n, t)).collect(),
            partition_keys: partition_keys.iter().map(|(n, t)| Column::new(n, t)).collect(),
            location: database.location.join(&name),
            view_text: None,
            properties: Properties::new(),
        };

        self.catalog.create_table(&table).await?;
        fs::create_dir_all(&table.location)?;

        self.emit(
            EventType::CreateTable,
            &table.db,
            Some(&table.name),
            None,
            &EventMessage::CreateTable {
                table: table.clone(),
            },
        )
        .await?;
        Ok(table)
    }

    /// Create a view
    pub async fn create_view(&self, db: &str, name: &str, query: &str) -> Result<Table> {
        let database = self.require_database(db).await?;
        let view = Table {
            db: database.name,
            name: normalize(name),
            kind: TableKind::View,
            columns: Vec::new(),
            partition_keys: Vec::new(),
            location: PathBuf::new(),
            view_text: Some(query.to_string()),
            properties: Properties::new(),
        };

        self.catalog.create_table(&view).await?;
        self.emit(
            EventType::CreateTable,
            &view.db,
            Some(&view.name),
            None,
            &EventMessage::CreateTable { table: view.clone() },
        )
        .await?;
        Ok(view)
    }

    /// Alter a table definition in place
    pub async fn alter_table<F>(&self, db: &str, name: &str, update: F) -> Result<Table>
    where
        F: FnOnce(&mut Table) + Send,
    {
        let before = self.require_table(db, name).await?;
        let mut after = before.clone();
        update(&mut after);
        after.db = before.db.clone();
        after.name = before.name.clone();
        after.location = before.location.clone();
        self.catalog.alter_table(&before.db, &before.name, &after).await?;

        self.emit(
            EventType::AlterTable,
            &before.db,
            Some(&before.name),
            None,
            &EventMessage::AlterTable {
                before: before.clone(),
                after: after.clone(),
            },
        )
        .await?;
        Ok(after)
    }

    /// Rename a table within its database
    pub async fn rename_table(&self, db: &str, old_name: &str, new_name: &str) -> Result<Table> {
        let before = self.require_table(db, old_name).await?;
        let mut after = before.clone();
        after.name = normalize(new_name);

        if !before.is_view() {
            after.location = self.database_location(db).join(&after.name);
            self.preserve_dir(db, &before.location).await?;
            if before.location.exists() {
                fs::rename(&before.location, &after.location)?;
            }
        }
        if let Err(e) = self.catalog.alter_table(&before.db, &before.name, &after).await {
            if !before.is_view() && after.location.exists() {
                fs::rename(&after.location, &before.location)?;
            }
            return Err(e);
        }

        self.emit(
            EventType::RenameTable,
            &before.db,
            Some(&before.name),
            None,
            &EventMessage::RenameTable {
                before: before.clone(),
                after: after.clone(),
            },
        )
        .await?;
        Ok(after)
    }

    /// Drop a table with all of its partitions and data
    pub async fn drop_table(&self, db: &str, name: &str) -> Result<()> {
        let table = self.require_table(db, name).await?;
        if !table.is_view() {
            self.discard_dir(db, &table.location).await?;
        }
        self.catalog.drop_table(&table.db, &table.name).await?;

        self.emit(
            EventType::DropTable,
            &table.db,
            Some(&table.name),
            None,
            &EventMessage::DropTable {
                table: table.clone(),
            },
        )
        .await?;
        Ok(())
    }

    // Partitions

    fn check_spec(table: &Table, spec: &PartitionSpec) -> Result<()> {
        let keys: Vec<&str> = spec.0.iter().map(|(k, _)| k.as_str()).collect();
        let expected: Vec<&str> = table.partition_keys.iter().map(|c| c.name.as_str()).collect();
        if keys != expected {
            return Err(Error::Catalog(format!(
                "partition spec {} does not match keys {:?} of {}",
                spec,
                expected,
                table.qualified_name()
            )));
        }
        Ok(())
    }

    async fn create_partition(&self, table: &Table, spec: &PartitionSpec) -> Result<Partition> {
        Self::check_spec(table, spec)?;
        let partition = Partition {
            db: table.db.clone(),
            table: table.name.clone(),
            spec: spec.clone(),
            location: table.location.join(spec.to_path_name()),
            properties: Properties::new(),
        };
        self.catalog.add_partition(&partition).await?;
        fs::create_dir_all(&partition.location)?;

        self.emit(
            EventType::AddPartition,
            &table.db,
            Some(&table.name),
            Some(spec),
            &EventMessage::AddPartition {
                table: table.clone(),
                partitions: vec![partition.clone()],
            },
        )
        .await?;
        Ok(partition)
    }

    /// Add a partition
    pub async fn add_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<Partition> {
        let table = self.require_table(db, table).await?;
        self.create_partition(&table, spec).await
    }

    /// Alter partition properties
    pub async fn alter_partition<F>(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
        update: F,
    ) -> Result<Partition>
    where
        F: FnOnce(&mut Partition) + Send,
    {
        let table = self.require_table(db, table).await?;
        let before = self.require_partition(&table, spec).await?;
        let mut after = before.clone();
        update(&mut after);
        after.spec = before.spec.clone();
        after.location = before.location.clone();
        self.catalog
            .alter_partition(&table.db, &table.name, spec, &after)
            .await?;

        self.emit(
            EventType::AlterPartition,
            &table.db,
            Some(&table.name),
            Some(spec),
            &EventMessage::AlterPartition {
                table: table.clone(),
                before,
                after: after.clone(),
            },
        )
        .await?;
        Ok(after)
    }

    /// Move a partition to new key values
    pub async fn rename_partition(
        &self,
        db: &str,
        table: &str,
        old_spec: &PartitionSpec,
        new_spec: &PartitionSpec,
    ) -> Result<Partition> {
        let table = self.require_table(db, table).await?;
        Self::check_spec(&table, new_spec)?;
        let before = self.require_partition(&table, old_spec).await?;

        let mut after = before.clone();
        after.spec = new_spec.clone();
        after.location = table.location.join(new_spec.to_path_name());

        self.preserve_dir(db, &before.location).await?;
        if before.location.exists() {
            if let Some(parent) = after.location.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&before.location, &after.location)?;
        }
        self.catalog
            .alter_partition(&table.db, &table.name, old_spec, &after)
            .await?;

        self.emit(
            EventType::RenamePartition,
            &table.db,
            Some(&table.name),
            Some(old_spec),
            &EventMessage::RenamePartition {
                table: table.clone(),
                before: old_spec.clone(),
                after: after.clone(),
            },
        )
        .await?;
        Ok(after)
    }

    /// Drop a partition and its data
    pub async fn drop_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let partition = self.require_partition(&table, spec).await?;
        self.discard_dir(db, &partition.location).await?;
        self.catalog.drop_partition(&table.db, &table.name, spec).await?;

        self.emit(
            EventType::DropPartition,
            &table.db,
            Some(&table.name),
            Some(spec),
            &EventMessage::DropPartition {
                table: table.clone(),
                specs: vec![spec.clone()],
            },
        )
        .await?;
        Ok(())
    }

    // Data

    /// Resolve the directory an insert writes to, creating a missing
    /// partition dynamically
    async fn insert_target(
        &self,
        table: &Table,
        spec: Option<&PartitionSpec>,
    ) -> Result<(PathBuf, Option<Partition>, bool)> {
        if table.is_view() {
            return Err(Error::Catalog(format!(
                "cannot write into view {}",
                table.qualified_name()
            )));
        }
        match (table.is_partitioned(), spec) {
            (false, None) => Ok((table.location.clone(), None, false)),
            (true, Some(spec)) => match self.catalog.get_partition(&table.db, &table.name, spec).await? {
                Lookup::Found(p) => Ok((p.location.clone(), Some(p), false)),
                Lookup::NotFound => {
                    let p = self.create_partition(table, spec).await?;
                    Ok((p.location.clone(), Some(p), true))
                }
            },
            (false, Some(_)) => Err(Error::Catalog(format!(
                "table {} is not partitioned",
                table.qualified_name()
            ))),
            (true, None) => Err(Error::Catalog(format!(
                "table {} requires a partition spec",
                table.qualified_name()
            ))),
        }
    }

    async fn write(
        &self,
        db: &str,
        table: &str,
        spec: Option<&PartitionSpec>,
        rows: &[&str],
        replace: bool,
    ) -> Result<FileRef> {
        let table = self.require_table(db, table).await?;
        let (dir, partition, partition_created) = self.insert_target(&table, spec).await?;

        if replace {
            let existing = files::list_data_files(&dir)?;
            self.discard_files(&table.db, &existing).await?;
        }
        let file = files::write_data_file(&dir, rows)?;

        let event_type = if replace {
            EventType::InsertOverwrite
        } else {
            EventType::Insert
        };
        self.emit(
            event_type,
            &table.db,
            Some(&table.name),
            spec,
            &EventMessage::Insert {
                table: table.clone(),
                partition,
                files: vec![file.clone()],
                replace,
                partition_created,
            },
        )
        .await?;
        Ok(file)
    }

    /// Append rows as a new data file
    pub async fn insert(
        &self,
        db: &str,
        table: &str,
        spec: Option<&PartitionSpec>,
        rows: &[&str],
    ) -> Result<FileRef> {
        self.write(db, table, spec, rows, false).await
    }

    /// Replace the data of a table or partition
    pub async fn insert_overwrite(
        &self,
        db: &str,
        table: &str,
        spec: Option<&PartitionSpec>,
        rows: &[&str],
    ) -> Result<FileRef> {
        self.write(db, table, spec, rows, true).await
    }

    /// Remove all data of a table, across every partition
    pub async fn truncate_table(&self, db: &str, table: &str) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let mut dirs = vec![table.location.clone()];
        for spec in self.catalog.list_partition_specs(&table.db, &table.name).await? {
            if let Lookup::Found(p) = self.catalog.get_partition(&table.db, &table.name, &spec).await? {
                dirs.push(p.location);
            }
        }
        for dir in dirs {
            let existing = files::list_data_files(&dir)?;
            self.discard_files(&table.db, &existing).await?;
        }

        self.emit(
            EventType::TruncateTable,
            &table.db,
            Some(&table.name),
            None,
            &EventMessage::Truncate {
                table: table.clone(),
                partition: None,
            },
        )
        .await?;
        Ok(())
    }

    /// Remove all data of one partition
    pub async fn truncate_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<()> {
        let table = self.require_table(db, table).await?;
        let partition = self.require_partition(&table, spec).await?;
        let existing = files::list_data_files(&partition.location)?;
        self.discard_files(&table.db, &existing).await?;

        self.emit(
            EventType::TruncatePartition,
            &table.db,
            Some(&table.name),
            Some(spec),
            &EventMessage::Truncate {
                table: table.clone(),
                partition: Some(spec.clone()),
            },
        )
        .await?;
        Ok(())
    }

    /// Merge the data files of a table or partition into one
    pub async fn concatenate(&self, db: &str, table: &str, spec: Option<&PartitionSpec>) -> Result<FileRef> {
        let table = self.require_table(db, table).await?;
        let (dir, partition) = match spec {
            Some(spec) => {
                let p = self.require_partition(&table, spec).await?;
                (p.location.clone(), Some(p))
            }
            None => (table.location.clone(), None),
        };

        let existing = files::list_data_files(&dir)?;
        let mut rows = Vec::new();
        for file in &existing {
            let content = fs::read_to_string(file)?;
            rows.extend(content.lines().map(str::to_string));
        }
        let row_refs: Vec<&str> = rows.iter().map(String::as_str).collect();
        let merged = files::write_data_file(&dir, &row_refs)?;
        self.discard_files(&table.db, &existing).await?;

        self.emit(
            EventType::Concatenate,
            &table.db,
            Some(&table.name),
            spec,
            &EventMessage::Concatenate {
                table: table.clone(),
                partition,
                files: vec![merged.clone()],
            },
        )
        .await?;
        Ok(merged)
    }

    // Functions

    fn function_dir(&self, db: &str, name: &str) -> PathBuf {
        self.root
            .join(FUNCTION_RESOURCE_DIR)
            .join(normalize(db))
            .join(normalize(name))
    }

    /// Create a function, copying its resource files into the warehouse
    pub async fn create_function(
        &self,
        db: &str,
        name: &str,
        class_name: &str,
        resources: &[PathBuf],
    ) -> Result<Function> {
        let database = self.require_database(db).await?;
        let dir = self.function_dir(db, name);
        fs::create_dir_all(&dir)?;

        let mut uris = Vec::with_capacity(resources.len());
        let mut refs = Vec::with_capacity(resources.len());
        for resource in resources {
            let file_name = resource
                .file_name()
                .ok_or_else(|| Error::Catalog(format!("bad resource path {:?}", resource)))?;
            let dest = dir.join(file_name);
            fs::copy(resource, &dest)?;
            let kind = match dest.extension().and_then(|e| e.to_str()) {
                Some("jar") => ResourceKind::Jar,
                Some("zip") | Some("tgz") | Some("tar") => ResourceKind::Archive,
                _ => ResourceKind::File,
            };
            refs.push(files::file_ref(&dest)?);
            uris.push(ResourceUri { kind, uri: dest });
        }

        let function = Function {
            db: database.name,
            name: normalize(name),
            class_name: class_name.to_string(),
            resources: uris,
            properties: Properties::new(),
        };
        self.catalog.create_function(&function).await?;

        self.emit(
            EventType::CreateFunction,
            &function.db,
            None,
            None,
            &EventMessage::CreateFunction {
                function: function.clone(),
                resources: refs,
            },
        )
        .await?;
        Ok(function)
    }

    /// Drop a function and its resource files
    pub async fn drop_function(&self, db: &str, name: &str) -> Result<()> {
        if !self.catalog.drop_function(db, name).await? {
            return Err(Error::NotFound(format!("function {}.{}", db, name)));
        }
        self.discard_dir(db, &self.function_dir(db, name)).await?;

        self.emit(
            EventType::DropFunction,
            db,
            None,
            None,
            &EventMessage::DropFunction {
                db: normalize(db),
                name: normalize(name),
            },
        )
        .await?;
        Ok(())
    }

    /// Rows currently stored in a table
    pub async fn table_rows(&self, db: &str, table: &str) -> Result<Vec<String>> {
        let table = self.require_table(db, table).await?;
        read_rows(&table.location)
    }
}
