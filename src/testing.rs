//! Test fixtures shared by unit tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use crate::catalog::{
    CasOutcome, Catalog, Database, Function, Lookup, ObjectRef, Partition, PartitionSpec,
    SqliteCatalog, Table,
};
use crate::error::Result;
use crate::cm::ChangeManager;
use crate::dump::{DumpPlanner, DumpRequest};
use crate::event::{EventId, NotificationLog, SqliteNotificationLog, JSON_MESSAGE_FORMAT};
use crate::warehouse::Warehouse;

/// A source warehouse with a replication-enabled database `db`
pub(crate) struct SourceFixture {
    pub dir: TempDir,
    pub wh: Warehouse,
}

impl SourceFixture {
    pub async fn new() -> Self {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::open(&dir.path().join("catalog.db")).unwrap());
        let log = Arc::new(SqliteNotificationLog::open(&dir.path().join("events.db")).unwrap());
        let cm = Arc::new(
            ChangeManager::open(&dir.path().join("cmroot"), Duration::from_secs(3600)).unwrap(),
        );
        let wh = Warehouse::new(
            dir.path().join("warehouse"),
            catalog,
            log,
            Some(cm),
            JSON_MESSAGE_FORMAT.to_string(),
        );
        wh.create_database("db").await.unwrap();
        wh.enable_replication("db", "test").await.unwrap();
        Self { dir, wh }
    }

    pub fn planner(&self) -> DumpPlanner {
        DumpPlanner::new(
            self.wh.catalog(),
            self.wh.log(),
            self.wh.cm(),
            self.dir.path().join("dumps"),
            JSON_MESSAGE_FORMAT.to_string(),
            100,
        )
    }

    pub fn request(&self, from: Option<EventId>) -> DumpRequest {
        DumpRequest {
            db_pattern: "db".to_string(),
            from,
            ..Default::default()
        }
    }

    pub async fn head(&self) -> EventId {
        self.wh.log().current_id().await.unwrap()
    }
}

/// Catalog view in which chosen objects are still listed but can no longer
/// be fetched, as when they are dropped between listing and fetching
pub(crate) struct VanishingCatalog {
    pub inner: Arc<dyn Catalog>,
    pub tables: Vec<String>,
    pub partitions: Vec<(String, PartitionSpec)>,
}

#[async_trait]
impl Catalog for VanishingCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        self.inner.list_databases().await
    }

    async fn get_database(&self, name: &str) -> Result<Lookup<Database>> {
        self.inner.get_database(name).await
    }

    async fn create_database(&self, db: &Database) -> Result<()> {
        self.inner.create_database(db).await
    }

    async fn alter_database(&self, db: &Database) -> Result<()> {
        self.inner.alter_database(db).await
    }

    async fn drop_database(&self, name: &str) -> Result<bool> {
        self.inner.drop_database(name).await
    }

    async fn list_tables(&self, db: &str) -> Result<Vec<String>> {
        self.inner.list_tables(db).await
    }

    async fn get_table(&self, db: &str, name: &str) -> Result<Lookup<Table>> {
        if self.tables.iter().any(|t| t == name) {
            return Ok(Lookup::NotFound);
        }
        self.inner.get_table(db, name).await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        self.inner.create_table(table).await
    }

    async fn alter_table(&self, db: &str, name: &str, table: &Table) -> Result<()> {
        self.inner.alter_table(db, name, table).await
    }

    async fn drop_table(&self, db: &str, name: &str) -> Result<bool> {
        self.inner.drop_table(db, name).await
    }

    async fn list_partition_specs(&self, db: &str, table: &str) -> Result<Vec<PartitionSpec>> {
        self.inner.list_partition_specs(db, table).await
    }

    async fn get_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
    ) -> Result<Lookup<Partition>> {
        if self.partitions.iter().any(|(t, s)| t == table && s == spec) {
            return Ok(Lookup::NotFound);
        }
        self.inner.get_partition(db, table, spec).await
    }

    async fn add_partition(&self, partition: &Partition) -> Result<()> {
        self.inner.add_partition(partition).await
    }

    async fn alter_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
        partition: &Partition,
    ) -> Result<()> {
        self.inner.alter_partition(db, table, spec, partition).await
    }

    async fn drop_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<bool> {
        self.inner.drop_partition(db, table, spec).await
    }

    async fn list_functions(&self, db: &str) -> Result<Vec<String>> {
        self.inner.list_functions(db).await
    }

    async fn get_function(&self, db: &str, name: &str) -> Result<Lookup<Function>> {
        self.inner.get_function(db, name).await
    }

    async fn create_function(&self, function: &Function) -> Result<()> {
        self.inner.create_function(function).await
    }

    async fn drop_function(&self, db: &str, name: &str) -> Result<bool> {
        self.inner.drop_function(db, name).await
    }

    async fn get_property(&self, object: &ObjectRef, key: &str) -> Result<Lookup<Option<String>>> {
        self.inner.get_property(object, key).await
    }

    async fn compare_and_set_property(
        &self,
        object: &ObjectRef,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome> {
        self.inner
            .compare_and_set_property(object, key, expected, new)
            .await
    }
}
