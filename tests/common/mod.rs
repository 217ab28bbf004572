//! Common fixtures for scenario tests: a source warehouse and any number
//! of replicas, each in its own temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use wharf::catalog::{
    CasOutcome, Catalog, Database, Function, Lookup, ObjectRef, Partition, PartitionSpec,
    SqliteCatalog, Table, CHECKPOINT_KEY,
};
use wharf::cm::ChangeManager;
use wharf::dump::{DumpPlanner, DumpRequest, DumpResult};
use wharf::event::{EventId, NotificationLog, SqliteNotificationLog, JSON_MESSAGE_FORMAT};
use wharf::load::{Checkpoint, LoadOptions, LoadPlanner, LoadRequest, LoadResult};
use wharf::warehouse::{read_rows, Warehouse};
use wharf::Result;

pub const SOURCE_DB: &str = "src";

/// Source side with a replication-enabled database `src`
pub struct SourceCluster {
    pub dir: TempDir,
    pub wh: Warehouse,
}

impl SourceCluster {
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
        wh.create_database(SOURCE_DB).await.unwrap();
        wh.enable_replication(SOURCE_DB, "dr").await.unwrap();
        Self { dir, wh }
    }

    pub fn planner(&self) -> DumpPlanner {
        DumpPlanner::new(
            self.wh.catalog(),
            self.wh.log(),
            self.wh.cm(),
            self.dir.path().join("dumps"),
            JSON_MESSAGE_FORMAT.to_string(),
            3,
        )
    }

    pub async fn dump(&self, from: Option<EventId>) -> DumpResult {
        self.dump_with(DumpRequest {
            db_pattern: SOURCE_DB.to_string(),
            from,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    pub async fn dump_with(&self, request: DumpRequest) -> Result<DumpResult> {
        self.planner().dump(&request).await
    }

    pub async fn head(&self) -> EventId {
        self.wh.log().current_id().await.unwrap()
    }

    pub async fn rows(&self, table: &str) -> Vec<String> {
        self.wh.table_rows(SOURCE_DB, table).await.unwrap()
    }
}

/// A replica warehouse
pub struct Replica {
    pub dir: TempDir,
    pub catalog: Arc<SqliteCatalog>,
    cm: Option<Arc<ChangeManager>>,
}

impl Replica {
    pub fn new(source: &SourceCluster) -> Self {
        let dir = tempdir().unwrap();
        let catalog = Arc::new(SqliteCatalog::open(&dir.path().join("catalog.db")).unwrap());
        Self {
            dir,
            catalog,
            cm: source.wh.cm(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("warehouse")
    }

    pub fn planner(&self) -> LoadPlanner {
        self.planner_with(self.catalog.clone())
    }

    /// Planner over another view of this replica's catalog
    pub fn planner_with(&self, catalog: Arc<dyn Catalog>) -> LoadPlanner {
        LoadPlanner::new(catalog, self.root(), self.cm.clone())
    }

    pub async fn load(&self, target: &str, dump_root: &Path) -> Result<LoadResult> {
        self.load_with(target, dump_root, LoadOptions::default()).await
    }

    pub async fn load_with(
        &self,
        target: &str,
        dump_root: &Path,
        options: LoadOptions,
    ) -> Result<LoadResult> {
        self.planner()
            .load(&LoadRequest {
                target_db: target.to_string(),
                dump_root: dump_root.to_path_buf(),
                options,
            })
            .await
    }

    pub async fn status(&self, db: &str, table: Option<&str>) -> Option<EventId> {
        self.planner().status(db, table).await.unwrap()
    }

    pub async fn table(&self, db: &str, table: &str) -> Option<Table> {
        self.catalog.get_table(db, table).await.unwrap().found()
    }

    /// Rows of a table, sorted; empty when the table is absent
    pub async fn rows(&self, db: &str, table: &str) -> Vec<String> {
        match self.table(db, table).await {
            Some(t) => read_rows(&t.location).unwrap(),
            None => Vec::new(),
        }
    }

    pub async fn property(&self, object: &ObjectRef, key: &str) -> Option<String> {
        self.catalog
            .get_property(object, key)
            .await
            .unwrap()
            .found()
            .flatten()
    }
}

/// Catalog that fails chosen table creations or checkpoint stamps once,
/// and counts table creations
pub struct FlakyCatalog {
    inner: Arc<SqliteCatalog>,
    fail_create: Mutex<HashMap<String, Arc<AtomicBool>>>,
    create_calls: Mutex<HashMap<String, usize>>,
    fail_stamp: Mutex<Option<(ObjectRef, EventId)>>,
}

impl FlakyCatalog {
    pub fn new(inner: Arc<SqliteCatalog>) -> Self {
        Self {
            inner,
            fail_create: Mutex::new(HashMap::new()),
            create_calls: Mutex::new(HashMap::new()),
            fail_stamp: Mutex::new(None),
        }
    }

    /// The next checkpoint stamp of `entry` on `object` fails, after the
    /// step's effects are already in place
    pub fn fail_next_stamp(&self, object: ObjectRef, entry: EventId) {
        *self.fail_stamp.lock().unwrap() = Some((object, entry));
    }

    fn take_stamp_failure(&self, object: &ObjectRef, key: &str, new: Option<&str>) -> bool {
        if key != CHECKPOINT_KEY {
            return false;
        }
        let Some(entry) = new
            .and_then(|raw| serde_json::from_str::<Checkpoint>(raw).ok())
            .map(|cp| cp.entry)
        else {
            return false;
        };
        let mut pending = self.fail_stamp.lock().unwrap();
        if pending.as_ref() == Some(&(object.clone(), entry)) {
            *pending = None;
            return true;
        }
        false
    }

    /// The next creation of `table` fails
    pub fn fail_next_create(&self, table: &str) {
        self.fail_create
            .lock()
            .unwrap()
            .insert(table.to_string(), Arc::new(AtomicBool::new(true)));
    }

    pub fn create_calls(&self, table: &str) -> usize {
        self.create_calls
            .lock()
            .unwrap()
            .get(table)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Catalog for FlakyCatalog {
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
        self.inner.get_table(db, name).await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        *self
            .create_calls
            .lock()
            .unwrap()
            .entry(table.name.clone())
            .or_insert(0) += 1;

        let flag = self.fail_create.lock().unwrap().get(&table.name).cloned();
        if let Some(flag) = flag {
            if flag.swap(false, Ordering::SeqCst) {
                return Err(wharf::Error::Catalog(format!(
                    "injected failure creating {}",
                    table.qualified_name()
                )));
            }
        }
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
        if self.take_stamp_failure(object, key, new) {
            return Err(wharf::Error::State(format!(
                "injected failure stamping {}",
                object
            )));
        }
        self.inner
            .compare_and_set_property(object, key, expected, new)
            .await
    }
}
