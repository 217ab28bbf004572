//! Load Planner
//!
//! Replays a dump directory against the replica catalog. All progress is
//! read from and written to checkpoint properties on the target objects, so
//! an interrupted load is resumed by running it again with the same dump.

pub mod apply;
pub mod checkpoint;
pub mod mover;
pub mod task;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::catalog::{normalize, Catalog, Database, Lookup, ObjectRef};
use crate::cm::ChangeManager;
use crate::dump::{DumpMetadata, DumpReader};
use crate::error::{Error, Result};
use crate::event::EventId;

pub use apply::Applier;
pub use checkpoint::{Checkpoint, CheckpointTracker};
pub use mover::{DataMover, MoveStats};
pub use task::{ObjectStep, StepCounts, StepRunner};

/// Load target that keeps the source database names
pub const ALL_DATABASES: &str = "*";

/// Staging directory under the replica root
const STAGING_DIR: &str = ".staging";

/// Load options
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Only load this table
    pub table: Option<String>,
    /// Skip data movement
    pub metadata_only: bool,
    /// Run independent objects concurrently
    pub parallel: bool,
    pub workers: usize,
    pub move_optimization: bool,
    pub max_ops_per_iteration: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            table: None,
            metadata_only: false,
            parallel: true,
            workers: 2,
            move_optimization: false,
            max_ops_per_iteration: 10_000,
        }
    }
}

/// What to load where
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Replica database name, or `*` to keep source names
    pub target_db: String,
    pub dump_root: PathBuf,
    pub options: LoadOptions,
}

/// Outcome of a load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub applied_ops: usize,
    pub skipped_steps: usize,
    pub iterations: usize,
    /// Event id the replica is now current with
    pub last_event_id: EventId,
}

/// Applies dumps to the replica
pub struct LoadPlanner {
    catalog: Arc<dyn Catalog>,
    root: PathBuf,
    /// Source CM store, consulted when a file left its original path
    cm: Option<Arc<ChangeManager>>,
}

impl LoadPlanner {
    pub fn new(catalog: Arc<dyn Catalog>, root: PathBuf, cm: Option<Arc<ChangeManager>>) -> Self {
        Self { catalog, root, cm }
    }

    /// Load a dump; safe to repeat after any failure
    pub async fn load(&self, request: &LoadRequest) -> Result<LoadResult> {
        let dump_root = fs::canonicalize(&request.dump_root).map_err(|e| Error::InvalidDump {
            path: request.dump_root.clone(),
            reason: e.to_string(),
        })?;
        let reader = DumpReader::open(&dump_root)?;
        let metadata = reader.metadata().clone();

        let staging = self
            .root
            .join(STAGING_DIR)
            .join(Uuid::new_v4().simple().to_string());
        let mover = DataMover::new(staging, self.cm.clone(), request.options.move_optimization);
        let runner = Arc::new(StepRunner {
            tracker: CheckpointTracker::new(self.catalog.clone()),
            applier: Applier::new(self.catalog.clone(), self.root.clone(), mover),
            dump_root: dump_root.clone(),
            incremental: !metadata.is_bootstrap(),
            metadata_only: request.options.metadata_only || metadata.metadata_only,
        });

        tracing::info!(
            dump_root = %dump_root.display(),
            target = %request.target_db,
            "Loading {} dump ({:?}, {}]",
            if metadata.is_bootstrap() { "bootstrap" } else { "incremental" },
            metadata.from_id.as_ref().map(EventId::as_str),
            metadata.to_id
        );

        let result = self.run(&reader, &metadata, &runner, request).await;
        if let Err(e) = runner.applier.mover().cleanup() {
            tracing::warn!("Failed to remove load staging area: {}", e);
        }

        match &result {
            Ok(r) => tracing::info!(
                applied_ops = r.applied_ops,
                skipped_steps = r.skipped_steps,
                iterations = r.iterations,
                "Load complete, replica at event {}",
                r.last_event_id
            ),
            Err(e) => tracing::error!(code = %e.code(), "Load failed: {}", e),
        }
        result
    }

    async fn run(
        &self,
        reader: &DumpReader,
        metadata: &DumpMetadata,
        runner: &Arc<StepRunner>,
        request: &LoadRequest,
    ) -> Result<LoadResult> {
        let targets = target_names(metadata, &request.target_db)?;
        let table = task::table_pattern(request.options.table.as_deref());
        let dump_root = &runner.dump_root;

        for (_, target) in &targets {
            match &request.options.table {
                Some(table) => {
                    self.ensure_database(target).await?;
                    if metadata.is_bootstrap() {
                        self.guard_bootstrap(&ObjectRef::table(target, table), dump_root, &runner.tracker)
                            .await?;
                    }
                }
                None if metadata.is_bootstrap() => {
                    self.guard_bootstrap(&ObjectRef::database(target), dump_root, &runner.tracker)
                        .await?;
                }
                None => {}
            }
        }

        let map = |source: &str| -> String {
            targets
                .iter()
                .find(|(s, _)| *s == normalize(source))
                .map(|(_, t)| t.clone())
                .unwrap_or_else(|| normalize(source))
        };
        let steps = task::build_steps(reader.entries()?, map, table.as_ref());
        let last_entry = steps.iter().map(|s| s.entry_id.clone()).max();

        let max_ops = request.options.max_ops_per_iteration.max(1);
        let mut counts = StepCounts::default();
        let mut iterations = 0;
        let mut start = 0;
        while start < steps.len() {
            let end = task::next_batch_end(&steps, start, max_ops);
            iterations += 1;
            tracing::debug!(iteration = iterations, steps = end - start, "Running load iteration");

            let batch = task::run_batch(
                runner,
                &steps[start..end],
                request.options.parallel,
                request.options.workers,
            )
            .await?;
            counts.applied_ops += batch.applied_ops;
            counts.skipped_steps += batch.skipped_steps;
            start = end;
        }

        self.finish(metadata, &targets, request, runner, last_entry).await?;

        Ok(LoadResult {
            applied_ops: counts.applied_ops,
            skipped_steps: counts.skipped_steps,
            iterations,
            last_event_id: metadata.to_id.clone(),
        })
    }

    /// Record completion: database scope for whole-database loads, the table
    /// alone for table-scoped loads
    async fn finish(
        &self,
        metadata: &DumpMetadata,
        targets: &[(String, String)],
        request: &LoadRequest,
        runner: &StepRunner,
        last_entry: Option<EventId>,
    ) -> Result<()> {
        for (_, target) in targets {
            match &request.options.table {
                Some(table) => {
                    let object = ObjectRef::table(target, table);
                    if !runner.tracker.advance_last_repl_id(&object, &metadata.to_id).await? {
                        tracing::debug!("{} not present after load, status not recorded", object);
                    }
                }
                None => {
                    let object = ObjectRef::database(target);
                    let entry = last_entry.clone().unwrap_or_else(|| metadata.to_id.clone());
                    runner
                        .tracker
                        .mark_applied(&object, &runner.dump_root, &entry)
                        .await?;
                    if !runner.tracker.advance_last_repl_id(&object, &metadata.to_id).await? {
                        return Err(Error::NotFound(format!("database {} after load", target)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Refuse a bootstrap into an object that holds unrelated state
    async fn guard_bootstrap(
        &self,
        object: &ObjectRef,
        dump_root: &Path,
        tracker: &CheckpointTracker,
    ) -> Result<()> {
        let from_this_dump = tracker
            .get(object)
            .await?
            .map_or(false, |cp| cp.is_from(dump_root));

        if let Some(last_id) = tracker.last_repl_id(object).await? {
            if from_this_dump {
                return Ok(());
            }
            return Err(Error::BootstrapAlreadyComplete {
                database: object.to_string(),
                last_id: last_id.to_string(),
            });
        }
        if from_this_dump {
            return Ok(());
        }

        let occupied = match object {
            ObjectRef::Database { db } => match self.catalog.get_database(db).await? {
                Lookup::NotFound => false,
                Lookup::Found(_) => {
                    !self.catalog.list_tables(db).await?.is_empty()
                        || !self.catalog.list_functions(db).await?.is_empty()
                }
            },
            ObjectRef::Table { db, table } => self.catalog.get_table(db, table).await?.is_found(),
            _ => false,
        };
        if occupied {
            return Err(Error::TargetNotEmpty(object.to_string()));
        }
        Ok(())
    }

    /// Table-scoped loads need the database; they create it bare when absent
    async fn ensure_database(&self, db: &str) -> Result<()> {
        if self.catalog.get_database(db).await?.is_found() {
            return Ok(());
        }
        let database = Database::new(db, self.root.join(format!("{}.db", normalize(db))));
        fs::create_dir_all(&database.location)?;
        match self.catalog.create_database(&database).await {
            Ok(()) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Last replicated event id of a database or table (REPL STATUS)
    pub async fn status(&self, db: &str, table: Option<&str>) -> Result<Option<EventId>> {
        let object = match table {
            Some(table) => ObjectRef::table(db, table),
            None => ObjectRef::database(db),
        };
        CheckpointTracker::new(self.catalog.clone())
            .last_repl_id(&object)
            .await
    }
}

/// (source, target) database names of a load
fn target_names(metadata: &DumpMetadata, target_db: &str) -> Result<Vec<(String, String)>> {
    if target_db == ALL_DATABASES {
        return Ok(metadata
            .databases
            .iter()
            .map(|db| (normalize(db), normalize(db)))
            .collect());
    }
    match metadata.databases.as_slice() {
        [single] => Ok(vec![(normalize(single), normalize(target_db))]),
        many => Err(Error::Config(format!(
            "dump holds {} databases, load it with target '{}'",
            many.len(),
            ALL_DATABASES
        ))),
    }
}
