//! Load Tasks
//!
//! A dump is turned into a list of object steps: the consecutive ops of one
//! dump entry that touch the same target object. Each step is gated by one
//! checkpoint check and finished by one checkpoint stamp. Steps are cut into
//! iterations of at most `max_ops` operations; inside an iteration, steps
//! are grouped by table and groups run in parallel, while barrier steps
//! (database ops, table renames) run alone.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::catalog::{normalize, ObjectRef};
use crate::dump::{DumpEntry, DumpOp, ManifestEntry};
use crate::error::{Error, Result};
use crate::event::{EventId, NamePattern};

use super::apply::Applier;
use super::checkpoint::CheckpointTracker;

/// Ops of one dump entry against one target object
#[derive(Debug, Clone)]
pub struct ObjectStep {
    pub entry_id: EventId,
    /// Target database
    pub db: String,
    pub object: ObjectRef,
    pub ops: Vec<DumpOp>,
    pub manifest: Arc<Vec<ManifestEntry>>,
}

impl ObjectStep {
    pub fn is_barrier(&self) -> bool {
        self.ops.iter().any(DumpOp::is_barrier)
    }

    /// Steps sharing a key must run in order
    pub fn group_key(&self) -> String {
        match &self.object {
            ObjectRef::Database { db } => db.clone(),
            ObjectRef::Table { db, table } | ObjectRef::Partition { db, table, .. } => {
                format!("{}.{}", db, table)
            }
            ObjectRef::Function { db, name } => format!("{}#{}", db, name),
        }
    }

    /// Table whose watermark applies to this step
    pub fn table(&self) -> Option<&str> {
        self.ops.first().and_then(DumpOp::table_name)
    }
}

/// Split dump entries into object steps for the target databases
///
/// `target_db` maps a source database name to its replica name. With a
/// table pattern only that table's ops are kept.
pub fn build_steps<F>(
    entries: Vec<(DumpEntry, Vec<ManifestEntry>)>,
    target_db: F,
    table: Option<&NamePattern>,
) -> Vec<ObjectStep>
where
    F: Fn(&str) -> String,
{
    let mut steps: Vec<ObjectStep> = Vec::new();

    for (entry, manifest) in entries {
        let db = target_db(&entry.db);
        let manifest = Arc::new(manifest);
        let mut current: Option<ObjectStep> = None;

        for op in entry.ops {
            if let Some(pattern) = table {
                if !op.table_name().map_or(false, |t| pattern.matches(t)) {
                    continue;
                }
            }
            let object = op.object(&db);
            match current.as_mut() {
                Some(step) if step.object == object => step.ops.push(op),
                _ => {
                    steps.extend(current.take());
                    current = Some(ObjectStep {
                        entry_id: entry.id.clone(),
                        db: db.clone(),
                        object,
                        ops: vec![op],
                        manifest: manifest.clone(),
                    });
                }
            }
        }
        steps.extend(current);
    }

    steps
}

/// End (exclusive) of the iteration starting at `start`
///
/// An iteration holds at least one step even when that step alone exceeds
/// `max_ops`.
pub fn next_batch_end(steps: &[ObjectStep], start: usize, max_ops: usize) -> usize {
    let mut ops = 0;
    let mut end = start;
    while end < steps.len() {
        let n = steps[end].ops.len();
        if end > start && ops + n > max_ops {
            break;
        }
        ops += n;
        end += 1;
    }
    end
}

/// A unit of an iteration
#[derive(Debug)]
pub enum Stage {
    /// Runs alone
    Barrier(ObjectStep),
    /// Independent groups; each group runs in order
    Groups(Vec<Vec<ObjectStep>>),
}

fn flush_groups(
    groups: &mut BTreeMap<String, Vec<ObjectStep>>,
    order: &mut Vec<String>,
    stages: &mut Vec<Stage>,
) {
    if order.is_empty() {
        return;
    }
    let ordered = order.drain(..).filter_map(|key| groups.remove(&key)).collect();
    stages.push(Stage::Groups(ordered));
}

/// Split an iteration into stages, preserving per-object order
pub fn stages(batch: &[ObjectStep]) -> Vec<Stage> {
    let mut stages = Vec::new();
    let mut groups: BTreeMap<String, Vec<ObjectStep>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();

    for step in batch {
        if step.is_barrier() {
            flush_groups(&mut groups, &mut order, &mut stages);
            stages.push(Stage::Barrier(step.clone()));
            continue;
        }
        let key = step.group_key();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(step.clone());
    }
    flush_groups(&mut groups, &mut order, &mut stages);

    stages
}

/// What happened to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied(usize),
    /// Already covered by a checkpoint or a watermark
    Skipped,
}

/// Counters of an iteration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepCounts {
    pub applied_ops: usize,
    pub skipped_steps: usize,
}

impl StepCounts {
    fn add(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Applied(n) => self.applied_ops += n,
            StepOutcome::Skipped => self.skipped_steps += 1,
        }
    }

    fn merge(&mut self, other: StepCounts) {
        self.applied_ops += other.applied_ops;
        self.skipped_steps += other.skipped_steps;
    }
}

/// Executes steps against the replica for one dump
pub struct StepRunner {
    pub tracker: CheckpointTracker,
    pub applier: Applier,
    pub dump_root: PathBuf,
    /// Incremental dumps also honour the `repl.last.id` watermark
    pub incremental: bool,
    pub metadata_only: bool,
}

impl StepRunner {
    /// Highest replicated event id covering this step
    async fn watermark(&self, step: &ObjectStep) -> Result<Option<EventId>> {
        let mut mark = self
            .tracker
            .last_repl_id(&ObjectRef::database(&step.db))
            .await?;
        if let Some(table) = step.table() {
            let table_mark = self
                .tracker
                .last_repl_id(&ObjectRef::table(&step.db, table))
                .await?;
            mark = mark.max(table_mark);
        }
        Ok(mark)
    }

    pub async fn run(&self, step: &ObjectStep) -> Result<StepOutcome> {
        if self.incremental {
            if let Some(mark) = self.watermark(step).await? {
                if step.entry_id <= mark {
                    tracing::debug!(
                        object = %step.object,
                        entry = %step.entry_id,
                        watermark = %mark,
                        "Entry already replicated, skipping"
                    );
                    return Ok(StepOutcome::Skipped);
                }
            }
        }

        if self
            .tracker
            .is_applied(&step.object, &self.dump_root, &step.entry_id)
            .await?
        {
            tracing::debug!(object = %step.object, entry = %step.entry_id, "Already applied by this dump");
            return Ok(StepOutcome::Skipped);
        }
        if self
            .tracker
            .is_superseded(&step.object, &self.dump_root, &step.entry_id)
            .await?
        {
            tracing::debug!(
                object = %step.object,
                entry = %step.entry_id,
                "Owning table already past this entry, skipping"
            );
            return Ok(StepOutcome::Skipped);
        }

        for op in &step.ops {
            tracing::debug!(object = %step.object, entry = %step.entry_id, op = op.name(), "Applying");
            self.applier
                .apply(&step.db, op, &step.manifest, self.metadata_only)
                .await?;
        }

        self.tracker
            .mark_applied(&step.object, &self.dump_root, &step.entry_id)
            .await?;
        Ok(StepOutcome::Applied(step.ops.len()))
    }

    async fn run_group(&self, group: &[ObjectStep]) -> Result<StepCounts> {
        let mut counts = StepCounts::default();
        for step in group {
            counts.add(self.run(step).await?);
        }
        Ok(counts)
    }
}

/// Run one iteration
///
/// A failing group stops its own remaining steps; groups that completed
/// keep their checkpoints and the first error is returned.
pub async fn run_batch(
    runner: &Arc<StepRunner>,
    batch: &[ObjectStep],
    parallel: bool,
    workers: usize,
) -> Result<StepCounts> {
    let mut counts = StepCounts::default();

    for stage in stages(batch) {
        match stage {
            Stage::Barrier(step) => counts.add(runner.run(&step).await?),
            Stage::Groups(groups) if !parallel || groups.len() == 1 => {
                for group in &groups {
                    counts.merge(runner.run_group(group).await?);
                }
            }
            Stage::Groups(groups) => {
                let semaphore = Arc::new(Semaphore::new(workers.max(1)));
                let mut handles = Vec::with_capacity(groups.len());
                for group in groups {
                    let semaphore = semaphore.clone();
                    let runner = runner.clone();
                    handles.push(tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|e| Error::Internal(format!("load worker pool closed: {}", e)))?;
                        runner.run_group(&group).await
                    }));
                }

                let mut first_error = None;
                for joined in join_all(handles).await {
                    let result = joined
                        .map_err(|e| Error::Internal(format!("load worker failed: {}", e)))
                        .and_then(|r| r);
                    match result {
                        Ok(group_counts) => counts.merge(group_counts),
                        Err(e) => {
                            tracing::warn!("Load group failed: {}", e);
                            first_error.get_or_insert(e);
                        }
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }
            }
        }
    }

    Ok(counts)
}

/// Normalized table pattern of a table-scoped load
pub fn table_pattern(table: Option<&str>) -> Option<NamePattern> {
    table.map(|t| NamePattern::parse(&normalize(t)))
}
