//! Checkpoint Tracker
//!
//! Progress of a load is stored on the target objects themselves:
//! `repl.checkpoint` records the dump root and the last dump entry whose
//! effects on the object are durable, `repl.last.id` the last source event
//! id replicated into it. Both are written with compare-and-set so that
//! concurrent workers never lose an update.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{CasOutcome, Catalog, Lookup, ObjectRef, CHECKPOINT_KEY, LAST_REPL_ID_KEY};
use crate::error::{Error, Result};
use crate::event::EventId;

const MAX_CAS_ATTEMPTS: usize = 16;

/// Value of the checkpoint property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub dump_root: String,
    pub entry: EventId,
}

impl Checkpoint {
    pub fn new(dump_root: &Path, entry: EventId) -> Self {
        Self {
            dump_root: dump_root.to_string_lossy().into_owned(),
            entry,
        }
    }

    /// Whether this checkpoint already covers `entry` of `dump_root`
    pub fn covers(&self, dump_root: &Path, entry: &EventId) -> bool {
        self.is_from(dump_root) && self.entry >= *entry
    }

    /// Whether this checkpoint was stamped by a later entry of `dump_root`
    pub fn is_past(&self, dump_root: &Path, entry: &EventId) -> bool {
        self.is_from(dump_root) && self.entry > *entry
    }

    pub fn is_from(&self, dump_root: &Path) -> bool {
        Path::new(&self.dump_root) == dump_root
    }
}

/// Reads and stamps replication progress on target objects
#[derive(Clone)]
pub struct CheckpointTracker {
    catalog: Arc<dyn Catalog>,
}

impl CheckpointTracker {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Current checkpoint; None if the object or the property is absent
    pub async fn get(&self, object: &ObjectRef) -> Result<Option<Checkpoint>> {
        match self.catalog.get_property(object, CHECKPOINT_KEY).await? {
            Lookup::Found(Some(raw)) => Ok(parse_checkpoint(object, &raw)),
            _ => Ok(None),
        }
    }

    /// Whether `entry` of `dump_root` has already been applied to `object`
    pub async fn is_applied(
        &self,
        object: &ObjectRef,
        dump_root: &Path,
        entry: &EventId,
    ) -> Result<bool> {
        Ok(self
            .get(object)
            .await?
            .map_or(false, |cp| cp.covers(dump_root, entry)))
    }

    /// Whether a partition step of `entry` is behind its owning table
    ///
    /// A table's partition steps run in order before its later table steps,
    /// so a table stamped past `entry` by this dump has already seen every
    /// earlier partition step, even one whose partition was since dropped
    /// and re-created without a checkpoint.
    pub async fn is_superseded(
        &self,
        object: &ObjectRef,
        dump_root: &Path,
        entry: &EventId,
    ) -> Result<bool> {
        let ObjectRef::Partition { db, table, .. } = object else {
            return Ok(false);
        };
        Ok(self
            .get(&ObjectRef::table(db, table))
            .await?
            .map_or(false, |cp| cp.is_past(dump_root, entry)))
    }

    /// Record that `entry` of `dump_root` is durably applied to `object`
    ///
    /// Returns false when the object does not exist (e.g. after a drop).
    /// A checkpoint of the same dump is only ever moved forward.
    pub async fn mark_applied(
        &self,
        object: &ObjectRef,
        dump_root: &Path,
        entry: &EventId,
    ) -> Result<bool> {
        let wanted = Checkpoint::new(dump_root, entry.clone());
        let encoded = serde_json::to_string(&wanted)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.catalog.get_property(object, CHECKPOINT_KEY).await? {
                Lookup::NotFound => return Ok(false),
                Lookup::Found(current) => current,
            };
            if let Some(cp) = current.as_deref().and_then(|raw| parse_checkpoint(object, raw)) {
                if cp.covers(dump_root, entry) {
                    return Ok(true);
                }
            }

            match self
                .catalog
                .compare_and_set_property(object, CHECKPOINT_KEY, current.as_deref(), Some(&encoded))
                .await?
            {
                CasOutcome::Applied => {
                    tracing::debug!(%object, entry = %entry, "Checkpoint stamped");
                    return Ok(true);
                }
                CasOutcome::ObjectMissing => return Ok(false),
                CasOutcome::Conflict(_) => continue,
            }
        }

        Err(Error::State(format!(
            "checkpoint of {} kept changing, gave up after {} attempts",
            object, MAX_CAS_ATTEMPTS
        )))
    }

    /// Last replicated event id (REPL STATUS)
    pub async fn last_repl_id(&self, object: &ObjectRef) -> Result<Option<EventId>> {
        match self.catalog.get_property(object, LAST_REPL_ID_KEY).await? {
            Lookup::Found(Some(raw)) => Ok(EventId::parse(&raw)),
            _ => Ok(None),
        }
    }

    /// Advance the last replicated event id; never moves it backwards
    pub async fn advance_last_repl_id(&self, object: &ObjectRef, id: &EventId) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.catalog.get_property(object, LAST_REPL_ID_KEY).await? {
                Lookup::NotFound => return Ok(false),
                Lookup::Found(current) => current,
            };
            if current
                .as_deref()
                .and_then(EventId::parse)
                .map_or(false, |existing| existing >= *id)
            {
                return Ok(true);
            }

            match self
                .catalog
                .compare_and_set_property(object, LAST_REPL_ID_KEY, current.as_deref(), Some(id.as_str()))
                .await?
            {
                CasOutcome::Applied => return Ok(true),
                CasOutcome::ObjectMissing => return Ok(false),
                CasOutcome::Conflict(_) => continue,
            }
        }

        Err(Error::State(format!(
            "{} of {} kept changing, gave up after {} attempts",
            LAST_REPL_ID_KEY, object, MAX_CAS_ATTEMPTS
        )))
    }
}

fn parse_checkpoint(object: &ObjectRef, raw: &str) -> Option<Checkpoint> {
    match serde_json::from_str(raw) {
        Ok(cp) => Some(cp),
        Err(e) => {
            tracing::warn!(%object, "Ignoring unreadable checkpoint {:?}: {}", raw, e);
            None
        }
    }
}
