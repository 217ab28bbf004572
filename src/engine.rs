//! Replication Engine
//!
//! Entry points exposed to the command layer: dump on the source, load into
//! the replica, status of the replica, and CM reclamation.

use std::fs;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::WharfConfig;
use crate::dump::{DumpPlanner, DumpRequest, DumpResult};
use crate::error::Result;
use crate::event::EventId;
use crate::load::{LoadOptions, LoadPlanner, LoadRequest, LoadResult};
use crate::warehouse::Warehouse;

/// Source warehouse plus replica catalog, wired from one configuration
pub struct ReplicationEngine {
    config: WharfConfig,
    source: Warehouse,
    dump: DumpPlanner,
    load: LoadPlanner,
    replica_catalog: Arc<dyn Catalog>,
}

impl ReplicationEngine {
    /// Open both sides described by `config`
    pub fn open(config: WharfConfig) -> Result<Self> {
        let source = Warehouse::open(&config)?;

        fs::create_dir_all(&config.target.data_dir)?;
        let replica_catalog: Arc<dyn Catalog> =
            Arc::new(SqliteCatalog::open(&config.target_catalog_path())?);

        let dump = DumpPlanner::new(
            source.catalog(),
            source.log(),
            source.cm(),
            config.dump.dump_dir.clone(),
            config.source.message_format.clone(),
            config.dump.fetch_batch_size,
        );
        let load = LoadPlanner::new(
            replica_catalog.clone(),
            config.target_warehouse_dir(),
            source.cm(),
        );

        Ok(Self {
            config,
            source,
            dump,
            load,
            replica_catalog,
        })
    }

    pub fn config(&self) -> &WharfConfig {
        &self.config
    }

    /// The source warehouse, for catalog mutations
    pub fn source(&self) -> &Warehouse {
        &self.source
    }

    pub fn replica_catalog(&self) -> Arc<dyn Catalog> {
        self.replica_catalog.clone()
    }

    pub async fn dump(&self, request: &DumpRequest) -> Result<DumpResult> {
        self.dump.dump(request).await
    }

    /// Load options from configuration, before per-call overrides
    pub fn default_load_options(&self) -> LoadOptions {
        LoadOptions {
            table: None,
            metadata_only: false,
            parallel: self.config.load.parallel,
            workers: self.config.load_workers(),
            move_optimization: self.config.load.move_optimization,
            max_ops_per_iteration: self.config.load.max_ops_per_iteration,
        }
    }

    pub async fn load(&self, request: &LoadRequest) -> Result<LoadResult> {
        self.load.load(request).await
    }

    /// Last event id replicated into a replica database or table
    pub async fn status(&self, db: &str, table: Option<&str>) -> Result<Option<EventId>> {
        self.load.status(db, table).await
    }

    /// Reclaim CM content past its retention deadline
    pub async fn purge_cm(&self) -> Result<usize> {
        match self.source.cm() {
            Some(cm) => cm.purge_expired(Utc::now()).await,
            None => Ok(0),
        }
    }
}
