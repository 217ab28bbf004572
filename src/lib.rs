//! Wharf - Incremental Warehouse Replication
//!
//! Replicates databases of a data warehouse (tables, partitions, views,
//! functions and their data files) from a source cluster to replicas. A
//! bootstrap dump captures the current catalog; incremental dumps replay the
//! source's notification log from the last replicated event id.
//!
//! # Architecture
//!
//! Dumps are self-describing directories: one subdirectory per event (or,
//! for a bootstrap, per object), named by numeric id. Loads replay them
//! against the replica and record progress in checkpoint properties on the
//! target objects, so a failed load is resumed by running it again.
//!
//! # Features
//!
//! - Event filtering by database/table pattern, id range and message format
//! - Retention-gap and missing-event detection on the notification log
//! - Change management store that keeps deleted or overwritten files
//!   available to pending dumps
//! - Idempotent, batched, parallel load execution
//! - Table-scoped dumps and loads with independent status

pub mod catalog;
pub mod cm;
pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod event;
pub mod load;
pub mod tuning;
pub mod warehouse;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WharfConfig;
pub use engine::ReplicationEngine;
pub use error::{Error, ErrorCode, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{Catalog, Lookup, ObjectRef, PartitionSpec};
    pub use crate::config::WharfConfig;
    pub use crate::dump::{DumpRequest, DumpResult};
    pub use crate::engine::ReplicationEngine;
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::event::EventId;
    pub use crate::load::{LoadOptions, LoadRequest, LoadResult};
    pub use crate::warehouse::Warehouse;
}
