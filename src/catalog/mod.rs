//! Catalog
//!
//! Interface to the metadata service. Lookups that may legitimately miss
//! (a concurrent drop during a bootstrap walk, a replay against an object
//! that is already gone) return [`Lookup::NotFound`] instead of an error.

pub mod sqlite;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use sqlite::SqliteCatalog;
pub use types::{
    is_replication_key, is_replication_source, normalize, strip_replication_properties, Column,
    Database, Function, HasProperties, Lookup, ObjectRef, Partition, PartitionSpec, Properties,
    ResourceKind, ResourceUri, Table, TableKind, CHECKPOINT_KEY, LAST_REPL_ID_KEY,
    SOURCE_OF_REPLICATION,
};

/// Outcome of a compare-and-set on an object property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The property held a different value
    Conflict(Option<String>),
    ObjectMissing,
}

/// Metadata service operations used by dump and load
#[async_trait]
pub trait Catalog: Send + Sync {
    // Databases
    async fn list_databases(&self) -> Result<Vec<String>>;
    async fn get_database(&self, name: &str) -> Result<Lookup<Database>>;
    async fn create_database(&self, db: &Database) -> Result<()>;
    async fn alter_database(&self, db: &Database) -> Result<()>;
    /// Drops the database with everything in it; false if it was absent
    async fn drop_database(&self, name: &str) -> Result<bool>;

    // Tables and views
    async fn list_tables(&self, db: &str) -> Result<Vec<String>>;
    async fn get_table(&self, db: &str, name: &str) -> Result<Lookup<Table>>;
    async fn create_table(&self, table: &Table) -> Result<()>;
    /// Replace a table definition; a different db/name in `table` renames it
    async fn alter_table(&self, db: &str, name: &str, table: &Table) -> Result<()>;
    async fn drop_table(&self, db: &str, name: &str) -> Result<bool>;

    // Partitions
    async fn list_partition_specs(&self, db: &str, table: &str) -> Result<Vec<PartitionSpec>>;
    async fn get_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
    ) -> Result<Lookup<Partition>>;
    async fn add_partition(&self, partition: &Partition) -> Result<()>;
    /// Replace a partition definition; a different spec renames it
    async fn alter_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
        partition: &Partition,
    ) -> Result<()>;
    async fn drop_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<bool>;

    // Functions
    async fn list_functions(&self, db: &str) -> Result<Vec<String>>;
    async fn get_function(&self, db: &str, name: &str) -> Result<Lookup<Function>>;
    async fn create_function(&self, function: &Function) -> Result<()>;
    async fn drop_function(&self, db: &str, name: &str) -> Result<bool>;

    // Properties
    /// NotFound when the object is absent, Found(None) when the key is unset
    async fn get_property(&self, object: &ObjectRef, key: &str) -> Result<Lookup<Option<String>>>;

    /// Atomically set (or remove, with `new = None`) a property if it still
    /// holds `expected`
    async fn compare_and_set_property(
        &self,
        object: &ObjectRef,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome>;
}
