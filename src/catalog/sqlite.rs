//! SQLite Catalog
//!
//! Embedded metadata store. Every object is a JSON body keyed by
//! (kind, db, object, partition); property updates and renames run inside
//! a single transaction under the connection lock.

use std::path::Path;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use super::types::{normalize, Database, Function, Lookup, ObjectRef, Partition, PartitionSpec, Table};
use super::{CasOutcome, Catalog};
use crate::error::{Error, Result};

const KIND_DATABASE: &str = "database";
const KIND_TABLE: &str = "table";
const KIND_PARTITION: &str = "partition";
const KIND_FUNCTION: &str = "function";

/// Row key of a catalog object
struct Key {
    kind: &'static str,
    db: String,
    object: String,
    part: String,
}

impl Key {
    fn database(db: &str) -> Self {
        Self {
            kind: KIND_DATABASE,
            db: normalize(db),
            object: String::new(),
            part: String::new(),
        }
    }

    fn table(db: &str, table: &str) -> Self {
        Self {
            kind: KIND_TABLE,
            db: normalize(db),
            object: normalize(table),
            part: String::new(),
        }
    }

    fn partition(db: &str, table: &str, spec: &PartitionSpec) -> Self {
        Self {
            kind: KIND_PARTITION,
            db: normalize(db),
            object: normalize(table),
            part: spec.to_path_name(),
        }
    }

    fn function(db: &str, name: &str) -> Self {
        Self {
            kind: KIND_FUNCTION,
            db: normalize(db),
            object: normalize(name),
            part: String::new(),
        }
    }

    fn of(object: &ObjectRef) -> Self {
        match object {
            ObjectRef::Database { db } => Self::database(db),
            ObjectRef::Table { db, table } => Self::table(db, table),
            ObjectRef::Partition { db, table, spec } => Self::partition(db, table, spec),
            ObjectRef::Function { db, name } => Self::function(db, name),
        }
    }
}

fn read_body<T: DeserializeOwned>(conn: &Connection, key: &Key) -> Result<Option<T>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM catalog_objects WHERE kind = ?1 AND db_name = ?2 AND obj_name = ?3 AND part_name = ?4",
            params![key.kind, key.db, key.object, key.part],
            |row| row.get(0),
        )
        .optional()?;

    match body {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

fn write_body<T: Serialize>(conn: &Connection, key: &Key, body: &T) -> Result<()> {
    let json = serde_json::to_string(body)?;
    conn.execute(
        r#"
        INSERT INTO catalog_objects (kind, db_name, obj_name, part_name, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(kind, db_name, obj_name, part_name)
        DO UPDATE SET body = ?5, updated_at = CURRENT_TIMESTAMP
        "#,
        params![key.kind, key.db, key.object, key.part, json],
    )?;
    Ok(())
}

fn exists(conn: &Connection, key: &Key) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM catalog_objects WHERE kind = ?1 AND db_name = ?2 AND obj_name = ?3 AND part_name = ?4",
        params![key.kind, key.db, key.object, key.part],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn delete(conn: &Connection, key: &Key) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM catalog_objects WHERE kind = ?1 AND db_name = ?2 AND obj_name = ?3 AND part_name = ?4",
        params![key.kind, key.db, key.object, key.part],
    )?;
    Ok(removed > 0)
}

fn list_names<P: rusqlite::Params>(conn: &Connection, sql: &str, args: P) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| row.get(0))?;
    let names: Vec<String> = rows.collect::<std::result::Result<_, _>>()?;
    Ok(names)
}

fn require_database(conn: &Connection, db: &str) -> Result<()> {
    if !exists(conn, &Key::database(db))? {
        return Err(Error::NotFound(format!("database {}", db)));
    }
    Ok(())
}

fn require_table(conn: &Connection, db: &str, table: &str) -> Result<Table> {
    read_body(conn, &Key::table(db, table))?
        .ok_or_else(|| Error::NotFound(format!("table {}.{}", db, table)))
}

/// Move every partition of `db.old` under the renamed table
fn move_partitions(conn: &Connection, db: &str, old: &str, old_table: &Table, new: &Table) -> Result<()> {
    let specs = list_names(
        conn,
        "SELECT part_name FROM catalog_objects WHERE kind = 'partition' AND db_name = ?1 AND obj_name = ?2",
        params![normalize(db), normalize(old)],
    )?;

    for part_name in specs {
        let key = Key {
            kind: KIND_PARTITION,
            db: normalize(db),
            object: normalize(old),
            part: part_name,
        };
        let Some(mut partition) = read_body::<Partition>(conn, &key)? else {
            continue;
        };
        partition.db = new.db.clone();
        partition.table = new.name.clone();
        if let Ok(rest) = partition.location.strip_prefix(&old_table.location) {
            partition.location = new.location.join(rest);
        }
        delete(conn, &key)?;
        write_body(conn, &Key::partition(&new.db, &new.name, &partition.spec), &partition)?;
    }
    Ok(())
}

/// Catalog stored in a local SQLite database
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    /// Create or open the catalog database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_objects (
                kind TEXT NOT NULL,
                db_name TEXT NOT NULL,
                obj_name TEXT NOT NULL,
                part_name TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (kind, db_name, obj_name, part_name)
            );

            CREATE INDEX IF NOT EXISTS idx_catalog_objects_db
                ON catalog_objects(db_name);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn list_databases(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        list_names(
            &conn,
            "SELECT db_name FROM catalog_objects WHERE kind = 'database' ORDER BY db_name",
            [],
        )
    }

    async fn get_database(&self, name: &str) -> Result<Lookup<Database>> {
        let conn = self.conn.lock().await;
        Ok(read_body::<Database>(&conn, &Key::database(name))?.into())
    }

    async fn create_database(&self, db: &Database) -> Result<()> {
        let conn = self.conn.lock().await;
        let key = Key::database(&db.name);
        if exists(&conn, &key)? {
            return Err(Error::AlreadyExists(format!("database {}", db.name)));
        }
        write_body(&conn, &key, db)
    }

    async fn alter_database(&self, db: &Database) -> Result<()> {
        let conn = self.conn.lock().await;
        require_database(&conn, &db.name)?;
        write_body(&conn, &Key::database(&db.name), db)
    }

    async fn drop_database(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let existed = exists(&conn, &Key::database(name))?;
        conn.execute(
            "DELETE FROM catalog_objects WHERE db_name = ?1",
            params![normalize(name)],
        )?;
        Ok(existed)
    }

    async fn list_tables(&self, db: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        list_names(
            &conn,
            "SELECT obj_name FROM catalog_objects WHERE kind = 'table' AND db_name = ?1 ORDER BY obj_name",
            params![normalize(db)],
        )
    }

    async fn get_table(&self, db: &str, name: &str) -> Result<Lookup<Table>> {
        let conn = self.conn.lock().await;
        Ok(read_body::<Table>(&conn, &Key::table(db, name))?.into())
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let conn = self.conn.lock().await;
        require_database(&conn, &table.db)?;
        let key = Key::table(&table.db, &table.name);
        if exists(&conn, &key)? {
            return Err(Error::AlreadyExists(format!("table {}", table.qualified_name())));
        }
        write_body(&conn, &key, table)
    }

    async fn alter_table(&self, db: &str, name: &str, table: &Table) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let old = require_table(&tx, db, name)?;
        let renamed = normalize(db) != normalize(&table.db) || normalize(name) != normalize(&table.name);

        if renamed {
            require_database(&tx, &table.db)?;
            if exists(&tx, &Key::table(&table.db, &table.name))? {
                return Err(Error::AlreadyExists(format!("table {}", table.qualified_name())));
            }
            delete(&tx, &Key::table(db, name))?;
            move_partitions(&tx, db, name, &old, table)?;
        }
        write_body(&tx, &Key::table(&table.db, &table.name), table)?;

        tx.commit()?;
        Ok(())
    }

    async fn drop_table(&self, db: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let existed = delete(&conn, &Key::table(db, name))?;
        conn.execute(
            "DELETE FROM catalog_objects WHERE kind = 'partition' AND db_name = ?1 AND obj_name = ?2",
            params![normalize(db), normalize(name)],
        )?;
        Ok(existed)
    }

    async fn list_partition_specs(&self, db: &str, table: &str) -> Result<Vec<PartitionSpec>> {
        let conn = self.conn.lock().await;
        let names = list_names(
            &conn,
            "SELECT part_name FROM catalog_objects WHERE kind = 'partition' AND db_name = ?1 AND obj_name = ?2 ORDER BY part_name",
            params![normalize(db), normalize(table)],
        )?;

        names
            .iter()
            .map(|n| {
                PartitionSpec::from_path_name(n)
                    .ok_or_else(|| Error::Catalog(format!("corrupt partition name '{}'", n)))
            })
            .collect()
    }

    async fn get_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
    ) -> Result<Lookup<Partition>> {
        let conn = self.conn.lock().await;
        Ok(read_body::<Partition>(&conn, &Key::partition(db, table, spec))?.into())
    }

    async fn add_partition(&self, partition: &Partition) -> Result<()> {
        let conn = self.conn.lock().await;
        require_table(&conn, &partition.db, &partition.table)?;
        let key = Key::partition(&partition.db, &partition.table, &partition.spec);
        if exists(&conn, &key)? {
            return Err(Error::AlreadyExists(format!(
                "partition {}.{}{}",
                partition.db, partition.table, partition.spec
            )));
        }
        write_body(&conn, &key, partition)
    }

    async fn alter_partition(
        &self,
        db: &str,
        table: &str,
        spec: &PartitionSpec,
        partition: &Partition,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let old_key = Key::partition(db, table, spec);
        if !exists(&tx, &old_key)? {
            return Err(Error::NotFound(format!("partition {}.{}{}", db, table, spec)));
        }
        if partition.spec != *spec {
            let new_key = Key::partition(db, table, &partition.spec);
            if exists(&tx, &new_key)? {
                return Err(Error::AlreadyExists(format!(
                    "partition {}.{}{}",
                    db, table, partition.spec
                )));
            }
            delete(&tx, &old_key)?;
        }
        write_body(&tx, &Key::partition(db, table, &partition.spec), partition)?;

        tx.commit()?;
        Ok(())
    }

    async fn drop_partition(&self, db: &str, table: &str, spec: &PartitionSpec) -> Result<bool> {
        let conn = self.conn.lock().await;
        delete(&conn, &Key::partition(db, table, spec))
    }

    async fn list_functions(&self, db: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        list_names(
            &conn,
            "SELECT obj_name FROM catalog_objects WHERE kind = 'function' AND db_name = ?1 ORDER BY obj_name",
            params![normalize(db)],
        )
    }

    async fn get_function(&self, db: &str, name: &str) -> Result<Lookup<Function>> {
        let conn = self.conn.lock().await;
        Ok(read_body::<Function>(&conn, &Key::function(db, name))?.into())
    }

    async fn create_function(&self, function: &Function) -> Result<()> {
        let conn = self.conn.lock().await;
        require_database(&conn, &function.db)?;
        let key = Key::function(&function.db, &function.name);
        if exists(&conn, &key)? {
            return Err(Error::AlreadyExists(format!(
                "function {}.{}",
                function.db, function.name
            )));
        }
        write_body(&conn, &key, function)
    }

    async fn drop_function(&self, db: &str, name: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        delete(&conn, &Key::function(db, name))
    }

    async fn get_property(&self, object: &ObjectRef, key: &str) -> Result<Lookup<Option<String>>> {
        let conn = self.conn.lock().await;
        let body: Option<serde_json::Value> = read_body(&conn, &Key::of(object))?;
        Ok(match body {
            Some(body) => Lookup::Found(property_of(&body, key)),
            None => Lookup::NotFound,
        })
    }

    async fn compare_and_set_property(
        &self,
        object: &ObjectRef,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<CasOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row_key = Key::of(object);
        let Some(mut body) = read_body::<serde_json::Value>(&tx, &row_key)? else {
            return Ok(CasOutcome::ObjectMissing);
        };

        let current = property_of(&body, key);
        if current.as_deref() != expected {
            return Ok(CasOutcome::Conflict(current));
        }

        let props = body
            .as_object_mut()
            .ok_or_else(|| Error::Catalog(format!("corrupt body for {}", object)))?
            .entry("properties")
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        let props = props
            .as_object_mut()
            .ok_or_else(|| Error::Catalog(format!("corrupt properties for {}", object)))?;
        match new {
            Some(value) => {
                props.insert(key.to_string(), serde_json::Value::String(value.to_string()));
            }
            None => {
                props.remove(key);
            }
        }

        write_body(&tx, &row_key, &body)?;
        tx.commit()?;
        Ok(CasOutcome::Applied)
    }
}

fn property_of(body: &serde_json::Value, key: &str) -> Option<String> {
    body.get("properties")
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
