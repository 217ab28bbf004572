//! Catalog Object Types
//!
//! Databases, tables, partitions and functions as stored by the metadata
//! service, plus the replication properties stamped on them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Marks a database as a source of replication
pub const SOURCE_OF_REPLICATION: &str = "repl.source.for";

/// Dump root and entry whose effects have been applied to the object
pub const CHECKPOINT_KEY: &str = "repl.checkpoint";

/// Last event id replicated into the object (REPL STATUS)
pub const LAST_REPL_ID_KEY: &str = "repl.last.id";

const REPLICATION_KEYS: [&str; 3] = [SOURCE_OF_REPLICATION, CHECKPOINT_KEY, LAST_REPL_ID_KEY];

/// Object parameters
pub type Properties = BTreeMap<String, String>;

/// Normalize an object name; catalog names are case-insensitive
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Whether a property key is one of the replication bookkeeping keys
pub fn is_replication_key(key: &str) -> bool {
    REPLICATION_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Remove replication bookkeeping from a property map
pub fn strip_replication_properties(props: &mut Properties) {
    props.retain(|k, _| !is_replication_key(k));
}

/// Whether the properties mark the owner as a replication source
pub fn is_replication_source(props: &Properties) -> bool {
    props
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case(SOURCE_OF_REPLICATION) && !v.trim().is_empty())
}

/// Catalog objects carrying a property map
pub trait HasProperties: Clone {
    fn properties_mut(&mut self) -> &mut Properties;

    /// Copy with replication bookkeeping removed
    fn without_replication_properties(&self) -> Self {
        let mut copy = self.clone();
        strip_replication_properties(copy.properties_mut());
        copy
    }
}

macro_rules! impl_has_properties {
    ($($t:ty),*) => {
        $(impl HasProperties for $t {
            fn properties_mut(&mut self) -> &mut Properties {
                &mut self.properties
            }
        })*
    };
}

impl_has_properties!(Database, Table, Partition, Function);

/// Result of a catalog lookup that may legitimately miss
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn as_ref(&self) -> Lookup<&T> {
        match self {
            Lookup::Found(v) => Lookup::Found(v),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

/// Database definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub location: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl Database {
    pub fn new(name: &str, location: PathBuf) -> Self {
        Self {
            name: normalize(name),
            location,
            description: None,
            properties: Properties::new(),
        }
    }

    /// Properties with replication bookkeeping removed
    pub fn user_properties(&self) -> Properties {
        let mut props = self.properties.clone();
        strip_replication_properties(&mut props);
        props
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: normalize(name),
            data_type: data_type.to_lowercase(),
        }
    }
}

/// Table flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Managed,
    External,
    View,
}

/// Table or view definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub db: String,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub partition_keys: Vec<Column>,
    pub location: PathBuf,
    #[serde(default)]
    pub view_text: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl Table {
    pub fn is_partitioned(&self) -> bool {
        !self.partition_keys.is_empty()
    }

    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }

    /// `db.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.db, self.name)
    }

    /// Compare definitions ignoring location and replication bookkeeping
    pub fn same_definition(&self, other: &Table) -> bool {
        let mut mine = self.properties.clone();
        let mut theirs = other.properties.clone();
        strip_replication_properties(&mut mine);
        strip_replication_properties(&mut theirs);

        self.kind == other.kind
            && self.columns == other.columns
            && self.partition_keys == other.partition_keys
            && self.view_text == other.view_text
            && mine == theirs
    }
}

/// Ordered partition key/value list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionSpec(pub Vec<(String, String)>);

impl PartitionSpec {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (normalize(k), v.to_string()))
                .collect(),
        )
    }

    pub fn values(&self) -> Vec<&str> {
        self.0.iter().map(|(_, v)| v.as_str()).collect()
    }

    /// Directory name for this partition, e.g. `country=india/year=2024`
    pub fn to_path_name(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", escape_path_component(k), escape_path_component(v)))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Parse a directory name produced by [`PartitionSpec::to_path_name`]
    pub fn from_path_name(name: &str) -> Option<Self> {
        let mut pairs = Vec::new();
        for component in name.split('/') {
            let (k, v) = component.split_once('=')?;
            pairs.push((unescape_path_component(k)?, unescape_path_component(v)?));
        }
        if pairs.is_empty() {
            return None;
        }
        Some(Self(pairs))
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(k, v)| format!("{}='{}'", k, v)).collect();
        write!(f, "({})", parts.join(", "))
    }
}

fn needs_escape(c: char) -> bool {
    c.is_control() || matches!(c, '/' | '\\' | ':' | '=' | '%' | '#' | '?' | '*' | '"' | '\'' | '[' | ']' | '^' | '{')
}

/// Escape characters that are unsafe in a partition directory name
pub fn escape_path_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if needs_escape(c) {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Reverse of [`escape_path_component`]
pub fn unescape_path_component(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Partition definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub db: String,
    pub table: String,
    pub spec: PartitionSpec,
    pub location: PathBuf,
    #[serde(default)]
    pub properties: Properties,
}

/// Kind of function resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Jar,
    File,
    Archive,
}

/// File a function depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUri {
    pub kind: ResourceKind,
    pub uri: PathBuf,
}

/// User-defined function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub db: String,
    pub name: String,
    pub class_name: String,
    #[serde(default)]
    pub resources: Vec<ResourceUri>,
    #[serde(default)]
    pub properties: Properties,
}

impl Function {
    /// Compare definitions ignoring resource locations and bookkeeping
    pub fn same_definition(&self, other: &Function) -> bool {
        self.class_name == other.class_name
            && self.resources.len() == other.resources.len()
            && self
                .resources
                .iter()
                .zip(other.resources.iter())
                .all(|(a, b)| a.kind == b.kind && a.uri.file_name() == b.uri.file_name())
    }
}

/// Reference to a checkpoint-bearing catalog object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ObjectRef {
    Database {
        db: String,
    },
    Table {
        db: String,
        table: String,
    },
    Partition {
        db: String,
        table: String,
        spec: PartitionSpec,
    },
    Function {
        db: String,
        name: String,
    },
}

impl ObjectRef {
    pub fn database(db: &str) -> Self {
        ObjectRef::Database { db: normalize(db) }
    }

    pub fn table(db: &str, table: &str) -> Self {
        ObjectRef::Table {
            db: normalize(db),
            table: normalize(table),
        }
    }

    pub fn partition(db: &str, table: &str, spec: PartitionSpec) -> Self {
        ObjectRef::Partition {
            db: normalize(db),
            table: normalize(table),
            spec,
        }
    }

    pub fn function(db: &str, name: &str) -> Self {
        ObjectRef::Function {
            db: normalize(db),
            name: normalize(name),
        }
    }

    pub fn db(&self) -> &str {
        match self {
            ObjectRef::Database { db }
            | ObjectRef::Table { db, .. }
            | ObjectRef::Partition { db, .. }
            | ObjectRef::Function { db, .. } => db,
        }
    }

    /// Table this object belongs to, if any
    pub fn table_name(&self) -> Option<&str> {
        match self {
            ObjectRef::Table { table, .. } | ObjectRef::Partition { table, .. } => Some(table),
            _ => None,
        }
    }

    /// Same object under another database name
    pub fn with_db(&self, new_db: &str) -> Self {
        let db = normalize(new_db);
        match self.clone() {
            ObjectRef::Database { .. } => ObjectRef::Database { db },
            ObjectRef::Table { table, .. } => ObjectRef::Table { db, table },
            ObjectRef::Partition { table, spec, .. } => ObjectRef::Partition { db, table, spec },
            ObjectRef::Function { name, .. } => ObjectRef::Function { db, name },
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Database { db } => write!(f, "database {}", db),
            ObjectRef::Table { db, table } => write!(f, "table {}.{}", db, table),
            ObjectRef::Partition { db, table, spec } => {
                write!(f, "partition {}.{}{}", db, table, spec)
            }
            ObjectRef::Function { db, name } => write!(f, "function {}.{}", db, name),
        }
    }
}
