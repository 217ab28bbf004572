//! Notification Log
//!
//! Ordered log of catalog changes kept by the metadata service. Old events
//! are retired over time, so a reader must be able to tell "nothing new"
//! from "already gone".

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::entry::{EventType, ReplicationEvent};
use super::id::EventId;
use crate::catalog::PartitionSpec;
use crate::error::{Error, Result};

/// Event to be appended; the log assigns the id
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub db: String,
    pub table: Option<String>,
    pub partition: Option<PartitionSpec>,
    pub message_format: String,
    pub message: String,
}

/// Read side of the notification log
#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Up to `limit` events with id greater than `after`, in id order
    async fn fetch_after(&self, after: &EventId, limit: usize) -> Result<Vec<ReplicationEvent>>;

    /// Oldest event still retained
    async fn first_available(&self) -> Result<Option<EventId>>;

    /// Id of the newest event ever written, zero for a fresh log
    async fn current_id(&self) -> Result<EventId>;
}

/// Notification log backed by SQLite
pub struct SqliteNotificationLog {
    conn: Mutex<Connection>,
}

impl SqliteNotificationLog {
    /// Create or open the log database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notification_log (
                event_id INTEGER PRIMARY KEY,
                event_type TEXT NOT NULL,
                db_name TEXT NOT NULL,
                tbl_name TEXT,
                partition_spec TEXT,
                message_format TEXT NOT NULL,
                message TEXT NOT NULL,
                event_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notification_sequence (
                key TEXT PRIMARY KEY,
                value_int INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an event, returning its id
    pub async fn append(&self, event: NewEvent) -> Result<EventId> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let last: i64 = tx
            .query_row(
                "SELECT value_int FROM notification_sequence WHERE key = 'next_event_id'",
                [],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let id = last + 1;

        let partition = match &event.partition {
            Some(spec) => Some(serde_json::to_string(spec)?),
            None => None,
        };

        tx.execute(
            r#"
            INSERT INTO notification_log
                (event_id, event_type, db_name, tbl_name, partition_spec, message_format, message, event_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                id,
                event.event_type.as_str(),
                event.db,
                event.table,
                partition,
                event.message_format,
                event.message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO notification_sequence (key, value_int) VALUES ('next_event_id', ?1)
            ON CONFLICT(key) DO UPDATE SET value_int = ?1
            "#,
            params![id],
        )?;
        tx.commit()?;

        tracing::debug!(
            event_id = id,
            event_type = %event.event_type,
            db = %event.db,
            "Appended notification event"
        );
        Ok(EventId::from(id as u64))
    }

    /// Retire every event with id below `id`; returns the number removed
    pub async fn retire_before(&self, id: &EventId) -> Result<usize> {
        let bound = to_sql_id(id)?;
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM notification_log WHERE event_id < ?1",
            params![bound],
        )?;
        if removed > 0 {
            tracing::info!("Retired {} notification events below {}", removed, id);
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) async fn discard(&self, id: &EventId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM notification_log WHERE event_id = ?1",
            params![to_sql_id(id)?],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn set_message_format(&self, id: &EventId, format: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE notification_log SET message_format = ?2 WHERE event_id = ?1",
            params![to_sql_id(id)?, format],
        )?;
        Ok(())
    }
}

fn to_sql_id(id: &EventId) -> Result<i64> {
    id.to_u64()
        .and_then(|v| i64::try_from(v).ok())
        .ok_or_else(|| Error::State(format!("event id {} exceeds the log's id range", id)))
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        db: row.get(2)?,
        table: row.get(3)?,
        partition: row.get(4)?,
        message_format: row.get(5)?,
        message: row.get(6)?,
        event_time: row.get(7)?,
    })
}

struct RawEvent {
    id: i64,
    event_type: String,
    db: String,
    table: Option<String>,
    partition: Option<String>,
    message_format: String,
    message: String,
    event_time: String,
}

impl RawEvent {
    fn into_event(self) -> Result<ReplicationEvent> {
        let partition = match self.partition {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };
        let event_time = DateTime::parse_from_rfc3339(&self.event_time)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::State(format!("bad event time for {}: {}", self.id, e)))?;

        Ok(ReplicationEvent {
            id: EventId::from(self.id as u64),
            event_type: self.event_type.parse()?,
            db: self.db,
            table: self.table,
            partition,
            message_format: self.message_format,
            message: self.message,
            event_time,
        })
    }
}

#[async_trait]
impl NotificationLog for SqliteNotificationLog {
    async fn fetch_after(&self, after: &EventId, limit: usize) -> Result<Vec<ReplicationEvent>> {
        let after = to_sql_id(after)?;
        let raw = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                r#"
                SELECT event_id, event_type, db_name, tbl_name, partition_spec,
                       message_format, message, event_time
                FROM notification_log
                WHERE event_id > ?1
                ORDER BY event_id
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![after, limit as i64], row_to_event)?;
            let raw: Vec<RawEvent> = rows.collect::<std::result::Result<_, _>>()?;
            raw
        };

        raw.into_iter().map(RawEvent::into_event).collect()
    }

    async fn first_available(&self) -> Result<Option<EventId>> {
        let conn = self.conn.lock().await;
        let first: Option<i64> =
            conn.query_row("SELECT MIN(event_id) FROM notification_log", [], |row| row.get(0))?;
        Ok(first.map(|id| EventId::from(id as u64)))
    }

    async fn current_id(&self) -> Result<EventId> {
        let conn = self.conn.lock().await;
        let last: Option<i64> = conn
            .query_row(
                "SELECT value_int FROM notification_sequence WHERE key = 'next_event_id'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(EventId::from(last.unwrap_or(0) as u64))
    }
}
