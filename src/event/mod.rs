//! Event Source Adapter
//!
//! Ordered change events pulled from the metadata service's notification
//! log, with db/table, id-range and message-format filtering.

pub mod entry;
pub mod filter;
pub mod id;
pub mod log;
pub mod source;

pub use entry::{EventMessage, EventType, FileRef, ReplicationEvent};
pub use filter::{EventFilter, NamePattern};
pub use id::{compare_numeric, sort_numeric, EventId};
pub use log::{NewEvent, NotificationLog, SqliteNotificationLog};
pub use source::{EventRequest, EventSource};

/// Message format written by this version of the source
pub const JSON_MESSAGE_FORMAT: &str = "json-0.2";
