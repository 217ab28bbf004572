//! Event Source
//!
//! Lazy, ordered reader over the notification log. Events are pulled in
//! batches and passed through the request's filters. The reader fails
//! closed: a range that has been retired, or a hole inside the range, is an
//! error rather than an empty or shorter result.

use std::collections::VecDeque;
use std::sync::Arc;

use super::entry::ReplicationEvent;
use super::filter::{
    AndFilter, DatabaseAndTableFilter, EventBoundaryFilter, EventFilter, MessageFormatFilter,
    NamePattern,
};
use super::id::EventId;
use super::log::NotificationLog;
use crate::error::{Error, Result};

/// What to read from the log
#[derive(Debug, Clone)]
pub struct EventRequest {
    pub db: NamePattern,
    pub table: Option<NamePattern>,
    /// Read events strictly after this id
    pub after: EventId,
    /// Inclusive upper bound
    pub to: Option<EventId>,
    pub message_format: String,
    pub batch_size: usize,
}

/// Lazy cursor over filtered events
pub struct EventSource {
    log: Arc<dyn NotificationLog>,
    filter: AndFilter,
    after: EventId,
    to: Option<EventId>,
    batch_size: usize,
    /// Last raw log id consumed, filtered or not
    last_raw: EventId,
    buffer: VecDeque<ReplicationEvent>,
    started: bool,
    exhausted: bool,
}

impl EventSource {
    pub fn new(log: Arc<dyn NotificationLog>, request: EventRequest) -> Self {
        let filter = AndFilter::new()
            .with(DatabaseAndTableFilter::new(request.db, request.table))
            .with(EventBoundaryFilter::new(request.after.next(), request.to.clone()))
            .with(MessageFormatFilter::new(request.message_format));

        Self {
            log,
            filter,
            last_raw: request.after.clone(),
            after: request.after,
            to: request.to,
            batch_size: request.batch_size.max(1),
            buffer: VecDeque::new(),
            started: false,
            exhausted: false,
        }
    }

    /// Next event passing every filter, or None once the range is drained
    pub async fn next(&mut self) -> Result<Option<ReplicationEvent>> {
        if !self.started {
            self.check_retention().await?;
            self.started = true;
        }

        while self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }

        Ok(self.buffer.pop_front())
    }

    /// Drain the remaining events
    pub async fn collect(mut self) -> Result<Vec<ReplicationEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }

    async fn check_retention(&self) -> Result<()> {
        let wanted = self.after.next();
        let gap = match self.log.first_available().await? {
            Some(first) => first > wanted,
            None => self.log.current_id().await? >= wanted,
        };

        if gap {
            let oldest = match self.log.first_available().await? {
                Some(first) => first.to_string(),
                None => "none".to_string(),
            };
            tracing::warn!(
                requested = %wanted,
                oldest = %oldest,
                "Requested events have been retired from the notification log"
            );
            return Err(Error::RetentionGap {
                requested: wanted.to_string(),
                oldest,
            });
        }
        Ok(())
    }

    async fn fill(&mut self) -> Result<()> {
        let batch = self.log.fetch_after(&self.last_raw, self.batch_size).await?;
        if batch.is_empty() {
            self.exhausted = true;
            return Ok(());
        }

        for event in batch {
            if let Some(to) = &self.to {
                if event.id > *to {
                    self.exhausted = true;
                    return Ok(());
                }
            }

            let expected = self.last_raw.next();
            if event.id != expected {
                return Err(Error::EventsMissing {
                    after: self.last_raw.to_string(),
                    next: event.id.to_string(),
                });
            }
            self.last_raw = event.id.clone();

            if self.filter.accept(&event) {
                self.buffer.push_back(event);
            }
        }
        Ok(())
    }
}
