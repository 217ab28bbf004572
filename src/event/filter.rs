//! Event Filters
//!
//! Predicates applied to the notification log. The source combines them
//! with [`AndFilter`]; an event is delivered only if every filter accepts it.

use super::entry::ReplicationEvent;
use super::id::EventId;

/// Predicate over replication events
pub trait EventFilter: Send + Sync {
    fn accept(&self, event: &ReplicationEvent) -> bool;
}

/// Case-insensitive name pattern: `*` matches any run, `|` separates alternatives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePattern {
    alternatives: Vec<String>,
}

impl NamePattern {
    pub fn parse(pattern: &str) -> Self {
        let alternatives = pattern
            .split('|')
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        Self { alternatives }
    }

    /// Pattern matching every name
    pub fn any() -> Self {
        Self {
            alternatives: vec!["*".to_string()],
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.alternatives.iter().any(|alt| glob_match(alt, &name))
    }

    /// The single name this pattern denotes, if it is not a real pattern
    pub fn as_literal(&self) -> Option<&str> {
        match self.alternatives.as_slice() {
            [only] if !only.contains('*') => Some(only),
            _ => None,
        }
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// Restricts events to a database and optionally a table
///
/// Without a table pattern every event of the database passes. With one,
/// only events naming a matching table pass; database-scoped events do not.
pub struct DatabaseAndTableFilter {
    db: NamePattern,
    table: Option<NamePattern>,
}

impl DatabaseAndTableFilter {
    pub fn new(db: NamePattern, table: Option<NamePattern>) -> Self {
        Self { db, table }
    }
}

impl EventFilter for DatabaseAndTableFilter {
    fn accept(&self, event: &ReplicationEvent) -> bool {
        if !self.db.matches(&event.db) {
            return false;
        }
        match (&self.table, &event.table) {
            (None, _) => true,
            (Some(pattern), Some(table)) => pattern.matches(table),
            (Some(_), None) => false,
        }
    }
}

/// Inclusive id range; an open upper bound reaches the newest event
pub struct EventBoundaryFilter {
    from: EventId,
    to: Option<EventId>,
}

impl EventBoundaryFilter {
    pub fn new(from: EventId, to: Option<EventId>) -> Self {
        Self { from, to }
    }
}

impl EventFilter for EventBoundaryFilter {
    fn accept(&self, event: &ReplicationEvent) -> bool {
        event.id >= self.from && self.to.as_ref().map_or(true, |to| event.id <= *to)
    }
}

/// Rejects events encoded with a different message format
pub struct MessageFormatFilter {
    format: String,
}

impl MessageFormatFilter {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }
}

impl EventFilter for MessageFormatFilter {
    fn accept(&self, event: &ReplicationEvent) -> bool {
        event.message_format == self.format
    }
}

/// Conjunction of filters
#[derive(Default)]
pub struct AndFilter {
    filters: Vec<Box<dyn EventFilter>>,
}

impl AndFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl EventFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }
}

impl EventFilter for AndFilter {
    fn accept(&self, event: &ReplicationEvent) -> bool {
        self.filters.iter().all(|f| f.accept(event))
    }
}
