//! Recent master log lines, served by `GET /logs`
//!
//! [`LogBuffer::layer`] plugs into the tracing subscriber; every event is
//! numbered and kept until the buffer wraps.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Lines kept when no capacity is given
pub const DEFAULT_LOG_CAPACITY: usize = 5_000;

/// One captured log line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Position in the stream, starting at 0
    pub id: u64,
    pub time: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Which entries to return
#[derive(Debug, Clone, Copy, Default)]
pub struct LogQuery {
    /// Only ids strictly above this one
    pub greater_than_id: Option<u64>,
    /// Only ids strictly below this one
    pub less_than_id: Option<u64>,
    /// Only the last `tail` matches
    pub tail: Option<usize>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    next_id: u64,
    capacity: usize,
}

/// Bounded, shared ring of log entries
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LogBuffer")
            .field("len", &inner.entries.len())
            .field("next_id", &inner.next_id)
            .field("capacity", &inner.capacity)
            .finish()
    }
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_id: 0,
                capacity,
            })),
        }
    }

    /// Tracing layer feeding this buffer
    pub fn layer(&self) -> LogBufferLayer {
        LogBufferLayer {
            buffer: self.clone(),
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, level: &str, target: &str, message: String) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.entries.len() == inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(LogEntry {
            id,
            time: Utc::now(),
            level: level.to_string(),
            target: target.to_string(),
            message,
        });
        id
    }

    /// Entries matching `query`, oldest first
    pub fn entries(&self, query: LogQuery) -> Vec<LogEntry> {
        let inner = self.inner.lock();
        let matching: Vec<&LogEntry> = inner
            .entries
            .iter()
            .filter(|e| query.greater_than_id.map_or(true, |id| e.id > id))
            .filter(|e| query.less_than_id.map_or(true, |id| e.id < id))
            .collect();
        let skip = query
            .tail
            .map_or(0, |tail| matching.len().saturating_sub(tail));
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// Number of retained entries
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Layer created by [`LogBuffer::layer`]
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl<S: Subscriber> Layer<S> for LogBufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        self.buffer.push(
            metadata.level().as_str(),
            metadata.target(),
            visitor.into_message(),
        );
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn into_message(self) -> String {
        let mut message = self.message.unwrap_or_default();
        for field in self.fields {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(&field);
        }
        message
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }
}
