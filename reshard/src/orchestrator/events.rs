//! Progress events published by the migrators.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

/// One progress update. `status` is `start`, a phase description,
/// `finished`, or `failed: <error>`.
#[derive(Debug, Clone)]
pub struct Event {
    pub operation: &'static str,
    pub keyspace: String,
    pub shard: String,
    pub status: String,
}

pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: Event);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl EventSink for LogSink {
    fn dispatch(&self, event: Event) {
        info!(
            operation = event.operation,
            keyspace = %event.keyspace,
            shard = %event.shard,
            "{}",
            event.status
        );
    }
}

/// Keeps every event around for inspection.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.status.clone()).collect()
    }
}

impl EventSink for RecordingSink {
    fn dispatch(&self, event: Event) {
        self.events.lock().push(event);
    }
}
