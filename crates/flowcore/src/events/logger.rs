use crate::{LogEntry, LogLevel, NodeId};
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for node-scoped log entries
pub trait LogSink: Send + Sync {
    fn record(&self, entry: LogEntry);
}

/// Forwards entries to `tracing`. Used by contexts that are not part of a run.
struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, entry: LogEntry) {
        let node_id = entry.node_id.as_deref().unwrap_or("-");
        match entry.level {
            LogLevel::Debug => tracing::debug!(node_id, "{}", entry.message),
            LogLevel::Info => tracing::info!(node_id, "{}", entry.message),
            LogLevel::Warning => tracing::warn!(node_id, "{}", entry.message),
            LogLevel::Error => tracing::error!(node_id, "{}", entry.message),
        }
    }
}

/// Keeps entries in memory
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.message).collect()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Log handle given to nodes. Entries land in the node's execution record and on the event bus.
#[derive(Clone)]
pub struct NodeLogger {
    node_id: NodeId,
    scope: Option<String>,
    sink: Arc<dyn LogSink>,
}

impl NodeLogger {
    pub fn new(node_id: impl Into<NodeId>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            node_id: node_id.into(),
            scope: None,
            sink,
        }
    }

    pub fn detached(node_id: impl Into<NodeId>) -> Self {
        Self::new(node_id, Arc::new(TracingSink))
    }

    /// Logger for a nested invocation. Entries stay attributed to this node, prefixed by `label`.
    pub fn scoped(&self, label: &str) -> Self {
        let scope = match &self.scope {
            Some(parent) => format!("{}/{}", parent, label),
            None => label.to_string(),
        };
        Self {
            node_id: self.node_id.clone(),
            scope: Some(scope),
            sink: self.sink.clone(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<serde_json::Value>) {
        let message = match &self.scope {
            Some(scope) => format!("[{}] {}", scope, message.into()),
            None => message.into(),
        };
        let mut entry = LogEntry::new(level, message).with_node(self.node_id.clone());
        entry.data = data;
        self.sink.record(entry);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None);
    }

    /// Emit progress update
    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.log(
            LogLevel::Info,
            message.unwrap_or_else(|| format!("{:.0}%", percent)),
            Some(serde_json::json!({ "progress": percent })),
        );
    }

    /// Info entry with an attached value
    pub fn data(&self, message: impl Into<String>, value: serde_json::Value) {
        self.log(LogLevel::Info, message, Some(value));
    }
}
