//! Lifecycle event schema and sinks.
//!
//! One event is emitted per supervisor state transition, correlated by the
//! execution's instance id.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub instance_id: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(instance_id: &str, from: &str, to: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
            pid: None,
            detail: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<i32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver of lifecycle events. Must tolerate calls from many threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &LifecycleEvent);
}

/// Writes each event as one JSON line through the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &LifecycleEvent) {
        match serde_json::to_string(event) {
            Ok(line) => log::info!(target: "jailbox::events", "{}", line),
            Err(e) => log::error!("Failed to serialize lifecycle event: {}", e),
        }
    }
}

/// Keeps events in memory, for tests and embedding callers
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// `(from, to)` pairs for one execution, in emission order
    pub fn transitions(&self, instance_id: &str) -> Vec<(String, String)> {
        self.events()
            .into_iter()
            .filter(|e| e.instance_id == instance_id)
            .map(|e| (e.from, e.to))
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_without_empty_fields() {
        let event = LifecycleEvent::new("abc", "preparing", "running");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["from"], "preparing");
        assert_eq!(json["to"], "running");
        assert!(json.get("pid").is_none());
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_memory_sink_filters_by_instance() {
        let sink = MemorySink::new();
        sink.emit(&LifecycleEvent::new("a", "preparing", "running"));
        sink.emit(&LifecycleEvent::new("b", "preparing", "spawn_failed").with_detail("boom"));
        sink.emit(&LifecycleEvent::new("a", "running", "completed").with_pid(Some(42)));

        assert_eq!(
            sink.transitions("a"),
            vec![
                ("preparing".to_string(), "running".to_string()),
                ("running".to_string(), "completed".to_string())
            ]
        );
        assert_eq!(sink.events().len(), 3);
    }
}
