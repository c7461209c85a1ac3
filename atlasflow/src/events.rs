//! Event sink trait and implementations.
//!
//! The coordinator and orchestrators emit structured events through a sink
//! so operational consumers (logs, analytics, tests) observe pipeline
//! progress without being wired into control flow. Canonical event names are
//! dotted lowercase: `entity.registered`, `pipeline.started`,
//! `stage.started`, `stage.completed`, `stage.failed`, `stage.cancelled`,
//! `stage.redrive`, `activity.replayed`, `activity.retry`,
//! `compensation.started`, `compensation.completed`, `compensation.failed`,
//! `signal.accepted`, `signal.rejected`, `signal.dropped`,
//! `entity.transitioned`.

use async_trait::async_trait;
use tracing::{debug, info, Level};

/// Trait for sinks that receive pipeline events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>);

    /// Emits an event without awaiting. Must never fail; sinks log and
    /// swallow their own errors.
    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>);
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<serde_json::Value>) {}
}

/// A sink that forwards events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: &Option<serde_json::Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "pipeline event");
        } else {
            info!(event_type = %event_type, event_data = ?data, "pipeline event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.log_event(event_type, &data);
    }
}

/// A sink that records events in memory, for tests and assertions.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<(String, Option<serde_json::Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<serde_json::Value>)> {
        self.events.read().clone()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Discards all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<serde_json::Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }

    /// Number of events with exactly this type.
    #[must_use]
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }

    fn try_emit(&self, event_type: &str, data: Option<serde_json::Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit("stage.started", None).await;
        sink.try_emit("stage.started", Some(serde_json::json!({"stage": "extract"})));
    }

    #[tokio::test]
    async fn test_logging_sink_does_not_panic() {
        let sink = LoggingEventSink::default();
        sink.emit("stage.completed", Some(serde_json::json!({"stage": "confer"}))).await;
        sink.try_emit("stage.completed", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_records_in_order() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("pipeline.started", None).await;
        sink.try_emit("stage.started", Some(serde_json::json!({"stage": "prospect"})));

        assert_eq!(sink.len(), 2);
        let events = sink.events();
        assert_eq!(events[0].0, "pipeline.started");
        assert_eq!(events[1].0, "stage.started");
    }

    #[tokio::test]
    async fn test_collecting_sink_filters() {
        let sink = CollectingEventSink::new();
        sink.emit("stage.started", None).await;
        sink.emit("stage.completed", None).await;
        sink.emit("signal.accepted", None).await;

        assert_eq!(sink.events_of_type("stage.").len(), 2);
        assert_eq!(sink.count_of("signal.accepted"), 1);
        assert_eq!(sink.count_of("signal.rejected"), 0);

        sink.clear();
        assert!(sink.is_empty());
    }
}
