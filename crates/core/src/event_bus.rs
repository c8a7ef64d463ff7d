//! Engine events and the sinks they are published to.
//!
//! Every scheduler and controller holds an `Arc<dyn EventSink>`; the host
//! decides where events go. The binary logs them, tests capture them.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::types::{EngineEvent, EventType, Tenant};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Drops everything.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Writes each event as a structured log line, stamped with this node's id.
pub struct TracingSink {
    node_id: String,
}

impl TracingSink {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, mut event: EngineEvent) {
        event.node_id.clone_from(&self.node_id);
        info!(
            target: "chatflow::events",
            event_id = %event.event_id,
            event_type = ?event.event_type,
            account_id = event.tenant.as_ref().map(|t| t.account_id.as_str()).unwrap_or("-"),
            subject_id = %event.subject_id,
            recipient = event.recipient.as_deref().unwrap_or("-"),
            node_id = %event.node_id,
            at = %event.timestamp,
            "engine event"
        );
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn of_type(&self, event_type: EventType) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.of_type(event_type).len()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// Builds an event stamped now. `subject_id` names the flow, broadcast or
/// scheduled message the event is about.
pub fn make_event(
    event_type: EventType,
    tenant: Option<&Tenant>,
    subject_id: impl Into<String>,
    recipient: Option<&str>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        tenant: tenant.cloned(),
        subject_id: subject_id.into(),
        recipient: recipient.map(str::to_string),
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink_filters_by_type() {
        let sink = capture_sink();
        let tenant = Tenant::new("acct", "dev");

        sink.emit(make_event(
            EventType::FlowEngaged,
            Some(&tenant),
            "flow-1",
            Some("15550001"),
        ));
        sink.emit(make_event(EventType::MessageSent, Some(&tenant), "msg-1", None));
        sink.emit(make_event(EventType::MessageSent, Some(&tenant), "msg-2", None));

        assert_eq!(sink.count(), 3);
        assert_eq!(sink.count_type(EventType::FlowEngaged), 1);
        let sent = sink.of_type(EventType::MessageSent);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].subject_id, "msg-2");
        assert_eq!(sink.events()[0].recipient.as_deref(), Some("15550001"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_log_and_noop_sinks_accept_events() {
        TracingSink::new("node-07").emit(make_event(EventType::BroadcastStarted, None, "b-1", None));
        noop_sink().emit(make_event(EventType::BroadcastDeleted, None, "b-1", None));
    }
}
