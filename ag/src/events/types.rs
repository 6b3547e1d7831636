//! Event types for scheduler activity
//!
//! These events represent every observable step of a request:
//! - Admission (dispatch of the underlying operation)
//! - Completion (success or failure)
//! - Queue drained (nothing queued, nothing in flight)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of distinct [`EventKind`]s
pub(crate) const KIND_COUNT: usize = 4;

/// Named event kinds observers can subscribe to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sent,
    Received,
    Error,
    Drained,
}

impl EventKind {
    /// All kinds, in index order
    pub const ALL: [EventKind; KIND_COUNT] = [EventKind::Sent, EventKind::Received, EventKind::Error, EventKind::Drained];

    pub(crate) fn index(self) -> usize {
        match self {
            EventKind::Sent => 0,
            EventKind::Received => 1,
            EventKind::Error => 2,
            EventKind::Drained => 3,
        }
    }

    /// Lowercase name as used on the wire
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::Received => "received",
            EventKind::Error => "error",
            EventKind::Drained => "drained",
        }
    }
}

/// Core event enum - the vocabulary of scheduler activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SchedulerEvent {
    /// A request was admitted and its operation dispatched
    Sent { request_id: u64, lane: Option<String> },
    /// A dispatched operation completed, successfully or not
    Received {
        request_id: u64,
        lane: Option<String>,
        success: bool,
    },
    /// A dispatched operation failed
    Error {
        request_id: u64,
        lane: Option<String>,
        message: String,
    },
    /// Queue empty and nothing in flight
    Drained,
}

impl SchedulerEvent {
    /// Get the request ID for this event, if it concerns a single request
    pub fn request_id(&self) -> Option<u64> {
        match self {
            SchedulerEvent::Sent { request_id, .. }
            | SchedulerEvent::Received { request_id, .. }
            | SchedulerEvent::Error { request_id, .. } => Some(*request_id),
            SchedulerEvent::Drained => None,
        }
    }

    /// Get the kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Sent { .. } => EventKind::Sent,
            SchedulerEvent::Received { .. } => EventKind::Received,
            SchedulerEvent::Error { .. } => EventKind::Error,
            SchedulerEvent::Drained => EventKind::Drained,
        }
    }

    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        self.kind().name()
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Timestamp of the event
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: SchedulerEvent,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: SchedulerEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_request_id() {
        let event = SchedulerEvent::Sent {
            request_id: 7,
            lane: None,
        };
        assert_eq!(event.request_id(), Some(7));
        assert_eq!(SchedulerEvent::Drained.request_id(), None);
    }

    #[test]
    fn test_event_type() {
        let event = SchedulerEvent::Received {
            request_id: 1,
            lane: Some("uploads".to_string()),
            success: false,
        };
        assert_eq!(event.event_type(), "received");
        assert_eq!(event.kind(), EventKind::Received);
    }

    #[test]
    fn test_kind_indices_are_distinct() {
        let mut seen = [false; KIND_COUNT];
        for kind in EventKind::ALL {
            assert!(!seen[kind.index()]);
            seen[kind.index()] = true;
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = SchedulerEvent::Error {
            request_id: 3,
            lane: Some("a".to_string()),
            message: "connection reset".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"Error""#));
        assert!(json.contains("connection reset"));

        let parsed: SchedulerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_log_entry() {
        let entry = EventLogEntry::new(SchedulerEvent::Drained);

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("ts"));
        assert!(json.contains("Drained"));
    }
}
