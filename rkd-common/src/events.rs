//! Event types for the sync engine
//!
//! The engine announces lifecycle changes on an [`EventBus`]. Observers
//! (presentation layer, diagnostics, tests) subscribe; the engine never
//! waits on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::identity::{Identifier, RemoteEntitySummary, Variant};

/// Sync engine event types
///
/// Serialized with a `type` tag so events can be forwarded over SSE or logged
/// as JSON unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Debounced lookup produced a definite answer for a candidate
    LookupResolved {
        candidate: String,
        exists: bool,
        timestamp: DateTime<Utc>,
    },

    /// A streaming ingestion session opened its transport
    SessionStarted {
        session_id: Uuid,
        identifier: Identifier,
        variant: Variant,
        timestamp: DateTime<Utc>,
    },

    /// The stream confirmed the entity before statistics were ready
    IdentityConfirmed {
        session_id: Uuid,
        summary: RemoteEntitySummary,
        timestamp: DateTime<Utc>,
    },

    /// Progress within the current session
    ProgressUpdated {
        session_id: Uuid,
        current_unit: u32,
        total_units: u32,
        label: String,
        from_cache: bool,
    },

    /// Session assembled a complete result
    SessionCompleted {
        session_id: Uuid,
        identifier: Identifier,
        variant: Variant,
        from_cache: bool,
        timestamp: DateTime<Utc>,
    },

    /// Session terminated with a user-visible error
    SessionFailed {
        session_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Session was superseded or explicitly cancelled
    SessionCancelled {
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Server preferences were merged into the local record
    PreferencesReconciled {
        identifier: Identifier,
        onboarding_complete: bool,
        timestamp: DateTime<Utc>,
    },

    /// Liveness report posted
    HeartbeatSent {
        identifier: Identifier,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    /// Stable event name (matches the serde tag)
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::LookupResolved { .. } => "LookupResolved",
            SyncEvent::SessionStarted { .. } => "SessionStarted",
            SyncEvent::IdentityConfirmed { .. } => "IdentityConfirmed",
            SyncEvent::ProgressUpdated { .. } => "ProgressUpdated",
            SyncEvent::SessionCompleted { .. } => "SessionCompleted",
            SyncEvent::SessionFailed { .. } => "SessionFailed",
            SyncEvent::SessionCancelled { .. } => "SessionCancelled",
            SyncEvent::PreferencesReconciled { .. } => "PreferencesReconciled",
            SyncEvent::HeartbeatSent { .. } => "HeartbeatSent",
        }
    }
}

/// Broadcast bus for [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lag and lose the oldest events once `capacity` is
    /// exceeded; the engine is never blocked.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = SyncEvent::SessionCancelled {
            session_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SessionCancelled");
        assert_eq!(event.event_type(), "SessionCancelled");
    }

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit_lossy(SyncEvent::HeartbeatSent {
            identifier: Identifier::parse("magnus").unwrap(),
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "HeartbeatSent");
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit_lossy(SyncEvent::SessionCancelled {
            session_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        });
    }
}
