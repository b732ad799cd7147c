//! Event types for the setlist event system
//!
//! Provides the shared `ImportEvent` enum and the broadcast `EventBus` used
//! for the global progress channel.

mod import_types;

pub use import_types::{ImportStage, ImportStatus, ImportTotals, PhaseOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events published by the import pipeline
///
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ImportEvent {
    /// An import status record changed
    ImportStatusChanged {
        status: ImportStatus,
        timestamp: DateTime<Utc>,
    },

    /// A queued job moved between queue states
    QueueJobStateChanged {
        queue: String,
        job_id: Uuid,
        /// waiting, delayed, active, completed, failed
        state: String,
        attempts_made: u32,
        timestamp: DateTime<Utc>,
    },

    /// A dependency's circuit breaker changed state
    CircuitStateChanged {
        dependency: String,
        /// closed, open, half-open
        state: String,
        timestamp: DateTime<Utc>,
    },
}

impl ImportEvent {
    /// SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            ImportEvent::ImportStatusChanged { .. } => "ImportStatusChanged",
            ImportEvent::QueueJobStateChanged { .. } => "QueueJobStateChanged",
            ImportEvent::CircuitStateChanged { .. } => "CircuitStateChanged",
        }
    }
}

/// Broadcast bus for `ImportEvent`
///
/// Slow subscribers lose the oldest events (`RecvError::Lagged`); progress
/// consumers are expected to tolerate gaps and re-read status.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ImportEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ImportEvent,
    ) -> Result<usize, broadcast::error::SendError<ImportEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ImportEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(ImportEvent::CircuitStateChanged {
            dependency: "catalog".to_string(),
            state: "open".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "CircuitStateChanged");
    }

    #[test]
    fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(4);
        let result = bus.emit(ImportEvent::QueueJobStateChanged {
            queue: "artist-import".to_string(),
            job_id: Uuid::new_v4(),
            state: "waiting".to_string(),
            attempts_made: 0,
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ImportEvent::ImportStatusChanged {
            status: ImportStatus::new(Uuid::new_v4()),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ImportStatusChanged");
        assert_eq!(json["status"]["stage"], "initializing");
    }
}
