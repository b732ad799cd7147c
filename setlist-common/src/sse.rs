//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE helpers for the setlist services.

use axum::response::sse::{Event, KeepAlive};
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

use crate::events::ImportEvent;

/// Heartbeat interval for all SSE streams
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Keep-alive policy shared by all SSE endpoints
pub fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat")
}

/// Serialize `payload` as an SSE event named `event_type`
///
/// Returns `None` (after logging) if the payload cannot be serialized.
pub fn json_event<T: Serialize>(event_type: &str, payload: &T) -> Option<Event> {
    match serde_json::to_string(payload) {
        Ok(json) => Some(Event::default().event(event_type).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}

/// Convert a bus event into an SSE event
pub fn import_event(event: &ImportEvent) -> Option<Event> {
    json_event(event.event_type(), event)
}
