//! Server-Sent Events for import progress
//!
//! GET /import/events streams every bus event; GET /import/events/:key
//! streams the status of one job or artist and ends once it is terminal.

use axum::{
    extract::{Path, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use setlist_common::sse::{import_event, json_event, keep_alive};
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::import::parse_key;
use crate::error::ApiResult;
use crate::AppState;

/// SSE event name for per-key status updates
const STATUS_EVENT: &str = "ImportStatus";

/// GET /import/events
pub async fn import_event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("SSE client connected to import events");
    let mut rx = state.service.events().subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(sse_event) = import_event(&event) {
                        debug!(event_type = event.event_type(), "SSE: Broadcasting event");
                        yield Ok(sse_event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE client lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive())
}

/// GET /import/events/:key
///
/// Sends the current status first, then every change. A lagged receiver
/// re-reads the latest status instead of replaying what it missed.
pub async fn status_event_stream(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let key = parse_key(&key)?;
    let mut rx = state.service.subscribe(key);
    let current = state.service.status(key).await?;
    let service = state.service.clone();
    info!(key = %key, "SSE client connected to import status");

    let stream = async_stream::stream! {
        let mut finished = false;
        if let Some(status) = current {
            finished = status.is_terminal();
            if let Some(event) = json_event(STATUS_EVENT, &status) {
                yield Ok(event);
            }
        }

        while !finished {
            let status = match rx.recv().await {
                Ok(status) => status,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(key = %key, skipped, "Status stream lagged, re-reading");
                    match service.status(key).await {
                        Ok(Some(status)) => status,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Status re-read failed");
                            continue;
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            };

            finished = status.is_terminal();
            if let Some(event) = json_event(STATUS_EVENT, &status) {
                yield Ok(event);
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(keep_alive()))
}
