//! setlist-import library interface
//!
//! Background import of concert data: artists from a ticketing provider,
//! songs from a music catalog and past setlists from a setlist archive.
//! Exposes the service, its building blocks and the HTTP router.

pub mod adapters;
pub mod api;
pub mod breaker;
pub mod cache;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod service;
pub mod upstream;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, ImportError, ImportResult};
pub use crate::service::{ImportService, StartImportOptions, StartImportOutcome};

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: ImportService,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: ImportService) -> Self {
        Self {
            service,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::import_routes())
        .route("/import/events", get(api::import_event_stream))
        .route("/import/events/:key", get(api::status_event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
