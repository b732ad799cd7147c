//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::error::ApiResult;
use crate::queue::QueueCounts;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok", or "degraded" while any dependency circuit is not closed
    pub status: String,
    pub module: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub breakers: Vec<BreakerSnapshot>,
    pub queues: BTreeMap<String, QueueCounts>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let breakers = state.service.breaker_snapshots();
    let queues = state
        .service
        .queue_counts()?
        .into_iter()
        .map(|(name, counts)| (name.to_string(), counts))
        .collect();

    let degraded = breakers.iter().any(|b| b.state != CircuitState::Closed);

    Ok(Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        module: "setlist-import".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        breakers,
        queues,
    }))
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
