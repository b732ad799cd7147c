//! Import API handlers
//!
//! POST /import, GET /import/status/:key, GET /import/jobs/:job_id,
//! POST /import/jobs/:job_id/cancel, POST /import/sync

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use setlist_common::events::ImportStatus;
use setlist_common::human_time::format_duration;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::ledger::estimate_time_remaining;
use crate::queue::{JobPriority, QueueJobRecord};
use crate::service::StartImportOptions;
use crate::AppState;

/// POST /import request
#[derive(Debug, Deserialize)]
pub struct StartImportRequest {
    pub attraction_id: String,
    #[serde(default)]
    pub admin_import: bool,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub priority: Option<JobPriority>,
}

/// POST /import response
#[derive(Debug, Serialize)]
pub struct StartImportResponse {
    pub job_id: Uuid,
    pub artist_id: Uuid,
    pub slug: String,
    pub created: bool,
    pub phase1_ms: u64,
}

/// GET /import/status/:key response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: ImportStatus,
    pub eta_ms: u64,
    /// ETA formatted for display
    pub eta: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkSyncRequest {
    /// Empty means every known artist
    #[serde(default)]
    pub artist_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BulkSyncResponse {
    pub job_ids: Vec<Uuid>,
}

pub(crate) fn parse_key(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("not a job or artist id: {raw}")))
}

/// POST /import
///
/// Runs the identifier phase, then returns 202 with the job id while the
/// remaining phases run in the background.
pub async fn start_import(
    State(state): State<AppState>,
    Json(request): Json<StartImportRequest>,
) -> ApiResult<(StatusCode, Json<StartImportResponse>)> {
    let outcome = state
        .service
        .start_import(
            &request.attraction_id,
            StartImportOptions {
                priority: request.priority,
                admin_import: request.admin_import,
                user_id: request.user_id,
            },
        )
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartImportResponse {
            job_id: outcome.job_id,
            artist_id: outcome.artist_id,
            slug: outcome.slug,
            created: outcome.created,
            phase1_ms: outcome.phase1_duration.as_millis() as u64,
        }),
    ))
}

/// GET /import/status/:key
///
/// `key` is a job id or an artist id; an artist id resolves to its most
/// recent import.
pub async fn get_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let key = parse_key(&key)?;
    let status = state
        .service
        .status(key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no import status for {key}")))?;

    let eta = estimate_time_remaining(&status);
    Ok(Json(StatusResponse {
        eta_ms: eta.as_millis() as u64,
        eta: format_duration(eta),
        status,
    }))
}

/// GET /import/jobs/:job_id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<QueueJobRecord>> {
    let job_id = parse_key(&job_id)?;
    state
        .service
        .job(job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no job {job_id}")))
}

/// POST /import/jobs/:job_id/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job_id = parse_key(&job_id)?;
    if state.service.job(job_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("no job {job_id}")));
    }
    let cancelled = state.service.cancel(job_id).await?;
    Ok(Json(serde_json::json!({ "job_id": job_id, "cancelled": cancelled })))
}

/// POST /import/sync
pub async fn bulk_sync(
    State(state): State<AppState>,
    Json(request): Json<BulkSyncRequest>,
) -> ApiResult<(StatusCode, Json<BulkSyncResponse>)> {
    let job_ids = if request.artist_ids.is_empty() {
        state.service.schedule_stale_sync().await?
    } else {
        state.service.schedule_bulk_sync(&request.artist_ids).await?
    };
    Ok((StatusCode::ACCEPTED, Json(BulkSyncResponse { job_ids })))
}

pub fn import_routes() -> Router<AppState> {
    Router::new()
        .route("/import", post(start_import))
        .route("/import/status/:key", get(get_status))
        .route("/import/jobs/:job_id", get(get_job))
        .route("/import/jobs/:job_id/cancel", post(cancel_job))
        .route("/import/sync", post(bulk_sync))
}
