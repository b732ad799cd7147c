//! Import status persistence
//!
//! Durable side of the status ledger; one row per import job.

use chrono::{DateTime, Utc};
use setlist_common::events::ImportStatus;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_opt_timestamp, parse_opt_uuid, parse_timestamp, parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::utils::retry_on_lock;

const STATUS_COLUMNS: &str = "job_id, artist_id, attraction_id, stage, progress_percent, \
     message, error, totals, phase_timings, phase_outcomes, started_at, updated_at, completed_at";

fn status_from_row(row: &SqliteRow) -> ImportResult<ImportStatus> {
    let stage: String = row.get("stage");
    let totals: String = row.get("totals");
    let timings: String = row.get("phase_timings");
    let outcomes: String = row.get("phase_outcomes");

    Ok(ImportStatus {
        job_id: parse_uuid("import_status.job_id", row.get("job_id"))?,
        artist_id: parse_opt_uuid("import_status.artist_id", row.get("artist_id"))?,
        attraction_id: row.get("attraction_id"),
        stage: stage.parse().map_err(ImportError::Persistence)?,
        progress_percent: row.get::<i64, _>("progress_percent").clamp(0, 100) as u8,
        message: row.get("message"),
        error: row.get("error"),
        totals: serde_json::from_str(&totals)?,
        phase_timings: serde_json::from_str(&timings)?,
        phase_outcomes: serde_json::from_str(&outcomes)?,
        started_at: parse_timestamp("import_status.started_at", row.get("started_at"))?,
        updated_at: parse_timestamp("import_status.updated_at", row.get("updated_at"))?,
        completed_at: parse_opt_timestamp("import_status.completed_at", row.get("completed_at"))?,
    })
}

pub async fn upsert(db: &Db, status: &ImportStatus) -> ImportResult<()> {
    let job_id = status.job_id.to_string();
    let artist_id = status.artist_id.map(|a| a.to_string());
    let totals = serde_json::to_string(&status.totals)?;
    let timings = serde_json::to_string(&status.phase_timings)?;
    let outcomes = serde_json::to_string(&status.phase_outcomes)?;
    let started_at = status.started_at.to_rfc3339();
    let updated_at = status.updated_at.to_rfc3339();
    let completed_at = status.completed_at.map(|t| t.to_rfc3339());

    let sql = format!(
            r#"
            INSERT INTO import_status ({STATUS_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                artist_id = excluded.artist_id,
                attraction_id = excluded.attraction_id,
                stage = excluded.stage,
                progress_percent = excluded.progress_percent,
                message = excluded.message,
                error = excluded.error,
                totals = excluded.totals,
                phase_timings = excluded.phase_timings,
                phase_outcomes = excluded.phase_outcomes,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at
            "#
        );

    retry_on_lock("upsert_import_status", db.max_lock_wait_ms(), || {
        sqlx::query(&sql)
        .bind(&job_id)
        .bind(&artist_id)
        .bind(&status.attraction_id)
        .bind(status.stage.as_str())
        .bind(i64::from(status.progress_percent))
        .bind(&status.message)
        .bind(&status.error)
        .bind(&totals)
        .bind(&timings)
        .bind(&outcomes)
        .bind(&started_at)
        .bind(&updated_at)
        .bind(&completed_at)
        .execute(db.pool())
    })
    .await?;
    Ok(())
}

pub async fn get(db: &Db, job_id: Uuid) -> ImportResult<Option<ImportStatus>> {
    let row = sqlx::query(&format!(
        "SELECT {STATUS_COLUMNS} FROM import_status WHERE job_id = ?"
    ))
    .bind(job_id.to_string())
    .fetch_optional(db.pool())
    .await?;
    row.as_ref().map(status_from_row).transpose()
}

/// Most recently updated status of any job for the artist
pub async fn latest_for_artist(db: &Db, artist_id: Uuid) -> ImportResult<Option<ImportStatus>> {
    let row = sqlx::query(&format!(
        "SELECT {STATUS_COLUMNS} FROM import_status WHERE artist_id = ? \
         ORDER BY updated_at DESC LIMIT 1"
    ))
    .bind(artist_id.to_string())
    .fetch_optional(db.pool())
    .await?;
    row.as_ref().map(status_from_row).transpose()
}

/// Terminal records last updated before `cutoff`
pub async fn list_expired(db: &Db, cutoff: DateTime<Utc>) -> ImportResult<Vec<(Uuid, Option<Uuid>)>> {
    let rows = sqlx::query(
        "SELECT job_id, artist_id FROM import_status \
         WHERE stage IN ('completed', 'failed') AND updated_at < ?",
    )
    .bind(cutoff.to_rfc3339())
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            Ok((
                parse_uuid("import_status.job_id", row.get("job_id"))?,
                parse_opt_uuid("import_status.artist_id", row.get("artist_id"))?,
            ))
        })
        .collect()
}

/// Delete a record only if it is still terminal and older than `cutoff`
///
/// Returns whether a row was removed. The condition is re-evaluated by the
/// DELETE itself so a record revived by a concurrent update survives.
pub async fn delete_if_expired(db: &Db, job_id: Uuid, cutoff: DateTime<Utc>) -> ImportResult<bool> {
    let id = job_id.to_string();
    let cutoff = cutoff.to_rfc3339();

    let result = retry_on_lock("delete_import_status", db.max_lock_wait_ms(), || {
        sqlx::query(
            "DELETE FROM import_status \
             WHERE job_id = ? AND stage IN ('completed', 'failed') AND updated_at < ?",
        )
        .bind(&id)
        .bind(&cutoff)
        .execute(db.pool())
    })
    .await?;
    Ok(result.rows_affected() > 0)
}
