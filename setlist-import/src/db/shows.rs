//! Show database operations

use chrono::{NaiveDate, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::models::{Show, ShowOrigin};
use crate::utils::retry_on_lock;

const SHOW_COLUMNS: &str = "id, artist_id, external_id, origin, name, date, start_time, \
     status, url, tour_name, venue_id, venue_external_id";

fn show_from_row(row: &SqliteRow) -> ImportResult<Show> {
    let origin: String = row.get("origin");
    let date: Option<String> = row.get("date");
    Ok(Show {
        id: parse_uuid("shows.id", row.get("id"))?,
        artist_id: parse_uuid("shows.artist_id", row.get("artist_id"))?,
        external_id: row.get("external_id"),
        origin: origin.parse().map_err(ImportError::Persistence)?,
        name: row.get("name"),
        date: date
            .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| ImportError::Persistence(format!("invalid shows.date: {e}")))?,
        start_time: row.get("start_time"),
        status: row.get("status"),
        url: row.get("url"),
        tour_name: row.get("tour_name"),
        venue_id: parse_opt_uuid("shows.venue_id", row.get("venue_id"))?,
        venue_external_id: row.get("venue_external_id"),
    })
}

/// Insert or refresh a show by external id, returning the stored row id
///
/// A known `venue_id` is never replaced by an unresolved one.
pub async fn upsert(db: &Db, show: &Show) -> ImportResult<Uuid> {
    let id = show.id.to_string();
    let artist_id = show.artist_id.to_string();
    let date = show.date.map(|d| d.format("%Y-%m-%d").to_string());
    let venue_id = show.venue_id.map(|v| v.to_string());
    let now = Utc::now().to_rfc3339();

    retry_on_lock("upsert_show", db.max_lock_wait_ms(), || {
        sqlx::query(
            r#"
            INSERT INTO shows (
                id, artist_id, external_id, origin, name, date, start_time,
                status, url, tour_name, venue_id, venue_external_id, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                date = COALESCE(excluded.date, shows.date),
                start_time = COALESCE(excluded.start_time, shows.start_time),
                status = COALESCE(excluded.status, shows.status),
                url = COALESCE(excluded.url, shows.url),
                tour_name = COALESCE(excluded.tour_name, shows.tour_name),
                venue_id = COALESCE(excluded.venue_id, shows.venue_id),
                venue_external_id = COALESCE(excluded.venue_external_id, shows.venue_external_id),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&artist_id)
        .bind(&show.external_id)
        .bind(show.origin.as_str())
        .bind(&show.name)
        .bind(&date)
        .bind(&show.start_time)
        .bind(&show.status)
        .bind(&show.url)
        .bind(&show.tour_name)
        .bind(&venue_id)
        .bind(&show.venue_external_id)
        .bind(&now)
        .execute(db.pool())
    })
    .await?;

    let stored: String = sqlx::query_scalar("SELECT id FROM shows WHERE external_id = ?")
        .bind(&show.external_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| {
            ImportError::Persistence(format!("show {} missing after upsert", show.external_id))
        })?;
    parse_uuid("shows.id", &stored)
}

/// Attach a resolved venue to every show of the artist that references it
pub async fn link_venue(
    db: &Db,
    artist_id: Uuid,
    venue_external_id: &str,
    venue_id: Uuid,
) -> ImportResult<u64> {
    let artist_id = artist_id.to_string();
    let venue_id = venue_id.to_string();

    let result = retry_on_lock("link_show_venue", db.max_lock_wait_ms(), || {
        sqlx::query(
            "UPDATE shows SET venue_id = ?, updated_at = ? \
             WHERE artist_id = ? AND venue_external_id = ? AND venue_id IS NULL",
        )
        .bind(&venue_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&artist_id)
        .bind(venue_external_id)
        .execute(db.pool())
    })
    .await?;
    Ok(result.rows_affected())
}

/// Distinct venue references not yet resolved to a venue row
pub async fn unresolved_venue_ids(db: &Db, artist_id: Uuid) -> ImportResult<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT venue_external_id FROM shows \
         WHERE artist_id = ? AND venue_id IS NULL AND venue_external_id IS NOT NULL \
         ORDER BY venue_external_id",
    )
    .bind(artist_id.to_string())
    .fetch_all(db.pool())
    .await?;
    Ok(ids)
}

/// Upcoming ticketed shows on or after `from`, soonest first
pub async fn list_upcoming(
    db: &Db,
    artist_id: Uuid,
    from: NaiveDate,
    limit: u32,
) -> ImportResult<Vec<Show>> {
    let rows = sqlx::query(&format!(
        "SELECT {SHOW_COLUMNS} FROM shows \
         WHERE artist_id = ? AND origin = 'ticketing' AND date >= ? \
         ORDER BY date, start_time LIMIT ?"
    ))
    .bind(artist_id.to_string())
    .bind(from.format("%Y-%m-%d").to_string())
    .bind(i64::from(limit))
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(show_from_row).collect()
}

pub async fn count_for_artist(
    db: &Db,
    artist_id: Uuid,
    origin: Option<ShowOrigin>,
) -> ImportResult<u32> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM shows WHERE artist_id = ? AND (? IS NULL OR origin = ?)",
    )
    .bind(artist_id.to_string())
    .bind(origin.map(|o| o.as_str()))
    .bind(origin.map(|o| o.as_str()))
    .fetch_one(db.pool())
    .await?;
    Ok(n as u32)
}

/// Distinct venues referenced by the artist's shows
pub async fn count_venues_for_artist(db: &Db, artist_id: Uuid) -> ImportResult<u32> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(DISTINCT venue_external_id) FROM shows WHERE artist_id = ?",
    )
    .bind(artist_id.to_string())
    .fetch_one(db.pool())
    .await?;
    Ok(n as u32)
}
