//! Venue database operations

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::models::Venue;
use crate::utils::retry_on_lock;

fn venue_from_row(row: &SqliteRow) -> ImportResult<Venue> {
    Ok(Venue {
        id: parse_uuid("venues.id", row.get("id"))?,
        external_id: row.get("external_id"),
        name: row.get("name"),
        city: row.get("city"),
        state: row.get("state"),
        country: row.get("country"),
        address: row.get("address"),
        postal_code: row.get("postal_code"),
        latitude: row.get("latitude"),
        longitude: row.get("longitude"),
        timezone: row.get("timezone"),
        url: row.get("url"),
    })
}

/// Insert or refresh a venue by external id, returning the stored row id
///
/// `venue.id` is only used when the row is new.
pub async fn upsert(db: &Db, venue: &Venue) -> ImportResult<Uuid> {
    let id = venue.id.to_string();
    let now = Utc::now().to_rfc3339();

    retry_on_lock("upsert_venue", db.max_lock_wait_ms(), || {
        sqlx::query(
            r#"
            INSERT INTO venues (
                id, external_id, name, city, state, country, address,
                postal_code, latitude, longitude, timezone, url, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                city = COALESCE(excluded.city, venues.city),
                state = COALESCE(excluded.state, venues.state),
                country = COALESCE(excluded.country, venues.country),
                address = COALESCE(excluded.address, venues.address),
                postal_code = COALESCE(excluded.postal_code, venues.postal_code),
                latitude = COALESCE(excluded.latitude, venues.latitude),
                longitude = COALESCE(excluded.longitude, venues.longitude),
                timezone = COALESCE(excluded.timezone, venues.timezone),
                url = COALESCE(excluded.url, venues.url),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&venue.external_id)
        .bind(&venue.name)
        .bind(&venue.city)
        .bind(&venue.state)
        .bind(&venue.country)
        .bind(&venue.address)
        .bind(&venue.postal_code)
        .bind(venue.latitude)
        .bind(venue.longitude)
        .bind(&venue.timezone)
        .bind(&venue.url)
        .bind(&now)
        .execute(db.pool())
    })
    .await?;

    let stored: String = sqlx::query_scalar("SELECT id FROM venues WHERE external_id = ?")
        .bind(&venue.external_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| {
            ImportError::Persistence(format!("venue {} missing after upsert", venue.external_id))
        })?;
    parse_uuid("venues.id", &stored)
}

pub async fn find_by_external_id(db: &Db, external_id: &str) -> ImportResult<Option<Venue>> {
    let row = sqlx::query(
        r#"
        SELECT id, external_id, name, city, state, country, address,
               postal_code, latitude, longitude, timezone, url
        FROM venues WHERE external_id = ?
        "#,
    )
    .bind(external_id)
    .fetch_optional(db.pool())
    .await?;
    row.as_ref().map(venue_from_row).transpose()
}

pub async fn count(db: &Db) -> ImportResult<u32> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM venues")
        .fetch_one(db.pool())
        .await?;
    Ok(n as u32)
}
