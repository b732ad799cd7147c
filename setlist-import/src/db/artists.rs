//! Artist database operations

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_opt_timestamp, parse_timestamp, parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::models::{Artist, NewArtist};
use crate::utils::retry_on_lock;

const ARTIST_COLUMNS: &str = "id, ticketmaster_id, spotify_id, archive_mbid, name, slug, \
     image_url, genres, popularity, upcoming_show_count, song_count, last_synced_at, \
     created_at, updated_at";

fn artist_from_row(row: &SqliteRow) -> ImportResult<Artist> {
    let genres: String = row.get("genres");
    Ok(Artist {
        id: parse_uuid("artists.id", row.get("id"))?,
        ticketmaster_id: row.get("ticketmaster_id"),
        spotify_id: row.get("spotify_id"),
        archive_mbid: row.get("archive_mbid"),
        name: row.get("name"),
        slug: row.get("slug"),
        image_url: row.get("image_url"),
        genres: serde_json::from_str(&genres)?,
        popularity: row.get::<Option<i64>, _>("popularity").map(|p| p as u32),
        upcoming_show_count: row.get::<i64, _>("upcoming_show_count") as u32,
        song_count: row.get::<i64, _>("song_count") as u32,
        last_synced_at: parse_opt_timestamp("artists.last_synced_at", row.get("last_synced_at"))?,
        created_at: parse_timestamp("artists.created_at", row.get("created_at"))?,
        updated_at: parse_timestamp("artists.updated_at", row.get("updated_at"))?,
    })
}

pub async fn find_by_id(db: &Db, artist_id: Uuid) -> ImportResult<Option<Artist>> {
    let row = sqlx::query(&format!("SELECT {ARTIST_COLUMNS} FROM artists WHERE id = ?"))
        .bind(artist_id.to_string())
        .fetch_optional(db.pool())
        .await?;
    row.as_ref().map(artist_from_row).transpose()
}

pub async fn find_by_ticketmaster_id(db: &Db, ticketmaster_id: &str) -> ImportResult<Option<Artist>> {
    let row = sqlx::query(&format!(
        "SELECT {ARTIST_COLUMNS} FROM artists WHERE ticketmaster_id = ?"
    ))
    .bind(ticketmaster_id)
    .fetch_optional(db.pool())
    .await?;
    row.as_ref().map(artist_from_row).transpose()
}

pub async fn slug_exists(db: &Db, slug: &str) -> ImportResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artists WHERE slug = ?")
        .bind(slug)
        .fetch_one(db.pool())
        .await?;
    Ok(count > 0)
}

/// Outcome of [`insert`]
#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(Artist),
    /// Another writer created the artist first; its row is returned unchanged
    Existing(Artist),
    /// The slug belongs to a different artist
    SlugTaken,
}

/// Create an artist keyed by ticketing id
///
/// Never overwrites an existing row: the identifier phase treats the first
/// creation as authoritative and only fills cross-references later.
pub async fn insert(db: &Db, artist: &NewArtist) -> ImportResult<InsertOutcome> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let genres = serde_json::to_string(&artist.genres)?;

    let result = retry_on_lock("insert_artist", db.max_lock_wait_ms(), || {
        sqlx::query(
            r#"
            INSERT INTO artists (id, ticketmaster_id, name, slug, image_url, genres, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ticketmaster_id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&artist.ticketmaster_id)
        .bind(&artist.name)
        .bind(&artist.slug)
        .bind(&artist.image_url)
        .bind(&genres)
        .bind(&now)
        .bind(&now)
        .execute(db.pool())
    })
    .await;

    match result {
        Ok(done) => {
            let stored = find_by_ticketmaster_id(db, &artist.ticketmaster_id)
                .await?
                .ok_or_else(|| {
                    ImportError::Persistence(format!(
                        "artist {} missing after insert",
                        artist.ticketmaster_id
                    ))
                })?;
            if done.rows_affected() == 1 {
                Ok(InsertOutcome::Inserted(stored))
            } else {
                Ok(InsertOutcome::Existing(stored))
            }
        }
        Err(ImportError::Persistence(msg)) if msg.contains("artists.slug") => {
            Ok(InsertOutcome::SlugTaken)
        }
        Err(e) => Err(e),
    }
}

/// Record provider cross-references; `None` leaves the stored value alone
pub async fn set_cross_references(
    db: &Db,
    artist_id: Uuid,
    spotify_id: Option<&str>,
    archive_mbid: Option<&str>,
    popularity: Option<u32>,
) -> ImportResult<()> {
    let id = artist_id.to_string();
    let now = Utc::now().to_rfc3339();
    let popularity = popularity.map(i64::from);

    retry_on_lock("set_artist_cross_references", db.max_lock_wait_ms(), || {
        sqlx::query(
            r#"
            UPDATE artists SET
                spotify_id = COALESCE(?, spotify_id),
                archive_mbid = COALESCE(?, archive_mbid),
                popularity = COALESCE(?, popularity),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(spotify_id)
        .bind(archive_mbid)
        .bind(popularity)
        .bind(&now)
        .bind(&id)
        .execute(db.pool())
    })
    .await?;
    Ok(())
}

/// Refresh aggregate counts; `None` leaves a count unchanged
pub async fn update_counts(
    db: &Db,
    artist_id: Uuid,
    upcoming_show_count: Option<u32>,
    song_count: Option<u32>,
) -> ImportResult<()> {
    let id = artist_id.to_string();
    let now = Utc::now().to_rfc3339();
    let shows = upcoming_show_count.map(i64::from);
    let songs = song_count.map(i64::from);

    retry_on_lock("update_artist_counts", db.max_lock_wait_ms(), || {
        sqlx::query(
            r#"
            UPDATE artists SET
                upcoming_show_count = COALESCE(?, upcoming_show_count),
                song_count = COALESCE(?, song_count),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(shows)
        .bind(songs)
        .bind(&now)
        .bind(&id)
        .execute(db.pool())
    })
    .await?;
    Ok(())
}

pub async fn mark_synced(db: &Db, artist_id: Uuid) -> ImportResult<()> {
    let id = artist_id.to_string();
    let now = Utc::now().to_rfc3339();

    retry_on_lock("mark_artist_synced", db.max_lock_wait_ms(), || {
        sqlx::query("UPDATE artists SET last_synced_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(&id)
            .execute(db.pool())
    })
    .await?;
    Ok(())
}

/// All artist ids, least recently synced first
pub async fn list_ids_by_sync_age(db: &Db) -> ImportResult<Vec<Uuid>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM artists ORDER BY last_synced_at IS NOT NULL, last_synced_at, created_at",
    )
    .fetch_all(db.pool())
    .await?;
    ids.iter().map(|id| parse_uuid("artists.id", id)).collect()
}
