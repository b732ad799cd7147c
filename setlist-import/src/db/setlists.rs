//! Setlist database operations

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, Db};
use crate::error::ImportResult;
use crate::models::{SetlistEntry, SetlistKind};
use crate::utils::retry_on_lock;

/// Replace the setlist of `kind` for a show with `song_ids` in order
///
/// The setlist row is upserted on `(show_id, kind)`; its entries are
/// rewritten in one transaction.
pub async fn replace(
    db: &Db,
    show_id: Uuid,
    kind: SetlistKind,
    song_ids: &[Uuid],
) -> ImportResult<Uuid> {
    let new_id = Uuid::new_v4().to_string();
    let show_id = show_id.to_string();
    let now = Utc::now().to_rfc3339();

    let stored: String = retry_on_lock("replace_setlist", db.max_lock_wait_ms(), || async {
        let mut tx = db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO setlists (id, show_id, kind, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(show_id, kind) DO UPDATE SET updated_at = excluded.updated_at
            "#,
        )
        .bind(&new_id)
        .bind(&show_id)
        .bind(kind.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let setlist_id: String =
            sqlx::query_scalar("SELECT id FROM setlists WHERE show_id = ? AND kind = ?")
                .bind(&show_id)
                .bind(kind.as_str())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM setlist_songs WHERE setlist_id = ?")
            .bind(&setlist_id)
            .execute(&mut *tx)
            .await?;

        for (position, song_id) in song_ids.iter().enumerate() {
            sqlx::query("INSERT INTO setlist_songs (setlist_id, position, song_id) VALUES (?, ?, ?)")
                .bind(&setlist_id)
                .bind(position as i64 + 1)
                .bind(song_id.to_string())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(setlist_id)
    })
    .await?;

    parse_uuid("setlists.id", &stored)
}

pub async fn entries(db: &Db, show_id: Uuid, kind: SetlistKind) -> ImportResult<Vec<SetlistEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT ss.position, ss.song_id
        FROM setlist_songs ss
        JOIN setlists s ON s.id = ss.setlist_id
        WHERE s.show_id = ? AND s.kind = ?
        ORDER BY ss.position
        "#,
    )
    .bind(show_id.to_string())
    .bind(kind.as_str())
    .fetch_all(db.pool())
    .await?;

    rows.iter()
        .map(|row| {
            Ok(SetlistEntry {
                position: row.get::<i64, _>("position") as u32,
                song_id: parse_uuid("setlist_songs.song_id", row.get("song_id"))?,
            })
        })
        .collect()
}

pub async fn count_for_artist(db: &Db, artist_id: Uuid) -> ImportResult<u32> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM setlists s JOIN shows sh ON sh.id = s.show_id WHERE sh.artist_id = ?",
    )
    .bind(artist_id.to_string())
    .fetch_one(db.pool())
    .await?;
    Ok(n as u32)
}
