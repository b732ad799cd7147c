//! Song database operations

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::models::Song;
use crate::utils::retry_on_lock;

fn song_from_row(row: &SqliteRow) -> ImportResult<Song> {
    Ok(Song {
        id: parse_uuid("songs.id", row.get("id"))?,
        external_id: row.get("external_id"),
        name: row.get("name"),
        album_name: row.get("album_name"),
        duration_ms: row.get::<Option<i64>, _>("duration_ms").map(|d| d as u32),
        popularity: row.get::<Option<i64>, _>("popularity").map(|p| p as u32),
        preview_url: row.get("preview_url"),
        is_live: row.get("is_live"),
        is_remix: row.get("is_remix"),
    })
}

/// Insert or refresh a song by catalog track id and link it to the artist
pub async fn upsert_for_artist(db: &Db, artist_id: Uuid, song: &Song) -> ImportResult<Uuid> {
    let id = song.id.to_string();
    let artist_id = artist_id.to_string();
    let duration = song.duration_ms.map(i64::from);
    let popularity = song.popularity.map(i64::from);
    let now = Utc::now().to_rfc3339();

    retry_on_lock("upsert_song", db.max_lock_wait_ms(), || async {
        let mut tx = db.pool().begin().await?;

        sqlx::query(
            r#"
            INSERT INTO songs (
                id, external_id, name, album_name, duration_ms, popularity,
                preview_url, is_live, is_remix, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                album_name = COALESCE(excluded.album_name, songs.album_name),
                duration_ms = COALESCE(excluded.duration_ms, songs.duration_ms),
                popularity = COALESCE(excluded.popularity, songs.popularity),
                preview_url = COALESCE(excluded.preview_url, songs.preview_url),
                is_live = excluded.is_live,
                is_remix = excluded.is_remix,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&song.external_id)
        .bind(&song.name)
        .bind(&song.album_name)
        .bind(duration)
        .bind(popularity)
        .bind(&song.preview_url)
        .bind(song.is_live)
        .bind(song.is_remix)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO artist_songs (artist_id, song_id)
            SELECT ?, id FROM songs WHERE external_id = ?
            ON CONFLICT(artist_id, song_id) DO NOTHING
            "#,
        )
        .bind(&artist_id)
        .bind(&song.external_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    })
    .await?;

    let stored: String = sqlx::query_scalar("SELECT id FROM songs WHERE external_id = ?")
        .bind(&song.external_id)
        .fetch_optional(db.pool())
        .await?
        .ok_or_else(|| {
            ImportError::Persistence(format!("song {} missing after upsert", song.external_id))
        })?;
    parse_uuid("songs.id", &stored)
}

/// Most popular studio recordings of the artist (no live or remix versions)
pub async fn top_studio_songs(db: &Db, artist_id: Uuid, limit: u32) -> ImportResult<Vec<Song>> {
    let rows = sqlx::query(
        r#"
        SELECT s.id, s.external_id, s.name, s.album_name, s.duration_ms, s.popularity,
               s.preview_url, s.is_live, s.is_remix
        FROM songs s
        JOIN artist_songs a ON a.song_id = s.id
        WHERE a.artist_id = ? AND s.is_live = 0 AND s.is_remix = 0
        ORDER BY COALESCE(s.popularity, 0) DESC, s.name
        LIMIT ?
        "#,
    )
    .bind(artist_id.to_string())
    .bind(i64::from(limit))
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(song_from_row).collect()
}

pub async fn count_for_artist(db: &Db, artist_id: Uuid) -> ImportResult<u32> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artist_songs WHERE artist_id = ?")
        .bind(artist_id.to_string())
        .fetch_one(db.pool())
        .await?;
    Ok(n as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{artists, in_memory_pool};
    use crate::models::NewArtist;

    fn song(external_id: &str, name: &str, popularity: u32, is_live: bool) -> Song {
        Song {
            id: Uuid::new_v4(),
            external_id: external_id.to_string(),
            name: name.to_string(),
            album_name: Some("Bang Bang".to_string()),
            duration_ms: Some(240_000),
            popularity: Some(popularity),
            preview_url: None,
            is_live,
            is_remix: false,
        }
    }

    #[tokio::test]
    async fn test_upsert_links_once_and_ranks_studio_songs() {
        let db = Db::new(in_memory_pool().await.unwrap(), 1000);
        let artist = match artists::insert(
            &db,
            &NewArtist {
                ticketmaster_id: "K8vZ9171K-V".to_string(),
                name: "Dispatch".to_string(),
                slug: "dispatch".to_string(),
                image_url: None,
                genres: vec![],
            },
        )
        .await
        .unwrap()
        {
            artists::InsertOutcome::Inserted(a) => a,
            other => panic!("unexpected {:?}", other),
        };

        upsert_for_artist(&db, artist.id, &song("t1", "The General", 70, false))
            .await
            .unwrap();
        upsert_for_artist(&db, artist.id, &song("t1", "The General", 72, false))
            .await
            .unwrap();
        upsert_for_artist(&db, artist.id, &song("t2", "Two Coins", 50, false))
            .await
            .unwrap();
        upsert_for_artist(&db, artist.id, &song("t3", "The General - Live", 90, true))
            .await
            .unwrap();

        assert_eq!(count_for_artist(&db, artist.id).await.unwrap(), 3);

        let top = top_studio_songs(&db, artist.id, 5).await.unwrap();
        let names: Vec<_> = top.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["The General", "Two Coins"]);
        assert_eq!(top[0].popularity, Some(72));
    }
}
