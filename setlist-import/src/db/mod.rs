//! Durable store for setlist-import
//!
//! SQLite through sqlx. Catalog tables are written with
//! `INSERT ... ON CONFLICT DO UPDATE` keyed by external provider ids, so a
//! re-run of any import phase converges on the same rows.

pub mod artists;
pub mod import_status;
pub mod queue_jobs;
pub mod setlists;
pub mod shows;
pub mod songs;
pub mod venues;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ImportError, ImportResult};

/// Pool handle plus the write-retry ceiling used by every table module
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl Db {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_lock_wait_ms(&self) -> u64 {
        self.max_lock_wait_ms
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Initialize database connection pool
///
/// Creates the parent directory and the database file if missing, then
/// creates tables.
pub async fn init_database_pool(db_path: &Path, max_connections: u32) -> ImportResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ImportError::Persistence(format!("create {} failed: {}", parent.display(), e))
        })?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database
///
/// Every connection to `sqlite::memory:` is a separate database, so the pool
/// is capped at one connection.
pub async fn in_memory_pool() -> ImportResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create all tables if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> ImportResult<()> {
    const SCHEMA: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS artists (
            id TEXT PRIMARY KEY,
            ticketmaster_id TEXT NOT NULL UNIQUE,
            spotify_id TEXT,
            archive_mbid TEXT,
            name TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            image_url TEXT,
            genres TEXT NOT NULL DEFAULT '[]',
            popularity INTEGER,
            upcoming_show_count INTEGER NOT NULL DEFAULT 0,
            song_count INTEGER NOT NULL DEFAULT 0,
            last_synced_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS venues (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            city TEXT,
            state TEXT,
            country TEXT,
            address TEXT,
            postal_code TEXT,
            latitude REAL,
            longitude REAL,
            timezone TEXT,
            url TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS shows (
            id TEXT PRIMARY KEY,
            artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL UNIQUE,
            origin TEXT NOT NULL,
            name TEXT NOT NULL,
            date TEXT,
            start_time TEXT,
            status TEXT,
            url TEXT,
            tour_name TEXT,
            venue_id TEXT REFERENCES venues(id),
            venue_external_id TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_shows_artist_date ON shows(artist_id, date)",
        r#"
        CREATE TABLE IF NOT EXISTS songs (
            id TEXT PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            album_name TEXT,
            duration_ms INTEGER,
            popularity INTEGER,
            preview_url TEXT,
            is_live INTEGER NOT NULL DEFAULT 0,
            is_remix INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS artist_songs (
            artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            PRIMARY KEY (artist_id, song_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS setlists (
            id TEXT PRIMARY KEY,
            show_id TEXT NOT NULL REFERENCES shows(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (show_id, kind)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS setlist_songs (
            setlist_id TEXT NOT NULL REFERENCES setlists(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
            PRIMARY KEY (setlist_id, position)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS import_status (
            job_id TEXT PRIMARY KEY,
            artist_id TEXT,
            attraction_id TEXT,
            stage TEXT NOT NULL,
            progress_percent INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            error TEXT,
            totals TEXT NOT NULL DEFAULT '{}',
            phase_timings TEXT NOT NULL DEFAULT '{}',
            phase_outcomes TEXT NOT NULL DEFAULT '{}',
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_import_status_artist ON import_status(artist_id, updated_at)",
        r#"
        CREATE TABLE IF NOT EXISTS queue_jobs (
            job_id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            kind TEXT NOT NULL,
            priority INTEGER NOT NULL,
            state TEXT NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            backoff TEXT NOT NULL,
            progress INTEGER NOT NULL DEFAULT 0,
            logs TEXT NOT NULL DEFAULT '[]',
            last_error TEXT,
            created_at TEXT NOT NULL,
            scheduled_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_queue_jobs_queue_state ON queue_jobs(queue, state)",
    ];

    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::info!("Database tables initialized");
    Ok(())
}

// ============================================================================
// Column codecs shared by the table modules
// ============================================================================

pub(crate) fn parse_uuid(column: &str, value: &str) -> ImportResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| ImportError::Persistence(format!("invalid {column} uuid {value}: {e}")))
}

pub(crate) fn parse_opt_uuid(column: &str, value: Option<String>) -> ImportResult<Option<Uuid>> {
    value.map(|v| parse_uuid(column, &v)).transpose()
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> ImportResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ImportError::Persistence(format!("invalid {column} timestamp {value}: {e}")))
}

pub(crate) fn parse_opt_timestamp(
    column: &str,
    value: Option<String>,
) -> ImportResult<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(column, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_tables_is_idempotent() {
        let pool = in_memory_pool().await.unwrap();
        init_tables(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('artists', 'venues', 'shows', 'songs', 'artist_songs', 'setlists', \
              'setlist_songs', 'import_status', 'queue_jobs')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 9);
    }

    #[tokio::test]
    async fn test_file_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("setlist.db");
        let pool = init_database_pool(&path, 2).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }

    #[test]
    fn test_bad_uuid_is_persistence_error() {
        assert!(matches!(
            parse_uuid("artist_id", "nope"),
            Err(ImportError::Persistence(_))
        ));
    }
}
