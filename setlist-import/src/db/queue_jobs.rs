//! Queue job record persistence
//!
//! Every queue state transition is written here so that job history can be
//! inspected after the fact and unfinished jobs recovered after a restart.

use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use super::{parse_opt_timestamp, parse_timestamp, parse_uuid, Db};
use crate::error::{ImportError, ImportResult};
use crate::queue::{JobPriority, QueueJobRecord};
use crate::utils::retry_on_lock;

const JOB_COLUMNS: &str = "job_id, queue, kind, priority, state, attempts_made, max_attempts, \
     backoff, progress, logs, last_error, created_at, scheduled_at, finished_at";

fn record_from_row(row: &SqliteRow) -> ImportResult<QueueJobRecord> {
    let kind: String = row.get("kind");
    let backoff: String = row.get("backoff");
    let logs: String = row.get("logs");
    let state: String = row.get("state");

    Ok(QueueJobRecord {
        job_id: parse_uuid("queue_jobs.job_id", row.get("job_id"))?,
        queue: row.get("queue"),
        kind: serde_json::from_str(&kind)?,
        priority: JobPriority::from_value(row.get::<i64, _>("priority") as i32),
        state: state.parse().map_err(ImportError::Persistence)?,
        attempts_made: row.get::<i64, _>("attempts_made") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        backoff: serde_json::from_str(&backoff)?,
        progress: row.get::<i64, _>("progress").clamp(0, 100) as u8,
        logs: serde_json::from_str(&logs)?,
        last_error: row.get("last_error"),
        created_at: parse_timestamp("queue_jobs.created_at", row.get("created_at"))?,
        scheduled_at: parse_timestamp("queue_jobs.scheduled_at", row.get("scheduled_at"))?,
        finished_at: parse_opt_timestamp("queue_jobs.finished_at", row.get("finished_at"))?,
    })
}

/// Insert a new job record; fails if the job id is already known
pub async fn insert(db: &Db, record: &QueueJobRecord) -> ImportResult<()> {
    save(db, record, false).await
}

/// Write the current state of a job record
pub async fn upsert(db: &Db, record: &QueueJobRecord) -> ImportResult<()> {
    save(db, record, true).await
}

async fn save(db: &Db, record: &QueueJobRecord, overwrite: bool) -> ImportResult<()> {
    // Prepare all data before touching the pool
    let job_id = record.job_id.to_string();
    let kind = serde_json::to_string(&record.kind)?;
    let backoff = serde_json::to_string(&record.backoff)?;
    let logs = serde_json::to_string(&record.logs)?;
    let created_at = record.created_at.to_rfc3339();
    let scheduled_at = record.scheduled_at.to_rfc3339();
    let finished_at = record.finished_at.map(|t| t.to_rfc3339());

    let conflict = if overwrite {
        r#"ON CONFLICT(job_id) DO UPDATE SET
            priority = excluded.priority,
            state = excluded.state,
            attempts_made = excluded.attempts_made,
            max_attempts = excluded.max_attempts,
            progress = excluded.progress,
            logs = excluded.logs,
            last_error = excluded.last_error,
            scheduled_at = excluded.scheduled_at,
            finished_at = excluded.finished_at"#
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO queue_jobs ({JOB_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) {conflict}"
    );

    retry_on_lock("save_queue_job", db.max_lock_wait_ms(), || {
        sqlx::query(&sql)
            .bind(&job_id)
            .bind(&record.queue)
            .bind(&kind)
            .bind(record.priority.value())
            .bind(record.state.as_str())
            .bind(i64::from(record.attempts_made))
            .bind(i64::from(record.max_attempts))
            .bind(&backoff)
            .bind(i64::from(record.progress))
            .bind(&logs)
            .bind(&record.last_error)
            .bind(&created_at)
            .bind(&scheduled_at)
            .bind(&finished_at)
            .execute(db.pool())
    })
    .await?;
    Ok(())
}

pub async fn get(db: &Db, job_id: Uuid) -> ImportResult<Option<QueueJobRecord>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE job_id = ?"))
        .bind(job_id.to_string())
        .fetch_optional(db.pool())
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn delete(db: &Db, job_id: Uuid) -> ImportResult<()> {
    let id = job_id.to_string();
    retry_on_lock("delete_queue_job", db.max_lock_wait_ms(), || {
        sqlx::query("DELETE FROM queue_jobs WHERE job_id = ?")
            .bind(&id)
            .execute(db.pool())
    })
    .await?;
    Ok(())
}

/// Jobs of `queue` that had not finished, oldest first
pub async fn list_unfinished(db: &Db, queue: &str) -> ImportResult<Vec<QueueJobRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM queue_jobs \
         WHERE queue = ? AND state IN ('waiting', 'delayed', 'active') \
         ORDER BY created_at"
    ))
    .bind(queue)
    .fetch_all(db.pool())
    .await?;
    rows.iter().map(record_from_row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory_pool;
    use crate::queue::{ImportJobKind, JobState, ARTIST_SYNC_QUEUE};
    use chrono::Utc;
    use setlist_common::config::BackoffSettings;

    fn record(state: JobState) -> QueueJobRecord {
        let now = Utc::now();
        QueueJobRecord {
            job_id: Uuid::new_v4(),
            queue: ARTIST_SYNC_QUEUE.to_string(),
            kind: ImportJobKind::ArtistSync {
                artist_id: Uuid::new_v4(),
            },
            priority: JobPriority::Low,
            state,
            attempts_made: 0,
            max_attempts: 3,
            backoff: BackoffSettings::Exponential { delay_ms: 2000 },
            progress: 0,
            logs: vec![],
            last_error: None,
            created_at: now,
            scheduled_at: now,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_transition() {
        let db = Db::new(in_memory_pool().await.unwrap(), 1000);
        let mut job = record(JobState::Waiting);
        insert(&db, &job).await.unwrap();
        assert!(insert(&db, &job).await.is_err());

        job.state = JobState::Failed;
        job.attempts_made = 3;
        job.logs.push("attempt 3 failed".to_string());
        job.last_error = Some("ticketing unavailable".to_string());
        job.finished_at = Some(Utc::now());
        upsert(&db, &job).await.unwrap();

        let stored = get(&db, job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts_left(), 0);
        assert_eq!(stored.logs, vec!["attempt 3 failed".to_string()]);
        assert_eq!(stored.kind, job.kind);
    }

    #[tokio::test]
    async fn test_list_unfinished_skips_finished() {
        let db = Db::new(in_memory_pool().await.unwrap(), 1000);
        let waiting = record(JobState::Waiting);
        let active = record(JobState::Active);
        let done = record(JobState::Completed);
        for job in [&waiting, &active, &done] {
            insert(&db, job).await.unwrap();
        }

        let unfinished = list_unfinished(&db, ARTIST_SYNC_QUEUE).await.unwrap();
        let ids: Vec<_> = unfinished.iter().map(|r| r.job_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&waiting.job_id));
        assert!(ids.contains(&active.job_id));

        delete(&db, waiting.job_id).await.unwrap();
        assert!(get(&db, waiting.job_id).await.unwrap().is_none());
    }
}
