//! Import status ledger
//!
//! Single writer of `ImportStatus`. Every update is merged into the current
//! record, persisted to `import_status`, mirrored into the cache under both
//! the job id and the artist id, and fanned out to per-key subscribers and
//! the global event bus.

use chrono::Utc;
use setlist_common::config::LedgerConfig;
use setlist_common::events::{
    EventBus, ImportEvent, ImportStage, ImportStatus, ImportTotals, PhaseOutcome,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::db::{self, Db};
use crate::error::ImportResult;

/// Partial change to an import status; `None` fields leave the record as is
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub stage: Option<ImportStage>,
    pub progress_percent: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub artist_id: Option<Uuid>,
    pub attraction_id: Option<String>,
    pub totals: Option<ImportTotals>,
    pub phase_timings: Vec<(String, u64)>,
    pub phase_outcomes: Vec<(String, PhaseOutcome)>,
}

impl StatusUpdate {
    pub fn stage(stage: ImportStage, progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage: Some(stage),
            progress_percent: Some(progress_percent),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn progress(progress_percent: u8, message: impl Into<String>) -> Self {
        Self {
            progress_percent: Some(progress_percent),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::stage(ImportStage::Completed, 100, message)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            stage: Some(ImportStage::Failed),
            message: Some("Import failed".to_string()),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_artist(mut self, artist_id: Uuid) -> Self {
        self.artist_id = Some(artist_id);
        self
    }

    pub fn with_attraction(mut self, attraction_id: impl Into<String>) -> Self {
        self.attraction_id = Some(attraction_id.into());
        self
    }

    pub fn with_totals(mut self, totals: ImportTotals) -> Self {
        self.totals = Some(totals);
        self
    }

    pub fn with_timing(mut self, phase: &str, millis: u64) -> Self {
        self.phase_timings.push((phase.to_string(), millis));
        self
    }

    pub fn with_outcome(mut self, phase: &str, outcome: PhaseOutcome) -> Self {
        self.phase_outcomes.push((phase.to_string(), outcome));
        self
    }
}

/// Apply `update` to `status`
///
/// Progress never decreases except when the update fails the import; a
/// completed import is always at 100 and a failed one always has an error.
/// Terminal records keep their stage and progress.
pub fn merge_status(status: &mut ImportStatus, update: StatusUpdate) {
    let was_terminal = status.is_terminal();

    if let Some(stage) = update.stage {
        if !was_terminal {
            status.stage = stage;
        }
    }

    if !was_terminal {
        match (status.stage, update.progress_percent) {
            (ImportStage::Completed, _) => status.progress_percent = 100,
            (ImportStage::Failed, Some(p)) => status.progress_percent = p.min(100),
            (_, Some(p)) => status.progress_percent = status.progress_percent.max(p.min(100)),
            (_, None) => {}
        }
    }

    if let Some(message) = update.message {
        status.message = message;
    }
    if let Some(error) = update.error {
        status.error = Some(error);
    }
    if status.stage == ImportStage::Failed && status.error.is_none() {
        status.error = Some(status.message.clone());
    }
    if let Some(artist_id) = update.artist_id {
        status.artist_id = Some(artist_id);
    }
    if let Some(attraction_id) = update.attraction_id {
        status.attraction_id = Some(attraction_id);
    }
    if let Some(totals) = update.totals {
        status.totals.merge(&totals);
    }
    status.phase_timings.extend(update.phase_timings);
    status.phase_outcomes.extend(update.phase_outcomes);

    let now = Utc::now();
    status.updated_at = now;
    if status.is_terminal() && status.completed_at.is_none() {
        status.completed_at = Some(now);
    }
}

/// Expected remaining time for an import
///
/// Zero once terminal; a per-stage default while the stage reports 0%;
/// otherwise a linear extrapolation of elapsed time.
pub fn estimate_time_remaining(status: &ImportStatus) -> Duration {
    if status.is_terminal() {
        return Duration::ZERO;
    }
    if status.progress_percent == 0 {
        return stage_default(status.stage);
    }

    let elapsed = (Utc::now() - status.started_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    let progress = f64::from(status.progress_percent.min(99));
    let total = elapsed.as_secs_f64() * 100.0 / progress;
    Duration::from_secs_f64((total - elapsed.as_secs_f64()).max(0.0))
}

fn stage_default(stage: ImportStage) -> Duration {
    let secs = match stage {
        ImportStage::Initializing => 60,
        ImportStage::SyncingIdentifiers => 55,
        ImportStage::ImportingShows => 45,
        ImportStage::ImportingSongs => 25,
        ImportStage::CreatingSetlists => 5,
        ImportStage::Completed | ImportStage::Failed => 0,
    };
    Duration::from_secs(secs)
}

fn status_cache_key(key: Uuid) -> String {
    format!("status:{key}")
}

struct LedgerInner {
    db: Db,
    cache: TtlCache,
    events: Option<EventBus>,
    config: LedgerConfig,
    channels: Mutex<HashMap<Uuid, broadcast::Sender<ImportStatus>>>,
    /// Serializes update and purge per job
    key_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Clone)]
pub struct StatusLedger {
    inner: Arc<LedgerInner>,
}

impl StatusLedger {
    pub fn new(db: Db, cache: TtlCache, events: Option<EventBus>, config: LedgerConfig) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                db,
                cache,
                events,
                config,
                channels: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn key_lock(&self, job_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.key_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(job_id).or_default())
    }

    fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.inner.config.cache_ttl_secs)
    }

    /// Current record of a job for writing: cache, then store, then new
    async fn current(&self, job_id: Uuid) -> ImportResult<ImportStatus> {
        if let Some(status) = self
            .inner
            .cache
            .get::<ImportStatus>(&status_cache_key(job_id))
            .filter(|s| s.job_id == job_id)
        {
            return Ok(status);
        }
        Ok(db::import_status::get(&self.inner.db, job_id)
            .await?
            .unwrap_or_else(|| ImportStatus::new(job_id)))
    }

    /// Merge `update` into the job's status, persist and publish it
    pub async fn update(&self, job_id: Uuid, update: StatusUpdate) -> ImportResult<ImportStatus> {
        let lock = self.key_lock(job_id);
        let _held = lock.lock().await;

        let mut status = self.current(job_id).await?;
        merge_status(&mut status, update);
        db::import_status::upsert(&self.inner.db, &status).await?;

        self.mirror(&status);
        self.publish(&status);

        debug!(
            job_id = %job_id,
            stage = %status.stage,
            progress = status.progress_percent,
            "Import status updated"
        );
        Ok(status)
    }

    fn mirror(&self, status: &ImportStatus) {
        let ttl = self.cache_ttl();
        let mut keys = vec![status.job_id];
        keys.extend(status.artist_id);
        for key in keys {
            if let Err(e) = self.inner.cache.set(&status_cache_key(key), status, ttl) {
                warn!(key = %key, error = %e, "Failed to mirror import status");
            }
        }
    }

    fn publish(&self, status: &ImportStatus) {
        {
            let mut channels = self.inner.channels.lock().unwrap_or_else(|p| p.into_inner());
            let mut keys = vec![status.job_id];
            keys.extend(status.artist_id);
            for key in keys {
                if let Some(tx) = channels.get(&key) {
                    if tx.send(status.clone()).is_err() {
                        channels.remove(&key);
                    }
                }
            }
        }

        if let Some(bus) = &self.inner.events {
            bus.emit_lossy(ImportEvent::ImportStatusChanged {
                status: status.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Best-known status for a job id or artist id
    pub async fn get(&self, key: Uuid) -> ImportResult<Option<ImportStatus>> {
        let cache_key = status_cache_key(key);
        if let Some(status) = self.inner.cache.get::<ImportStatus>(&cache_key) {
            return Ok(Some(status));
        }

        let stored = match db::import_status::get(&self.inner.db, key).await? {
            Some(status) => Some(status),
            None => db::import_status::latest_for_artist(&self.inner.db, key).await?,
        };
        if let Some(status) = &stored {
            if let Err(e) = self.inner.cache.set(&cache_key, status, self.cache_ttl()) {
                warn!(key = %key, error = %e, "Failed to repopulate status cache");
            }
        }
        Ok(stored)
    }

    /// Status changes for a job id or artist id
    ///
    /// Slow receivers skip to the newest changes (`RecvError::Lagged`).
    pub fn subscribe(&self, key: Uuid) -> broadcast::Receiver<ImportStatus> {
        let mut channels = self.inner.channels.lock().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(self.inner.config.channel_capacity.max(1)).0)
            .subscribe()
    }

    /// Delete terminal records not updated within `retention`
    ///
    /// Each delete runs under the job's lock and re-checks the terminal
    /// condition, so a record that changed since listing survives.
    pub async fn purge_expired(&self, retention: Duration) -> ImportResult<usize> {
        let retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - retention;
        let expired = db::import_status::list_expired(&self.inner.db, cutoff).await?;

        let mut purged = 0;
        for (job_id, artist_id) in expired {
            let lock = self.key_lock(job_id);
            let deleted = {
                let _held = lock.lock().await;
                db::import_status::delete_if_expired(&self.inner.db, job_id, cutoff).await?
            };
            if !deleted {
                continue;
            }

            self.inner.cache.invalidate(&status_cache_key(job_id));
            if let Some(artist_id) = artist_id {
                let artist_key = status_cache_key(artist_id);
                let mirrors_this_job = self
                    .inner
                    .cache
                    .get::<ImportStatus>(&artist_key)
                    .is_some_and(|s| s.job_id == job_id);
                if mirrors_this_job {
                    self.inner.cache.invalidate(&artist_key);
                }
            }
            self.inner
                .key_locks
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&job_id);
            purged += 1;
        }

        if purged > 0 {
            info!(purged, "Purged expired import status records");
        }
        Ok(purged)
    }

    /// Run `purge_expired` every `sweep_interval_secs` until `shutdown`
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let ledger = self.clone();
        let interval = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));
        let retention = Duration::from_secs(self.inner.config.retention_hours * 3600);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = ledger.purge_expired(retention).await {
                            warn!(error = %e, "Status sweep failed");
                        }
                    }
                }
            }
            debug!("Status sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory_pool;

    async fn ledger() -> StatusLedger {
        let db = Db::new(in_memory_pool().await.unwrap(), 1000);
        StatusLedger::new(db, TtlCache::new(100), None, LedgerConfig::default())
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut status = ImportStatus::new(Uuid::new_v4());
        merge_status(&mut status, StatusUpdate::stage(ImportStage::ImportingShows, 40, "shows"));
        merge_status(&mut status, StatusUpdate::progress(30, "late batch"));
        assert_eq!(status.progress_percent, 40);
        assert_eq!(status.message, "late batch");
    }

    #[test]
    fn test_failure_may_lower_progress_and_sets_error() {
        let mut status = ImportStatus::new(Uuid::new_v4());
        merge_status(&mut status, StatusUpdate::progress(55, "shows"));
        merge_status(
            &mut status,
            StatusUpdate {
                stage: Some(ImportStage::Failed),
                progress_percent: Some(0),
                ..StatusUpdate::default()
            },
        );
        assert_eq!(status.progress_percent, 0);
        assert!(status.error.is_some());
        assert!(status.completed_at.is_some());
    }

    #[test]
    fn test_completed_forces_full_progress_and_is_absorbing() {
        let mut status = ImportStatus::new(Uuid::new_v4());
        merge_status(
            &mut status,
            StatusUpdate {
                stage: Some(ImportStage::Completed),
                progress_percent: Some(90),
                ..StatusUpdate::default()
            },
        );
        assert_eq!(status.progress_percent, 100);

        merge_status(&mut status, StatusUpdate::stage(ImportStage::ImportingShows, 30, "late"));
        assert_eq!(status.stage, ImportStage::Completed);
        assert_eq!(status.progress_percent, 100);
    }

    #[test]
    fn test_estimate_time_remaining() {
        let mut status = ImportStatus::new(Uuid::new_v4());
        assert_eq!(estimate_time_remaining(&status), Duration::from_secs(60));

        status.stage = ImportStage::ImportingShows;
        status.progress_percent = 50;
        status.started_at = Utc::now() - chrono::Duration::seconds(20);
        let eta = estimate_time_remaining(&status);
        assert!(eta >= Duration::from_secs(19) && eta <= Duration::from_secs(21));

        status.stage = ImportStage::Completed;
        assert_eq!(estimate_time_remaining(&status), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_update_visible_by_job_and_artist_id() {
        let ledger = ledger().await;
        let job_id = Uuid::new_v4();
        let artist_id = Uuid::new_v4();

        ledger
            .update(
                job_id,
                StatusUpdate::stage(ImportStage::SyncingIdentifiers, 10, "ids")
                    .with_artist(artist_id)
                    .with_totals(ImportTotals {
                        shows: Some(3),
                        ..ImportTotals::default()
                    }),
            )
            .await
            .unwrap();

        let by_job = ledger.get(job_id).await.unwrap().unwrap();
        let by_artist = ledger.get(artist_id).await.unwrap().unwrap();
        assert_eq!(by_job.job_id, job_id);
        assert_eq!(by_artist.job_id, job_id);
        assert_eq!(by_artist.totals.shows, Some(3));
    }

    #[tokio::test]
    async fn test_get_falls_back_to_store() {
        let ledger = ledger().await;
        let job_id = Uuid::new_v4();
        let artist_id = Uuid::new_v4();
        ledger
            .update(job_id, StatusUpdate::progress(20, "x").with_artist(artist_id))
            .await
            .unwrap();

        ledger.inner.cache.invalidate(&status_cache_key(job_id));
        ledger.inner.cache.invalidate(&status_cache_key(artist_id));

        assert_eq!(ledger.get(job_id).await.unwrap().unwrap().progress_percent, 20);
        assert_eq!(ledger.get(artist_id).await.unwrap().unwrap().job_id, job_id);
        assert!(ledger.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_receive_updates() {
        let ledger = ledger().await;
        let job_id = Uuid::new_v4();
        let artist_id = Uuid::new_v4();
        let mut by_job = ledger.subscribe(job_id);
        let mut by_artist = ledger.subscribe(artist_id);

        ledger
            .update(job_id, StatusUpdate::progress(25, "shows").with_artist(artist_id))
            .await
            .unwrap();

        assert_eq!(by_job.recv().await.unwrap().progress_percent, 25);
        assert_eq!(by_artist.recv().await.unwrap().job_id, job_id);
    }

    #[tokio::test]
    async fn test_concurrent_updates_stay_monotonic() {
        let ledger = ledger().await;
        let job_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for p in [10u8, 60, 30, 90, 20, 75] {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.update(job_id, StatusUpdate::progress(p, "batch")).await
            }));
        }
        let mut seen = Vec::new();
        for h in handles {
            seen.push(h.await.unwrap().unwrap().progress_percent);
        }

        let final_status = ledger.get(job_id).await.unwrap().unwrap();
        assert_eq!(final_status.progress_percent, 90);
        assert!(seen.iter().all(|p| *p <= 90));
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired_terminal_records() {
        let ledger = ledger().await;
        let done = Uuid::new_v4();
        let running = Uuid::new_v4();
        ledger.update(done, StatusUpdate::completed("done")).await.unwrap();
        ledger
            .update(running, StatusUpdate::progress(30, "running"))
            .await
            .unwrap();

        // Nothing is older than an hour
        assert_eq!(ledger.purge_expired(Duration::from_secs(3600)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ledger.purge_expired(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(ledger.get(done).await.unwrap().is_none());
        assert!(ledger.get(running).await.unwrap().is_some());
    }
}
