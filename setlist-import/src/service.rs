//! Import service
//!
//! Wires the store, cache, breakers, ledger, queues and orchestrator
//! together. Constructed explicitly with its dependencies and stopped with
//! [`ImportService::shutdown`].

use setlist_common::config::{ImportConfig, QueueSettings};
use setlist_common::events::{EventBus, ImportStage, ImportStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::{Adapters, Dependency};
use crate::breaker::BreakerSnapshot;
use crate::cache::TtlCache;
use crate::db::{self, Db};
use crate::error::{ImportError, ImportResult};
use crate::ledger::{StatusLedger, StatusUpdate};
use crate::orchestrator::{stagger, LedgerReporter, Orchestrator, ProgressReporter};
use crate::queue::{
    EnqueueOptions, ImportJobKind, JobPriority, QueueCounts, QueueJobRecord, QueueManager,
    ARTIST_IMPORT_QUEUE, ARTIST_SYNC_QUEUE, CATALOG_SYNC_QUEUE, VENUE_SYNC_QUEUE,
};
use crate::upstream::Upstream;

/// Caller options for [`ImportService::start_import`]
#[derive(Debug, Clone, Default)]
pub struct StartImportOptions {
    /// Defaults to critical for admin imports, high otherwise
    pub priority: Option<JobPriority>,
    pub admin_import: bool,
    pub user_id: Option<String>,
}

/// Returned once the identifier phase is done and the rest is queued
#[derive(Debug, Clone)]
pub struct StartImportOutcome {
    /// Also the key of the import status record
    pub job_id: Uuid,
    pub artist_id: Uuid,
    pub slug: String,
    /// False when the artist already existed
    pub created: bool,
    pub phase1_duration: Duration,
}

struct ServiceInner {
    config: ImportConfig,
    db: Db,
    events: EventBus,
    upstream: Upstream,
    ledger: StatusLedger,
    queues: QueueManager,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ImportService {
    inner: Arc<ServiceInner>,
}

impl ImportService {
    /// Build the service and start its workers
    ///
    /// Unfinished jobs left in the store by a previous run are recovered
    /// before the workers start.
    pub async fn new(config: ImportConfig, adapters: Adapters, db: Db) -> ImportResult<Self> {
        let events = EventBus::new(config.ledger.channel_capacity.max(16));
        let cache = TtlCache::new(config.cache.max_entries);
        let upstream = Upstream::new(&config, cache.clone(), Some(events.clone()))?;
        let ledger = StatusLedger::new(
            db.clone(),
            cache,
            Some(events.clone()),
            config.ledger.clone(),
        );

        let queues = QueueManager::new(Some(db.clone()), Some(events.clone()));
        let settings: [(&str, &QueueSettings); 4] = [
            (ARTIST_IMPORT_QUEUE, &config.queues.artist_import),
            (ARTIST_SYNC_QUEUE, &config.queues.artist_sync),
            (CATALOG_SYNC_QUEUE, &config.queues.catalog_sync),
            (VENUE_SYNC_QUEUE, &config.queues.venue_sync),
        ];
        for (name, queue_settings) in settings {
            queues.register_queue(name, queue_settings.clone())?;
        }

        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            adapters,
            upstream.clone(),
            ledger.clone(),
            queues.clone(),
            config.import.clone(),
        ));

        for (name, _) in settings {
            queues.recover_jobs(name).await?;
            queues.process_queue(name, orchestrator.clone())?;
        }

        let shutdown = CancellationToken::new();
        let sweeper = ledger.spawn_sweeper(shutdown.child_token());

        info!(queues = settings.len(), "Import service started");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                db,
                events,
                upstream,
                ledger,
                queues,
                orchestrator,
                shutdown,
                sweeper: Mutex::new(Some(sweeper)),
            }),
        })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    /// Run the identifier phase and queue the background phases
    ///
    /// Identifier failures (unknown attraction, timeout) are returned to the
    /// caller and recorded as a failed import. An artist row created before
    /// the failure is kept.
    pub async fn start_import(
        &self,
        attraction_id: &str,
        options: StartImportOptions,
    ) -> ImportResult<StartImportOutcome> {
        let attraction_id = attraction_id.trim();
        if attraction_id.is_empty() {
            return Err(ImportError::Validation("attraction id is empty".to_string()));
        }
        if self.inner.queues.is_shut_down() {
            return Err(ImportError::Queue("service is shutting down".to_string()));
        }

        let job_id = Uuid::new_v4();
        let reporter = LedgerReporter::new(&self.inner.ledger, job_id);
        reporter
            .report(
                StatusUpdate::stage(ImportStage::Initializing, 0, "Import requested")
                    .with_attraction(attraction_id),
            )
            .await;

        let budget = self.inner.config.import.phase1_timeout();
        let identifiers = match tokio::time::timeout(
            budget,
            self.inner.orchestrator.sync_identifiers(attraction_id, &reporter),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(self.fail_start(job_id, e).await),
            Err(_) => {
                let e = ImportError::transient(
                    Dependency::Ticketing,
                    format!("identifier phase exceeded {}ms", budget.as_millis()),
                );
                return Err(self.fail_start(job_id, e).await);
            }
        };

        let artist = identifiers.artist;
        let priority = options.priority.unwrap_or(if options.admin_import {
            JobPriority::Critical
        } else {
            JobPriority::High
        });
        let kind = ImportJobKind::ArtistImport {
            attraction_id: attraction_id.to_string(),
            artist_id: artist.id,
            admin_import: options.admin_import,
            user_id: options.user_id,
        };

        if let Err(e) = self
            .inner
            .queues
            .submit(
                kind,
                EnqueueOptions::default()
                    .with_priority(priority)
                    .with_job_id(job_id),
            )
            .await
        {
            return Err(self.fail_start(job_id, e).await);
        }

        info!(
            job_id = %job_id,
            artist_id = %artist.id,
            slug = %artist.slug,
            priority = ?priority,
            phase1_ms = identifiers.duration.as_millis() as u64,
            "Import started"
        );

        Ok(StartImportOutcome {
            job_id,
            artist_id: artist.id,
            slug: artist.slug,
            created: identifiers.created,
            phase1_duration: identifiers.duration,
        })
    }

    async fn fail_start(&self, job_id: Uuid, error: ImportError) -> ImportError {
        warn!(job_id = %job_id, error = %error, kind = error.kind(), "Import could not start");
        if let Err(e) = self
            .inner
            .ledger
            .update(job_id, StatusUpdate::failed(error.to_string()))
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to record import failure");
        }
        error
    }

    /// Latest status for a job id or artist id
    pub async fn status(&self, key: Uuid) -> ImportResult<Option<ImportStatus>> {
        self.inner.ledger.get(key).await
    }

    /// Status changes for a job id or artist id
    pub fn subscribe(&self, key: Uuid) -> broadcast::Receiver<ImportStatus> {
        self.inner.ledger.subscribe(key)
    }

    /// Wait until the job's status is terminal or `timeout` passes
    ///
    /// Returns the last known status either way.
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> ImportResult<Option<ImportStatus>> {
        let mut rx = self.subscribe(job_id);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last = self.status(job_id).await?;

        while !last.as_ref().is_some_and(|s| s.is_terminal()) {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => break,
                Ok(Ok(status)) => last = Some(status),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!(job_id = %job_id, skipped, "Status receiver lagged");
                    last = self.status(job_id).await?;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
            }
        }
        Ok(last)
    }

    /// Queue a staggered sync for each artist, returning the job ids
    pub async fn schedule_bulk_sync(&self, artist_ids: &[Uuid]) -> ImportResult<Vec<Uuid>> {
        let jitter_ms = self.inner.config.import.bulk_jitter_ms;
        let mut job_ids = Vec::with_capacity(artist_ids.len());

        for &artist_id in artist_ids {
            let options = EnqueueOptions::default()
                .with_priority(JobPriority::Low)
                .with_delay(stagger(jitter_ms));
            let job_id = self
                .inner
                .queues
                .submit(ImportJobKind::ArtistSync { artist_id }, options)
                .await?;
            job_ids.push(job_id);
        }

        info!(jobs = job_ids.len(), jitter_ms, "Bulk sync scheduled");
        Ok(job_ids)
    }

    /// Bulk sync of every known artist, least recently synced first
    pub async fn schedule_stale_sync(&self) -> ImportResult<Vec<Uuid>> {
        let artist_ids = db::artists::list_ids_by_sync_age(&self.inner.db).await?;
        self.schedule_bulk_sync(&artist_ids).await
    }

    pub async fn job(&self, job_id: Uuid) -> ImportResult<Option<QueueJobRecord>> {
        self.inner.queues.job(job_id).await
    }

    pub async fn cancel(&self, job_id: Uuid) -> ImportResult<bool> {
        self.inner.queues.cancel(job_id).await
    }

    pub fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.inner.upstream.breakers().snapshots()
    }

    pub fn queue_counts(&self) -> ImportResult<Vec<(&'static str, QueueCounts)>> {
        [
            ARTIST_IMPORT_QUEUE,
            ARTIST_SYNC_QUEUE,
            CATALOG_SYNC_QUEUE,
            VENUE_SYNC_QUEUE,
        ]
        .into_iter()
        .map(|name| Ok((name, self.inner.queues.counts(name)?)))
        .collect()
    }

    /// Stop accepting work, drain active jobs and stop the sweeper
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.queues.shutdown(grace).await;

        let sweeper = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Status sweeper ended abnormally");
            }
        }
        info!("Import service stopped");
    }
}
