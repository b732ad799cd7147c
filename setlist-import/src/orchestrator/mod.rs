//! Import orchestrator
//!
//! # State progression
//! INITIALIZING → SYNCING-IDENTIFIERS → IMPORTING-SHOWS → IMPORTING-SONGS →
//! CREATING-SETLISTS → COMPLETED, with FAILED absorbing.
//!
//! # Architecture
//! The identifier phase runs inline in `ImportService::start_import`; the
//! remaining phases run from queued jobs through the `JobHandler` impl
//! below. Each phase is an `impl Orchestrator` block in its own module:
//!
//! - **identifiers** (`phase_identifiers`): artist row, slug, cross-references
//! - **shows** (`phase_shows`, 25-60%): upcoming events, venues, past shows
//! - **catalog** (`phase_catalog`, 60-90%): albums, tracks, songs
//! - **setlists** (`phase_finalize`, 90-100%): predicted setlists
//!
//! A record that cannot be fetched or stored is skipped and counted without
//! ending its phase. Other shows-phase errors go back to the queue for retry.
//! Other catalog-phase errors only mark that phase failed; the import
//! completes with partial data and a catalog follow-up job is queued when the
//! error is transient.

pub mod classify;
mod phase_catalog;
mod phase_finalize;
mod phase_identifiers;
mod phase_shows;
pub mod progress;

pub use phase_identifiers::IdentifierOutcome;
pub use progress::{LedgerReporter, ProgressReporter};

use async_trait::async_trait;
use rand::Rng;
use setlist_common::config::PipelineConfig;
use setlist_common::events::{ImportStage, ImportTotals, PhaseOutcome};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::Adapters;
use crate::db::{self, Db};
use crate::error::{ImportError, ImportResult};
use crate::ledger::{StatusLedger, StatusUpdate};
use crate::models::{Artist, ShowOrigin};
use crate::queue::{
    EnqueueOptions, ImportJobKind, JobContext, JobHandler, JobPriority, QueueManager,
};
use crate::upstream::Upstream;
use phase_catalog::CatalogSummary;

/// Random delay in `0..=max_ms` used to spread follow-up jobs
pub fn stagger(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

pub struct Orchestrator {
    db: Db,
    adapters: Adapters,
    upstream: Upstream,
    ledger: StatusLedger,
    queues: QueueManager,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        db: Db,
        adapters: Adapters,
        upstream: Upstream,
        ledger: StatusLedger,
        queues: QueueManager,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            adapters,
            upstream,
            ledger,
            queues,
            config,
        }
    }

    pub fn ledger(&self) -> &StatusLedger {
        &self.ledger
    }

    async fn load_artist(&self, artist_id: Uuid) -> ImportResult<Artist> {
        db::artists::find_by_id(&self.db, artist_id)
            .await?
            .ok_or_else(|| ImportError::Validation(format!("artist {artist_id} does not exist")))
    }

    async fn current_totals(&self, artist_id: Uuid) -> ImportResult<ImportTotals> {
        Ok(ImportTotals {
            songs: Some(db::songs::count_for_artist(&self.db, artist_id).await?),
            shows: Some(db::shows::count_for_artist(&self.db, artist_id, None).await?),
            venues: Some(db::shows::count_venues_for_artist(&self.db, artist_id).await?),
        })
    }

    /// Shows, catalog and setlists for an existing artist
    pub async fn run_background(
        &self,
        artist_id: Uuid,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<()> {
        let artist = self.load_artist(artist_id).await?;
        info!(artist_id = %artist.id, artist = %artist.name, "Background import started");

        let shows = self.phase_shows(&artist, reporter, cancel).await?;

        let mut catalog = CatalogSummary::default();
        let catalog_outcome = match artist.spotify_id.as_deref() {
            None => PhaseOutcome::Skipped {
                reason: "no catalog cross-reference".to_string(),
            },
            Some(catalog_id) => match self.phase_catalog(&artist, catalog_id, reporter, cancel).await {
                Ok(summary) => {
                    catalog = summary;
                    PhaseOutcome::Completed
                }
                Err(ImportError::Cancelled) => return Err(ImportError::Cancelled),
                Err(e) => {
                    warn!(
                        artist_id = %artist.id,
                        error = %e,
                        kind = e.kind(),
                        "Catalog phase failed, continuing with partial import"
                    );
                    if e.is_retryable() {
                        self.enqueue_follow_up(
                            ImportJobKind::CatalogSync {
                                artist_id: artist.id,
                            },
                            Duration::ZERO,
                        )
                        .await;
                    }
                    PhaseOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            },
        };
        reporter
            .report(
                StatusUpdate::progress(90, "Catalog phase finished")
                    .with_outcome("catalog", catalog_outcome),
            )
            .await;

        let setlists = self.phase_finalize(&artist, reporter).await?;

        let totals = self.current_totals(artist.id).await?;
        reporter
            .report(
                StatusUpdate::completed(format!(
                    "Imported {} shows, {} songs, {} predicted setlists",
                    totals.shows.unwrap_or(0),
                    totals.songs.unwrap_or(0),
                    setlists
                ))
                .with_artist(artist.id)
                .with_totals(totals),
            )
            .await;

        info!(
            artist_id = %artist.id,
            upcoming_events = shows.events,
            skipped_events = shows.skipped_events,
            past_shows = shows.past_shows,
            skipped_past_shows = shows.skipped_past_shows,
            deferred_venues = shows.deferred_venues,
            albums = catalog.albums,
            skipped_albums = catalog.skipped_albums,
            skipped_tracks = catalog.skipped_tracks,
            songs = catalog.songs,
            setlists,
            "Background import completed"
        );
        Ok(())
    }

    /// Catalog and setlists only; errors go back to the queue
    async fn run_catalog_sync(
        &self,
        artist_id: Uuid,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<()> {
        let artist = self.load_artist(artist_id).await?;
        let outcome = match artist.spotify_id.as_deref() {
            Some(catalog_id) => {
                self.phase_catalog(&artist, catalog_id, reporter, cancel).await?;
                PhaseOutcome::Completed
            }
            None => PhaseOutcome::Skipped {
                reason: "no catalog cross-reference".to_string(),
            },
        };
        self.phase_finalize(&artist, reporter).await?;

        let totals = self.current_totals(artist.id).await?;
        reporter
            .report(
                StatusUpdate::completed("Catalog sync finished")
                    .with_totals(totals)
                    .with_outcome("catalog", outcome),
            )
            .await;
        Ok(())
    }

    async fn enqueue_follow_up(&self, kind: ImportJobKind, base_delay: Duration) {
        let delay = base_delay + stagger(self.config.bulk_jitter_ms);
        let queue = kind.queue_name();
        let options = EnqueueOptions::default()
            .with_priority(JobPriority::Low)
            .with_delay(delay);

        match self.queues.submit(kind, options).await {
            Ok(job_id) => info!(
                queue,
                job_id = %job_id,
                delay_ms = delay.as_millis() as u64,
                "Follow-up job queued"
            ),
            Err(e) => warn!(queue, error = %e, "Failed to queue follow-up job"),
        }
    }

    /// Upcoming ticketed show count, kept on the artist row
    async fn refresh_upcoming_count(&self, artist_id: Uuid) -> ImportResult<u32> {
        let upcoming =
            db::shows::count_for_artist(&self.db, artist_id, Some(ShowOrigin::Ticketing)).await?;
        db::artists::update_counts(&self.db, artist_id, Some(upcoming), None).await?;
        Ok(upcoming)
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &ImportJobKind, ctx: &JobContext) -> ImportResult<()> {
        let reporter = LedgerReporter::for_job(&self.ledger, ctx);
        let cancel = ctx.cancellation();

        let result = match job {
            ImportJobKind::ArtistImport {
                attraction_id,
                artist_id,
                admin_import,
                user_id,
            } => {
                info!(
                    job_id = %ctx.job_id(),
                    attraction_id = %attraction_id,
                    admin_import,
                    user_id = user_id.as_deref().unwrap_or("-"),
                    attempt = ctx.attempts_made(),
                    "Running artist import"
                );
                self.run_background(*artist_id, &reporter, cancel).await
            }
            ImportJobKind::ArtistSync { artist_id } => {
                reporter
                    .report(
                        StatusUpdate::stage(ImportStage::Initializing, 0, "Sync started")
                            .with_artist(*artist_id),
                    )
                    .await;
                self.run_background(*artist_id, &reporter, cancel).await
            }
            ImportJobKind::CatalogSync { artist_id } => {
                reporter
                    .report(
                        StatusUpdate::stage(ImportStage::ImportingSongs, 0, "Catalog sync started")
                            .with_artist(*artist_id),
                    )
                    .await;
                self.run_catalog_sync(*artist_id, &reporter, cancel).await
            }
            ImportJobKind::VenueSync {
                artist_id,
                venue_external_ids,
            } => {
                reporter
                    .report(
                        StatusUpdate::stage(
                            ImportStage::ImportingShows,
                            0,
                            format!("Resolving {} venues", venue_external_ids.len()),
                        )
                        .with_artist(*artist_id),
                    )
                    .await;
                self.run_venue_sync(*artist_id, venue_external_ids, &reporter, cancel)
                    .await
            }
        };

        if let Err(e) = &result {
            if e.is_retryable() && !ctx.is_final_attempt() {
                reporter
                    .report(StatusUpdate {
                        message: Some(format!(
                            "Attempt {} failed ({}), retrying",
                            ctx.attempts_made(),
                            e
                        )),
                        ..StatusUpdate::default()
                    })
                    .await;
            }
        }
        result
    }

    async fn on_failed(&self, job: &ImportJobKind, ctx: &JobContext, error: &ImportError) {
        error!(
            job_id = %ctx.job_id(),
            queue = ctx.queue_name(),
            artist_id = %job.artist_id(),
            error = %error,
            kind = error.kind(),
            "Import job failed permanently"
        );
        let update = StatusUpdate::failed(error.to_string()).with_artist(job.artist_id());
        if let Err(e) = self.ledger.update(ctx.job_id(), update).await {
            warn!(job_id = %ctx.job_id(), error = %e, "Failed to record import failure");
        }
    }
}
