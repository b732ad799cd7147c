//! Shows phase (25-60%)
//!
//! Upcoming events come from the ticketing provider in batches with bounded
//! concurrency; past shows come from the setlist archive, best-effort.

use futures::stream::{self, StreamExt};
use setlist_common::events::{ImportStage, ImportTotals, PhaseOutcome};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Orchestrator, ProgressReporter};
use crate::adapters::{
    ArchiveVenue, ArchivedSetlist, Dependency, PageParams, TicketEvent, TicketVenue,
};
use crate::cache::cache_key;
use crate::db::{shows, venues};
use crate::error::{ImportError, ImportResult};
use crate::ledger::StatusUpdate;
use crate::models::{Artist, Show, ShowOrigin, Venue};
use crate::queue::ImportJobKind;

/// Page size used when walking the archive
const ARCHIVE_PAGE_SIZE: u32 = 20;

#[derive(Debug, Default, Clone)]
pub(super) struct ShowsSummary {
    pub events: usize,
    /// Invalid events plus events that failed to store
    pub skipped_events: usize,
    pub deferred_venues: usize,
    pub past_shows: usize,
    pub skipped_past_shows: usize,
}

fn venue_from_ticketing(venue: &TicketVenue) -> Venue {
    Venue {
        id: Uuid::new_v4(),
        external_id: format!("tm:{}", venue.id),
        name: venue.name.clone(),
        city: venue.city.clone(),
        state: venue.state.clone(),
        country: venue.country.clone(),
        address: venue.address.clone(),
        postal_code: venue.postal_code.clone(),
        latitude: venue.latitude,
        longitude: venue.longitude,
        timezone: venue.timezone.clone(),
        url: venue.url.clone(),
    }
}

fn venue_from_archive(venue: &ArchiveVenue) -> Venue {
    Venue {
        id: Uuid::new_v4(),
        external_id: format!("fm:{}", venue.id),
        name: venue.name.clone(),
        city: venue.city.clone(),
        state: venue.state.clone(),
        country: venue.country.clone(),
        address: None,
        postal_code: None,
        latitude: venue.latitude,
        longitude: venue.longitude,
        timezone: None,
        url: None,
    }
}

/// Events worth storing: an id and a name are required
fn is_storable(event: &TicketEvent) -> bool {
    !event.id.trim().is_empty() && !event.name.trim().is_empty()
}

impl Orchestrator {
    pub(super) async fn phase_shows(
        &self,
        artist: &Artist,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<ShowsSummary> {
        let started = Instant::now();
        reporter
            .report(
                StatusUpdate::stage(ImportStage::ImportingShows, 25, "Fetching upcoming shows")
                    .with_artist(artist.id),
            )
            .await;

        let events = self.fetch_events(&artist.ticketmaster_id, cancel).await?;
        let fetched = events.len();
        let events: Vec<TicketEvent> = events.into_iter().filter(is_storable).collect();
        let mut skipped_events = fetched - events.len();
        if skipped_events > 0 {
            warn!(artist_id = %artist.id, skipped_events, "Skipping events without id or name");
        }

        let defer_venues = events.len() > self.config.venue_defer_threshold;
        let total = events.len();
        let mut processed = 0usize;
        let mut stored = 0usize;

        for batch in events.chunks(self.config.event_batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            let futures: Vec<_> = batch
                .iter()
                .map(|event| async move {
                    let result = self.store_event(artist.id, event, defer_venues).await;
                    (event.id.as_str(), result)
                })
                .collect();
            let results: Vec<(&str, ImportResult<()>)> =
                stream::iter(futures)
                .buffer_unordered(self.config.batch_concurrency.max(1))
                .collect()
                .await;
            for (event_id, result) in results {
                match result {
                    Ok(()) => stored += 1,
                    Err(e) if e.is_item_scoped() => {
                        warn!(artist_id = %artist.id, event_id, error = %e, "Skipping event");
                        skipped_events += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            processed += batch.len();
            let percent = 25 + (25 * processed / total.max(1)) as u8;
            reporter
                .report(StatusUpdate::progress(
                    percent,
                    format!("Imported {stored}/{total} upcoming shows"),
                ))
                .await;
        }

        let deferred_venues = if defer_venues {
            self.defer_venue_resolution(artist.id).await?
        } else {
            0
        };

        reporter
            .report(StatusUpdate::progress(50, "Fetching past shows"))
            .await;
        let ((past_shows, skipped_past_shows), past_outcome) = match artist.archive_mbid.as_deref() {
            None => (
                (0, 0),
                PhaseOutcome::Skipped {
                    reason: "no archive cross-reference".to_string(),
                },
            ),
            Some(mbid) => match self.import_past_shows(artist, mbid, reporter, cancel).await {
                Ok(counts) => (counts, PhaseOutcome::Completed),
                Err(ImportError::Cancelled) => return Err(ImportError::Cancelled),
                Err(e) => {
                    warn!(artist_id = %artist.id, error = %e, "Past shows import failed");
                    (
                        (0, 0),
                        PhaseOutcome::Failed {
                            reason: e.to_string(),
                        },
                    )
                }
            },
        };

        self.refresh_upcoming_count(artist.id).await?;
        let totals = ImportTotals {
            songs: None,
            shows: Some(shows::count_for_artist(&self.db, artist.id, None).await?),
            venues: Some(shows::count_venues_for_artist(&self.db, artist.id).await?),
        };

        let elapsed = started.elapsed().as_millis() as u64;
        reporter
            .report(
                StatusUpdate::progress(60, format!("Imported {stored} upcoming and {past_shows} past shows"))
                    .with_totals(totals)
                    .with_timing("shows", elapsed)
                    .with_outcome("shows", PhaseOutcome::Completed)
                    .with_outcome("past_shows", past_outcome),
            )
            .await;

        info!(
            artist_id = %artist.id,
            events = stored,
            skipped_events,
            past_shows,
            skipped_past_shows,
            deferred_venues,
            duration_ms = elapsed,
            "Shows phase completed"
        );

        Ok(ShowsSummary {
            events: stored,
            skipped_events,
            deferred_venues,
            past_shows,
            skipped_past_shows,
        })
    }

    /// All event pages up to the configured limit, de-duplicated by id
    async fn fetch_events(
        &self,
        attraction_id: &str,
        cancel: &CancellationToken,
    ) -> ImportResult<Vec<TicketEvent>> {
        let timeout = self.config.call_timeout();
        let mut page = PageParams::first(self.config.event_page_size);
        let mut seen = HashSet::new();
        let mut events = Vec::new();

        for _ in 0..self.config.max_event_pages {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            let result = self
                .upstream
                .call(Dependency::Ticketing, timeout, || {
                    self.adapters.ticketing.list_events(attraction_id, page)
                })
                .await?;
            let more = result.has_more();
            events.extend(result.items.into_iter().filter(|e| seen.insert(e.id.clone())));

            if !more {
                break;
            }
            page = page.next();
        }

        debug!(attraction_id, events = events.len(), "Fetched upcoming events");
        Ok(events)
    }

    async fn store_event(
        &self,
        artist_id: Uuid,
        event: &TicketEvent,
        defer_venue: bool,
    ) -> ImportResult<()> {
        let venue = event.venue.as_ref().filter(|v| !v.id.trim().is_empty());
        let venue_id = match venue {
            Some(venue) if !defer_venue => Some(self.resolve_venue(venue_from_ticketing(venue)).await?),
            _ => None,
        };

        let show = Show {
            id: Uuid::new_v4(),
            artist_id,
            external_id: format!("tm:{}", event.id),
            origin: ShowOrigin::Ticketing,
            name: event.name.trim().to_string(),
            date: event.date,
            start_time: event.start_time.clone(),
            status: event.status.clone(),
            url: event.url.clone(),
            tour_name: None,
            venue_id,
            venue_external_id: venue.map(|v| format!("tm:{}", v.id)),
        };
        shows::upsert(&self.db, &show).await?;
        Ok(())
    }

    /// Store a venue once per sync window, returning its row id
    ///
    /// Concurrent batches referencing the same venue share one write.
    async fn resolve_venue(&self, venue: Venue) -> ImportResult<Uuid> {
        let key = cache_key("store", "venue", &venue.external_id, &self.config.locale);
        let db = self.db.clone();
        self.upstream
            .cache()
            .get_or_fetch(&key, self.upstream.response_ttl(), move || async move {
                venues::upsert(&db, &venue).await
            })
            .await
    }

    async fn defer_venue_resolution(&self, artist_id: Uuid) -> ImportResult<usize> {
        let venue_external_ids = shows::unresolved_venue_ids(&self.db, artist_id).await?;
        let deferred = venue_external_ids.len();
        if deferred > 0 {
            self.enqueue_follow_up(
                ImportJobKind::VenueSync {
                    artist_id,
                    venue_external_ids,
                },
                Duration::from_millis(self.config.venue_sync_delay_ms),
            )
            .await;
        }
        Ok(deferred)
    }

    /// Archived setlists as past shows
    ///
    /// Returns (stored, skipped) show counts.
    async fn import_past_shows(
        &self,
        artist: &Artist,
        mbid: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<(usize, usize)> {
        let timeout = self.config.call_timeout();
        let pages = self.config.archive_page_limit.max(1);
        let mut page = PageParams::first(ARCHIVE_PAGE_SIZE);
        let mut stored = 0usize;
        let mut skipped = 0usize;

        for n in 0..pages {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            let result = match self
                .upstream
                .call(Dependency::Archive, timeout, || {
                    self.adapters.archive.list_setlists(mbid, page)
                })
                .await
            {
                Ok(result) => result,
                // An archive with no setlists for this artist answers not-found
                Err(ImportError::UpstreamNotFound { .. }) => break,
                Err(e) => return Err(e),
            };

            for setlist in result.items.iter().filter(|s| !s.id.trim().is_empty()) {
                match self.store_past_show(artist, setlist).await {
                    Ok(()) => stored += 1,
                    Err(e) if e.is_item_scoped() => {
                        warn!(artist_id = %artist.id, setlist_id = %setlist.id, error = %e, "Skipping past show");
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            let percent = 50 + (10 * (n + 1) / pages) as u8;
            reporter
                .report(StatusUpdate::progress(
                    percent,
                    format!("Imported {stored} past shows"),
                ))
                .await;

            if !result.has_more() {
                break;
            }
            page = page.next();
        }

        Ok((stored, skipped))
    }

    async fn store_past_show(&self, artist: &Artist, setlist: &ArchivedSetlist) -> ImportResult<()> {
        let venue_id = match &setlist.venue {
            Some(venue) => Some(self.resolve_venue(venue_from_archive(venue)).await?),
            None => None,
        };
        let show = Show {
            id: Uuid::new_v4(),
            artist_id: artist.id,
            external_id: format!("fm:{}", setlist.id),
            origin: ShowOrigin::Archive,
            name: setlist
                .tour_name
                .clone()
                .unwrap_or_else(|| artist.name.clone()),
            date: setlist.event_date,
            start_time: None,
            status: None,
            url: None,
            tour_name: setlist.tour_name.clone(),
            venue_id,
            venue_external_id: setlist.venue.as_ref().map(|v| format!("fm:{}", v.id)),
        };
        shows::upsert(&self.db, &show).await?;
        Ok(())
    }

    /// Resolve venues deferred by a large shows import
    pub(super) async fn run_venue_sync(
        &self,
        artist_id: Uuid,
        venue_external_ids: &[String],
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<()> {
        let total = venue_external_ids.len();
        let mut linked = 0u64;
        let mut skipped = 0usize;

        for (i, external_id) in venue_external_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            let Some(venue_id) = external_id.strip_prefix("tm:") else {
                warn!(external_id = %external_id, "Not a ticketing venue reference, skipping");
                skipped += 1;
                continue;
            };

            match self.link_venue(artist_id, external_id, venue_id).await {
                Ok(n) => linked += n,
                Err(ImportError::UpstreamNotFound { .. }) => {
                    debug!(venue_id, "Venue no longer listed");
                    skipped += 1;
                }
                Err(e) if e.is_item_scoped() => {
                    warn!(venue_id, error = %e, "Skipping venue");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }

            let percent = (100 * (i + 1) / total.max(1)).min(99) as u8;
            reporter
                .report(StatusUpdate::progress(
                    percent,
                    format!("Resolved {}/{} venues", i + 1, total),
                ))
                .await;
        }

        let venues = shows::count_venues_for_artist(&self.db, artist_id).await?;
        reporter
            .report(
                StatusUpdate::completed(format!("Linked {linked} shows to venues"))
                    .with_totals(ImportTotals {
                        venues: Some(venues),
                        ..ImportTotals::default()
                    }),
            )
            .await;

        info!(artist_id = %artist_id, venues = total, linked, skipped, "Venue sync completed");
        Ok(())
    }

    /// Fetch, store and attach one deferred venue, returning the shows linked
    async fn link_venue(&self, artist_id: Uuid, external_id: &str, venue_id: &str) -> ImportResult<u64> {
        let venue = self.fetch_venue(venue_id).await?;
        let stored = self.resolve_venue(venue_from_ticketing(&venue)).await?;
        shows::link_venue(&self.db, artist_id, external_id, stored).await
    }

    async fn fetch_venue(&self, venue_id: &str) -> ImportResult<TicketVenue> {
        let ticketing = self.adapters.ticketing.clone();
        let id = venue_id.to_string();
        self.upstream
            .cached(
                Dependency::Ticketing,
                cache_key("ticketing", "venue", venue_id, &self.config.locale),
                self.config.call_timeout(),
                move || async move { ticketing.get_venue(&id).await },
            )
            .await
    }
}
