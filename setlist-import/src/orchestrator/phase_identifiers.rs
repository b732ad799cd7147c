//! Identifier phase (0-20%)
//!
//! Resolves the ticketing attraction to an artist row and records catalog
//! and archive cross-references. Runs inline with the caller of
//! `start_import`, so every upstream call uses the short identifier timeout.

use setlist_common::events::ImportStage;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::classify::{pick_archive_artist, pick_catalog_artist, slug_candidate, slugify};
use super::{Orchestrator, ProgressReporter};
use crate::adapters::{Attraction, Dependency};
use crate::cache::cache_key;
use crate::db::artists::{self, InsertOutcome};
use crate::error::{ImportError, ImportResult};
use crate::ledger::StatusUpdate;
use crate::models::{Artist, NewArtist};

/// Slug suffixes tried before giving up
const MAX_SLUG_ATTEMPTS: u32 = 50;

/// Result of the identifier phase
#[derive(Debug, Clone)]
pub struct IdentifierOutcome {
    pub artist: Artist,
    /// False when the artist row already existed
    pub created: bool,
    pub duration: Duration,
}

impl Orchestrator {
    pub async fn sync_identifiers(
        &self,
        attraction_id: &str,
        reporter: &dyn ProgressReporter,
    ) -> ImportResult<IdentifierOutcome> {
        let started = Instant::now();
        reporter
            .report(
                StatusUpdate::stage(ImportStage::SyncingIdentifiers, 5, "Resolving artist")
                    .with_attraction(attraction_id),
            )
            .await;

        let (artist, created) = {
            let lock_key = format!("lock:artist:{attraction_id}");
            let _lock = self
                .upstream
                .cache()
                .acquire_lock(
                    &lock_key,
                    Duration::from_millis(self.config.artist_lock_ttl_ms),
                    Duration::from_millis(self.config.artist_lock_wait_ms),
                )
                .await?;

            match artists::find_by_ticketmaster_id(&self.db, attraction_id).await? {
                Some(existing) => {
                    debug!(artist_id = %existing.id, "Artist already exists");
                    (existing, false)
                }
                None => {
                    let attraction = self.fetch_attraction(attraction_id).await?;
                    self.create_artist(&attraction).await?
                }
            }
        };

        reporter
            .report(
                StatusUpdate::progress(10, format!("Cross-referencing {}", artist.name))
                    .with_artist(artist.id),
            )
            .await;

        let artist = if artist.spotify_id.is_none() || artist.archive_mbid.is_none() {
            self.cross_reference(artist).await?
        } else {
            artist
        };

        let duration = started.elapsed();
        reporter
            .report(
                StatusUpdate::progress(20, format!("Artist {} ready", artist.name))
                    .with_timing("identifiers", duration.as_millis() as u64),
            )
            .await;

        info!(
            artist_id = %artist.id,
            slug = %artist.slug,
            created,
            catalog = artist.spotify_id.is_some(),
            archive = artist.archive_mbid.is_some(),
            duration_ms = duration.as_millis() as u64,
            "Identifiers synced"
        );

        Ok(IdentifierOutcome {
            artist,
            created,
            duration,
        })
    }

    async fn fetch_attraction(&self, attraction_id: &str) -> ImportResult<Attraction> {
        let ticketing = self.adapters.ticketing.clone();
        let id = attraction_id.to_string();
        let attraction: Attraction = self
            .upstream
            .cached(
                Dependency::Ticketing,
                cache_key("ticketing", "attraction", attraction_id, &self.config.locale),
                self.config.phase1_call_timeout(),
                move || async move { ticketing.get_attraction(&id).await },
            )
            .await?;

        if attraction.name.trim().is_empty() {
            return Err(ImportError::Validation(format!(
                "attraction {attraction_id} has no name"
            )));
        }
        Ok(attraction)
    }

    async fn create_artist(&self, attraction: &Attraction) -> ImportResult<(Artist, bool)> {
        let base = slugify(&attraction.name);

        for n in 0..MAX_SLUG_ATTEMPTS {
            let slug = slug_candidate(&base, n);
            if artists::slug_exists(&self.db, &slug).await? {
                continue;
            }

            let new_artist = NewArtist {
                ticketmaster_id: attraction.id.clone(),
                name: attraction.name.trim().to_string(),
                slug,
                image_url: attraction.image_url.clone(),
                genres: attraction.genres.clone(),
            };
            match artists::insert(&self.db, &new_artist).await? {
                InsertOutcome::Inserted(artist) => {
                    info!(artist_id = %artist.id, slug = %artist.slug, "Artist created");
                    return Ok((artist, true));
                }
                InsertOutcome::Existing(artist) => return Ok((artist, false)),
                // Lost a race for this slug, try the next suffix
                InsertOutcome::SlugTaken => continue,
            }
        }

        Err(ImportError::Validation(format!(
            "no free slug for artist {}",
            attraction.name
        )))
    }

    /// Fill missing catalog and archive references
    ///
    /// Both lookups run concurrently and are best-effort: a failed lookup
    /// leaves the reference empty and the later phase for it is skipped.
    async fn cross_reference(&self, artist: Artist) -> ImportResult<Artist> {
        let timeout = self.config.phase1_call_timeout();

        let catalog = async {
            if artist.spotify_id.is_some() {
                return None;
            }
            match self
                .upstream
                .call(Dependency::Catalog, timeout, || {
                    self.adapters.catalog.search_artists(&artist.name)
                })
                .await
            {
                Ok(candidates) => pick_catalog_artist(&artist.name, &candidates).cloned(),
                Err(e) => {
                    warn!(artist_id = %artist.id, error = %e, "Catalog cross-reference failed");
                    None
                }
            }
        };

        let archive = async {
            if artist.archive_mbid.is_some() {
                return None;
            }
            match self
                .upstream
                .call(Dependency::Archive, timeout, || {
                    self.adapters.archive.search_artists(&artist.name)
                })
                .await
            {
                Ok(candidates) => pick_archive_artist(&artist.name, &candidates).cloned(),
                Err(e) => {
                    warn!(artist_id = %artist.id, error = %e, "Archive cross-reference failed");
                    None
                }
            }
        };

        let (catalog, archive) = tokio::join!(catalog, archive);
        if catalog.is_none() && archive.is_none() {
            return Ok(artist);
        }

        artists::set_cross_references(
            &self.db,
            artist.id,
            catalog.as_ref().map(|c| c.id.as_str()),
            archive.as_ref().map(|a| a.mbid.as_str()),
            catalog.as_ref().and_then(|c| c.popularity),
        )
        .await?;

        artists::find_by_id(&self.db, artist.id)
            .await?
            .ok_or_else(|| ImportError::Persistence(format!("artist {} vanished", artist.id)))
    }
}
