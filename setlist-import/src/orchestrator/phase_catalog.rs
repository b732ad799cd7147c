//! Catalog phase (60-90%)

use setlist_common::events::{ImportStage, ImportTotals, PhaseOutcome};
use std::collections::HashSet;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::classify::{is_live, is_remix};
use super::{Orchestrator, ProgressReporter};
use crate::adapters::{CatalogAlbum, CatalogTrack, Dependency, PageParams};
use crate::db::{artists, songs};
use crate::error::{ImportError, ImportResult};
use crate::ledger::StatusUpdate;
use crate::models::{Artist, Song};

/// Per-run catalog counts
#[derive(Debug, Default, Clone)]
pub(super) struct CatalogSummary {
    pub albums: usize,
    pub skipped_albums: usize,
    pub skipped_tracks: usize,
    /// Artist's song count after the phase
    pub songs: u32,
}

impl Orchestrator {
    /// Import the artist's songs from the music catalog
    ///
    /// Tracks are de-duplicated by catalog id across albums. An album or
    /// track that cannot be fetched or stored is logged and skipped.
    pub(super) async fn phase_catalog(
        &self,
        artist: &Artist,
        catalog_id: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> ImportResult<CatalogSummary> {
        let started = Instant::now();
        reporter
            .report(
                StatusUpdate::stage(ImportStage::ImportingSongs, 60, "Fetching albums")
                    .with_artist(artist.id),
            )
            .await;

        let albums = self.fetch_albums(catalog_id, cancel).await?;
        let total = albums.len();
        let mut seen = HashSet::new();
        let mut stored = 0usize;
        let mut skipped_albums = 0usize;
        let mut skipped_tracks = 0usize;

        for (i, album) in albums.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            match self.import_album(artist.id, album, &mut seen).await {
                Ok((added, skipped)) => {
                    stored += added;
                    skipped_tracks += skipped;
                }
                Err(e) if e.is_item_scoped() => {
                    warn!(
                        artist_id = %artist.id,
                        album_id = %album.id,
                        error = %e,
                        "Skipping album"
                    );
                    skipped_albums += 1;
                }
                Err(e) => return Err(e),
            }

            let percent = 60 + (30 * (i + 1) / total.max(1)) as u8;
            reporter
                .report(StatusUpdate::progress(
                    percent.min(89),
                    format!("Imported songs from {}/{} albums", i + 1, total),
                ))
                .await;
        }

        let song_count = songs::count_for_artist(&self.db, artist.id).await?;
        artists::update_counts(&self.db, artist.id, None, Some(song_count)).await?;

        let elapsed = started.elapsed().as_millis() as u64;
        reporter
            .report(
                StatusUpdate::progress(90, format!("Imported {song_count} songs"))
                    .with_totals(ImportTotals {
                        songs: Some(song_count),
                        ..ImportTotals::default()
                    })
                    .with_timing("catalog", elapsed)
                    .with_outcome("catalog", PhaseOutcome::Completed),
            )
            .await;

        info!(
            artist_id = %artist.id,
            albums = total,
            tracks = stored,
            skipped_albums,
            skipped_tracks,
            songs = song_count,
            duration_ms = elapsed,
            "Catalog phase completed"
        );
        Ok(CatalogSummary {
            albums: total,
            skipped_albums,
            skipped_tracks,
            songs: song_count,
        })
    }

    /// Store one album's tracks not seen earlier in the run
    ///
    /// Returns (stored, skipped) track counts.
    async fn import_album(
        &self,
        artist_id: Uuid,
        album: &CatalogAlbum,
        seen: &mut HashSet<String>,
    ) -> ImportResult<(usize, usize)> {
        let tracks = self.fetch_tracks(&album.id).await?;
        let (mut stored, mut skipped) = (0, 0);

        for track in tracks {
            if !seen.insert(track.id.clone()) {
                continue;
            }
            let track_id = track.id.clone();
            match songs::upsert_for_artist(&self.db, artist_id, &song_from_track(album, track)).await {
                Ok(_) => stored += 1,
                Err(e) if e.is_item_scoped() => {
                    warn!(album_id = %album.id, track_id = %track_id, error = %e, "Skipping track");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok((stored, skipped))
    }

    async fn fetch_albums(
        &self,
        catalog_id: &str,
        cancel: &CancellationToken,
    ) -> ImportResult<Vec<CatalogAlbum>> {
        let timeout = self.config.call_timeout();
        let mut page = PageParams::first(self.config.album_page_size);
        let mut albums = Vec::new();

        while albums.len() < self.config.max_albums {
            if cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            let result = self
                .upstream
                .call(Dependency::Catalog, timeout, || {
                    self.adapters.catalog.list_albums(catalog_id, page)
                })
                .await?;
            let more = result.has_more();
            albums.extend(result.items);

            if !more {
                break;
            }
            page = page.next();
        }

        albums.truncate(self.config.max_albums);
        debug!(catalog_id, albums = albums.len(), "Fetched albums");
        Ok(albums)
    }

    async fn fetch_tracks(&self, album_id: &str) -> ImportResult<Vec<CatalogTrack>> {
        let timeout = self.config.call_timeout();
        let mut page = PageParams::first(self.config.track_page_size);
        let mut tracks = Vec::new();

        loop {
            let result = self
                .upstream
                .call(Dependency::Catalog, timeout, || {
                    self.adapters.catalog.list_tracks(album_id, page)
                })
                .await?;
            let more = result.has_more();
            tracks.extend(result.items);

            if !more {
                return Ok(tracks);
            }
            page = page.next();
        }
    }
}

fn song_from_track(album: &CatalogAlbum, track: CatalogTrack) -> Song {
    Song {
        id: Uuid::new_v4(),
        is_live: is_live(&track.name) || is_live(&album.name),
        is_remix: is_remix(&track.name),
        external_id: track.id,
        name: track.name,
        album_name: Some(album.name.clone()),
        duration_ms: track.duration_ms,
        popularity: track.popularity,
        preview_url: track.preview_url,
    }
}
