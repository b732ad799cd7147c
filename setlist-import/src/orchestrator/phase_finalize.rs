//! Setlist phase (90-100%)

use chrono::Utc;
use setlist_common::events::{ImportStage, PhaseOutcome};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Orchestrator, ProgressReporter};
use crate::db::{artists, setlists, shows, songs};
use crate::error::ImportResult;
use crate::ledger::StatusUpdate;
use crate::models::{Artist, SetlistKind};

impl Orchestrator {
    /// Predicted setlists for the next upcoming shows, then mark the artist
    /// synced. Returns how many setlists were written.
    pub(super) async fn phase_finalize(
        &self,
        artist: &Artist,
        reporter: &dyn ProgressReporter,
    ) -> ImportResult<u32> {
        let started = Instant::now();
        reporter
            .report(
                StatusUpdate::stage(ImportStage::CreatingSetlists, 90, "Creating predicted setlists")
                    .with_artist(artist.id),
            )
            .await;

        let today = Utc::now().date_naive();
        let upcoming =
            shows::list_upcoming(&self.db, artist.id, today, self.config.setlist_show_limit).await?;
        let top = songs::top_studio_songs(&self.db, artist.id, self.config.setlist_song_limit).await?;

        let mut created = 0u32;
        let outcome = if top.is_empty() {
            debug!(artist_id = %artist.id, "No studio songs, skipping predicted setlists");
            PhaseOutcome::Skipped {
                reason: "no studio songs".to_string(),
            }
        } else {
            let song_ids: Vec<Uuid> = top.iter().map(|s| s.id).collect();
            for show in &upcoming {
                setlists::replace(&self.db, show.id, SetlistKind::Predicted, &song_ids).await?;
                created += 1;
            }
            PhaseOutcome::Completed
        };

        artists::mark_synced(&self.db, artist.id).await?;

        let elapsed = started.elapsed().as_millis() as u64;
        reporter
            .report(
                StatusUpdate::progress(95, format!("Created {created} predicted setlists"))
                    .with_timing("setlists", elapsed)
                    .with_outcome("setlists", outcome),
            )
            .await;

        info!(artist_id = %artist.id, setlists = created, duration_ms = elapsed, "Setlists created");
        Ok(created)
    }
}
