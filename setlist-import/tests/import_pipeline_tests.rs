//! End-to-end import scenarios against fixture adapters

mod helpers;

use helpers::*;
use setlist_common::config::BackoffSettings;
use setlist_common::events::{ImportEvent, ImportStage, PhaseOutcome};
use setlist_import::db::{artists, setlists, shows, songs};
use setlist_import::models::{SetlistKind, ShowOrigin};
use setlist_import::queue::JobState;
use setlist_import::{ImportError, StartImportOptions};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_happy_path_imports_dispatch() {
    let h = Harness::dispatch().await;

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.slug, "dispatch");
    assert!(outcome.created);

    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .expect("status recorded");
    assert_eq!(status.stage, ImportStage::Completed, "{status:?}");
    assert_eq!(status.progress_percent, 100);
    assert_eq!(status.artist_id, Some(outcome.artist_id));
    assert!(status.error.is_none());
    assert!(status.completed_at.is_some());

    // Exact name beats the more popular tribute act
    let artist = artists::find_by_id(&h.db, outcome.artist_id).await.unwrap().unwrap();
    assert_eq!(artist.spotify_id.as_deref(), Some(DISPATCH_CATALOG_ID));
    assert_eq!(artist.archive_mbid.as_deref(), Some(DISPATCH_MBID));
    assert_eq!(artist.upcoming_show_count, 3);
    assert_eq!(artist.song_count, 4);
    assert!(artist.last_synced_at.is_some());

    assert_eq!(
        shows::count_for_artist(&h.db, artist.id, Some(ShowOrigin::Ticketing)).await.unwrap(),
        3
    );
    assert_eq!(
        shows::count_for_artist(&h.db, artist.id, Some(ShowOrigin::Archive)).await.unwrap(),
        2
    );
    assert_eq!(status.totals.shows, Some(5));
    assert_eq!(status.totals.songs, Some(4));
    assert_eq!(status.totals.venues, Some(3));

    // Predicted setlists use studio tracks only, most popular first
    assert_eq!(setlists::count_for_artist(&h.db, artist.id).await.unwrap(), 3);
    let studio = songs::top_studio_songs(&h.db, artist.id, 15).await.unwrap();
    let names: Vec<&str> = studio.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["The General", "Two Coins"]);

    let upcoming = shows::list_upcoming(&h.db, artist.id, chrono::Utc::now().date_naive(), 10)
        .await
        .unwrap();
    let entries = setlists::entries(&h.db, upcoming[0].id, SetlistKind::Predicted)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].song_id, studio[0].id);

    for phase in ["identifiers", "shows", "catalog", "setlists"] {
        assert!(status.phase_timings.contains_key(phase), "missing timing {phase}");
    }
    assert_eq!(status.phase_outcomes.get("catalog"), Some(&PhaseOutcome::Completed));
    assert_eq!(status.phase_outcomes.get("past_shows"), Some(&PhaseOutcome::Completed));

    // Venues are fetched once per import, not once per event
    assert_eq!(h.ticketing.calls.count("get_attraction"), 1);
    assert_eq!(h.ticketing.calls.count("get_venue"), 0);

    let job = h.service.job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);

    h.stop().await;
}

#[tokio::test]
async fn test_catalog_cross_reference_failure_degrades() {
    let catalog = dispatch_catalog();
    catalog.fail_search.store(true, Ordering::SeqCst);
    let h = Harness::start(dispatch_ticketing(), catalog, dispatch_archive(), test_config()).await;
    let (logs, _guard) = capture_logs();

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Completed);
    assert!(matches!(
        status.phase_outcomes.get("catalog"),
        Some(PhaseOutcome::Skipped { .. })
    ));

    let artist = artists::find_by_id(&h.db, outcome.artist_id).await.unwrap().unwrap();
    assert!(artist.spotify_id.is_none());
    assert_eq!(artist.archive_mbid.as_deref(), Some(DISPATCH_MBID));
    assert_eq!(songs::count_for_artist(&h.db, artist.id).await.unwrap(), 0);
    assert_eq!(status.totals.songs, Some(0));
    assert_eq!(shows::count_for_artist(&h.db, artist.id, None).await.unwrap(), 5);
    assert_eq!(h.catalog.calls.count("list_albums"), 0);

    logs.assert_contains("Catalog cross-reference failed");
    h.stop().await;
}

#[tokio::test]
async fn test_missing_album_is_skipped() {
    let mut catalog = dispatch_catalog();
    catalog.missing_albums.push("album-bang-bang".to_string());
    let h = Harness::start(dispatch_ticketing(), catalog, dispatch_archive(), test_config()).await;
    let (logs, _guard) = capture_logs();

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Completed, "{status:?}");
    assert_eq!(status.phase_outcomes.get("catalog"), Some(&PhaseOutcome::Completed));
    assert_eq!(h.catalog.calls.count("list_tracks"), 2);

    // The live album is still imported
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM songs ORDER BY name")
        .fetch_all(h.db.pool())
        .await
        .unwrap();
    assert_eq!(names, vec!["Elias", "The General"]);
    assert_eq!(status.totals.songs, Some(2));

    let artist = artists::find_by_id(&h.db, outcome.artist_id).await.unwrap().unwrap();
    assert_eq!(artist.song_count, 2);
    // Only live tracks remain, so there is nothing to predict from
    assert!(matches!(
        status.phase_outcomes.get("setlists"),
        Some(PhaseOutcome::Skipped { .. })
    ));

    logs.assert_contains("Skipping album");
    h.stop().await;
}

#[tokio::test]
async fn test_catalog_phase_failure_completes_partially() {
    let catalog = dispatch_catalog();
    catalog.fail_albums.store(true, Ordering::SeqCst);
    let h = Harness::start(dispatch_ticketing(), catalog, dispatch_archive(), test_config()).await;

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Completed);
    assert!(matches!(
        status.phase_outcomes.get("catalog"),
        Some(PhaseOutcome::Failed { .. })
    ));
    assert_eq!(status.totals.shows, Some(5));

    // A catalog follow-up was queued
    let service = h.service.clone();
    let followed_up = eventually(WAIT, || {
        let counts = service.queue_counts().unwrap();
        async move {
            counts.iter().any(|(name, c)| {
                *name == "catalog-sync" && c.waiting + c.delayed + c.active + c.completed + c.failed > 0
            })
        }
    })
    .await;
    assert!(followed_up);

    h.stop().await;
}

#[tokio::test]
async fn test_retry_exhaustion_marks_import_failed() {
    let ticketing = dispatch_ticketing();
    ticketing.event_failures.store(u32::MAX, Ordering::SeqCst);
    let h = Harness::start(ticketing, dispatch_catalog(), dispatch_archive(), test_config()).await;

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Failed);
    assert!(status.error.as_deref().unwrap_or("").contains("503"), "{status:?}");
    assert_eq!(h.ticketing.calls.count("list_events"), 3);

    // Attempts are spaced by at least the configured fixed backoff
    let BackoffSettings::Fixed { delay_ms } = test_config().queues.artist_import.backoff else {
        panic!("test config uses a fixed backoff");
    };
    let calls_at = h.ticketing.event_calls_at.lock().unwrap().clone();
    assert_eq!(calls_at.len(), 3);
    for pair in calls_at.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= Duration::from_millis(delay_ms), "retry after {gap:?}");
    }

    let job = h.service.job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);

    // The artist created by the identifier phase is kept
    assert!(artists::find_by_id(&h.db, outcome.artist_id).await.unwrap().is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let ticketing = dispatch_ticketing();
    ticketing.event_failures.store(1, Ordering::SeqCst);
    let h = Harness::start(ticketing, dispatch_catalog(), dispatch_archive(), test_config()).await;

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Completed);
    let job = h.service.job(outcome.job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);

    h.stop().await;
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let h = Harness::dispatch().await;

    let first = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    h.service.wait_for_terminal(first.job_id, WAIT).await.unwrap();

    let counts = |artist_id| {
        let db = h.db.clone();
        async move {
            (
                shows::count_for_artist(&db, artist_id, None).await.unwrap(),
                songs::count_for_artist(&db, artist_id).await.unwrap(),
                shows::count_venues_for_artist(&db, artist_id).await.unwrap(),
                setlists::count_for_artist(&db, artist_id).await.unwrap(),
            )
        }
    };
    let before = counts(first.artist_id).await;

    let second = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(second.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.stage, ImportStage::Completed);
    assert!(!second.created);
    assert_eq!(second.artist_id, first.artist_id);
    assert_eq!(second.slug, "dispatch");
    assert_ne!(second.job_id, first.job_id);
    assert_eq!(counts(first.artist_id).await, before);

    // Existing artist: no second attraction fetch
    assert_eq!(h.ticketing.calls.count("get_attraction"), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_concurrent_starts_share_one_artist() {
    let h = Harness::dispatch().await;

    let (a, b) = tokio::join!(
        h.service
            .start_import(DISPATCH_ATTRACTION, StartImportOptions::default()),
        h.service
            .start_import(DISPATCH_ATTRACTION, StartImportOptions::default()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.artist_id, b.artist_id);
    assert!(a.created ^ b.created);

    h.service.wait_for_terminal(a.job_id, WAIT).await.unwrap();
    h.service.wait_for_terminal(b.job_id, WAIT).await.unwrap();
    h.stop().await;
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let h = Harness::dispatch().await;
    let mut events = h.service.events().subscribe();

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    h.service.wait_for_terminal(outcome.job_id, WAIT).await.unwrap();

    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(ImportEvent::ImportStatusChanged { status, .. }) if status.job_id == outcome.job_id => {
                seen.push((status.stage, status.progress_percent));
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    assert!(seen.len() > 5, "too few updates: {seen:?}");
    for pair in seen.windows(2) {
        assert!(pair[1].1 >= pair[0].1, "progress went backwards: {seen:?}");
    }
    assert_eq!(seen.last(), Some(&(ImportStage::Completed, 100)));
    assert!(seen.iter().any(|(stage, _)| *stage == ImportStage::ImportingShows));
    assert!(seen.iter().any(|(stage, _)| *stage == ImportStage::CreatingSetlists));

    h.stop().await;
}

#[tokio::test]
async fn test_unknown_attraction_fails_start() {
    let h = Harness::dispatch().await;

    let err = h
        .service
        .start_import("K8vZ-unknown", StartImportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::UpstreamNotFound { .. }), "{err:?}");
    assert!(artists::find_by_ticketmaster_id(&h.db, "K8vZ-unknown")
        .await
        .unwrap()
        .is_none());

    h.stop().await;
}

#[tokio::test]
async fn test_large_import_defers_venues() {
    let mut config = test_config();
    config.import.venue_defer_threshold = 1;
    let h = Harness::start(dispatch_ticketing(), dispatch_catalog(), dispatch_archive(), config).await;

    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    let status = h
        .service
        .wait_for_terminal(outcome.job_id, WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.stage, ImportStage::Completed);

    let resolved = eventually(WAIT, || {
        let db = h.db.clone();
        async move {
            shows::unresolved_venue_ids(&db, outcome.artist_id)
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;
    assert!(resolved);
    assert_eq!(h.ticketing.calls.count("get_venue"), 2);

    h.stop().await;
}

#[tokio::test]
async fn test_bulk_sync_refreshes_existing_artist() {
    let h = Harness::dispatch().await;
    let outcome = h
        .service
        .start_import(DISPATCH_ATTRACTION, StartImportOptions::default())
        .await
        .unwrap();
    h.service.wait_for_terminal(outcome.job_id, WAIT).await.unwrap();

    let job_ids = h.service.schedule_bulk_sync(&[outcome.artist_id]).await.unwrap();
    assert_eq!(job_ids.len(), 1);

    let status = h
        .service
        .wait_for_terminal(job_ids[0], WAIT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.stage, ImportStage::Completed);
    assert_eq!(status.artist_id, Some(outcome.artist_id));

    // The artist key resolves to the most recent run
    let latest = h.service.status(outcome.artist_id).await.unwrap().unwrap();
    assert_eq!(latest.job_id, job_ids[0]);

    h.stop().await;
}
