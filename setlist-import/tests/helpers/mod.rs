//! Test helpers
//!
//! Fixture-driven adapters with call counters, a test configuration and a
//! service harness on an in-memory database.

#![allow(dead_code)]

pub mod log_capture;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use setlist_common::config::{BackoffSettings, ImportConfig, QueueSettings, UpstreamLimit};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use setlist_import::adapters::{
    Adapters, ArchiveArtist, ArchiveVenue, ArchivedSetlist, Attraction, CatalogAlbum, CatalogApi,
    CatalogArtist, CatalogTrack, Dependency, Page, PageParams, SetlistArchiveApi, TicketEvent,
    TicketVenue, TicketingApi,
};
use setlist_import::db::{in_memory_pool, Db};
use setlist_import::{ImportError, ImportResult, ImportService};

pub use log_capture::{capture_logs, LogCapture};

pub const DISPATCH_ATTRACTION: &str = "K8vZ9171K-V";
pub const DISPATCH_CATALOG_ID: &str = "5ZHiSdC2q5ShAdvyBq7Z8N";
pub const DISPATCH_MBID: &str = "8a4e6d9f-4bbd-4e6c-8a5f-1ad5fd0bb2c0";

/// Per-operation call counter
#[derive(Default)]
pub struct Calls(Mutex<HashMap<&'static str, u32>>);

impl Calls {
    pub fn hit(&self, op: &'static str) {
        *self.0.lock().unwrap().entry(op).or_insert(0) += 1;
    }

    pub fn count(&self, op: &str) -> u32 {
        self.0.lock().unwrap().get(op).copied().unwrap_or(0)
    }
}

fn page_of<T: Clone>(items: &[T], params: PageParams) -> Page<T> {
    let size = params.size.max(1) as usize;
    let total_pages = items.len().div_ceil(size).max(1) as u32;
    let start = params.page as usize * size;
    Page {
        items: items.iter().skip(start).take(size).cloned().collect(),
        page: params.page,
        total_pages,
    }
}

// ============================================================================
// Ticketing
// ============================================================================

#[derive(Default)]
pub struct MockTicketing {
    pub attractions: HashMap<String, Attraction>,
    pub events: Vec<TicketEvent>,
    pub venues: HashMap<String, TicketVenue>,
    /// `list_events` calls that fail transiently before answering
    pub event_failures: AtomicU32,
    /// When each `list_events` call arrived
    pub event_calls_at: Mutex<Vec<Instant>>,
    pub calls: Calls,
}

#[async_trait]
impl TicketingApi for MockTicketing {
    async fn get_attraction(&self, attraction_id: &str) -> ImportResult<Attraction> {
        self.calls.hit("get_attraction");
        self.attractions
            .get(attraction_id)
            .cloned()
            .ok_or_else(|| ImportError::not_found(Dependency::Ticketing, format!("attraction {attraction_id}")))
    }

    async fn search_attractions(&self, name: &str) -> ImportResult<Vec<Attraction>> {
        self.calls.hit("search_attractions");
        Ok(self
            .attractions
            .values()
            .filter(|a| a.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn list_events(
        &self,
        _attraction_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<TicketEvent>> {
        self.calls.hit("list_events");
        self.event_calls_at.lock().unwrap().push(Instant::now());
        let failing = self
            .event_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ImportError::transient(Dependency::Ticketing, "503 Service Unavailable"));
        }
        Ok(page_of(&self.events, page))
    }

    async fn get_venue(&self, venue_id: &str) -> ImportResult<TicketVenue> {
        self.calls.hit("get_venue");
        self.venues
            .get(venue_id)
            .cloned()
            .ok_or_else(|| ImportError::not_found(Dependency::Ticketing, format!("venue {venue_id}")))
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Default)]
pub struct MockCatalog {
    pub artists: Vec<CatalogArtist>,
    pub albums: Vec<CatalogAlbum>,
    pub tracks: HashMap<String, Vec<CatalogTrack>>,
    pub fail_search: AtomicBool,
    pub fail_albums: AtomicBool,
    /// Album ids whose track listing answers not-found
    pub missing_albums: Vec<String>,
    pub calls: Calls,
}

#[async_trait]
impl CatalogApi for MockCatalog {
    async fn get_artist(&self, artist_id: &str) -> ImportResult<CatalogArtist> {
        self.calls.hit("get_artist");
        self.artists
            .iter()
            .find(|a| a.id == artist_id)
            .cloned()
            .ok_or_else(|| ImportError::not_found(Dependency::Catalog, format!("artist {artist_id}")))
    }

    async fn search_artists(&self, _name: &str) -> ImportResult<Vec<CatalogArtist>> {
        self.calls.hit("search_artists");
        if self.fail_search.load(Ordering::SeqCst) {
            return Err(ImportError::transient(Dependency::Catalog, "connection reset"));
        }
        Ok(self.artists.clone())
    }

    async fn list_albums(
        &self,
        _artist_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogAlbum>> {
        self.calls.hit("list_albums");
        if self.fail_albums.load(Ordering::SeqCst) {
            return Err(ImportError::transient(Dependency::Catalog, "502 Bad Gateway"));
        }
        Ok(page_of(&self.albums, page))
    }

    async fn list_tracks(
        &self,
        album_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogTrack>> {
        self.calls.hit("list_tracks");
        if self.missing_albums.iter().any(|id| id == album_id) {
            return Err(ImportError::not_found(Dependency::Catalog, format!("album {album_id}")));
        }
        let tracks = self.tracks.get(album_id).cloned().unwrap_or_default();
        Ok(page_of(&tracks, page))
    }
}

// ============================================================================
// Setlist archive
// ============================================================================

#[derive(Default)]
pub struct MockArchive {
    pub artists: Vec<ArchiveArtist>,
    pub setlists: Vec<ArchivedSetlist>,
    pub calls: Calls,
}

#[async_trait]
impl SetlistArchiveApi for MockArchive {
    async fn get_artist(&self, mbid: &str) -> ImportResult<ArchiveArtist> {
        self.calls.hit("get_artist");
        self.artists
            .iter()
            .find(|a| a.mbid == mbid)
            .cloned()
            .ok_or_else(|| ImportError::not_found(Dependency::Archive, format!("artist {mbid}")))
    }

    async fn search_artists(&self, _name: &str) -> ImportResult<Vec<ArchiveArtist>> {
        self.calls.hit("search_artists");
        Ok(self.artists.clone())
    }

    async fn list_setlists(
        &self,
        _mbid: &str,
        page: PageParams,
    ) -> ImportResult<Page<ArchivedSetlist>> {
        self.calls.hit("list_setlists");
        Ok(page_of(&self.setlists, page))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn days_from_today(days: i64) -> NaiveDate {
    (Utc::now() + ChronoDuration::days(days)).date_naive()
}

pub fn ticket_venue(id: &str, name: &str, city: &str) -> TicketVenue {
    TicketVenue {
        id: id.to_string(),
        name: name.to_string(),
        city: Some(city.to_string()),
        state: None,
        country: Some("US".to_string()),
        address: None,
        postal_code: None,
        latitude: None,
        longitude: None,
        timezone: None,
        url: None,
    }
}

pub fn ticket_event(id: &str, days_ahead: i64, venue: &TicketVenue) -> TicketEvent {
    TicketEvent {
        id: id.to_string(),
        name: format!("Dispatch at {}", venue.name),
        date: Some(days_from_today(days_ahead)),
        start_time: Some("20:00:00".to_string()),
        status: Some("onsale".to_string()),
        url: None,
        venue: Some(venue.clone()),
    }
}

fn track(id: &str, name: &str, popularity: u32) -> CatalogTrack {
    CatalogTrack {
        id: id.to_string(),
        name: name.to_string(),
        duration_ms: Some(240_000),
        popularity: Some(popularity),
        preview_url: None,
        track_number: None,
    }
}

/// Dispatch: three upcoming shows at two venues
pub fn dispatch_ticketing() -> MockTicketing {
    let red_rocks = ticket_venue("KovZpZAEkn6A", "Red Rocks Amphitheatre", "Morrison");
    let fenway = ticket_venue("KovZpZAFFE1A", "Fenway Park", "Boston");

    let mut ticketing = MockTicketing::default();
    ticketing.attractions.insert(
        DISPATCH_ATTRACTION.to_string(),
        Attraction {
            id: DISPATCH_ATTRACTION.to_string(),
            name: "Dispatch".to_string(),
            image_url: None,
            genres: vec!["Rock".to_string()],
            upcoming_events: Some(3),
        },
    );
    ticketing.events = vec![
        ticket_event("G5vYZ9a1", 20, &red_rocks),
        ticket_event("G5vYZ9a2", 21, &red_rocks),
        ticket_event("G5vYZ9a3", 40, &fenway),
    ];
    ticketing.venues.insert(red_rocks.id.clone(), red_rocks);
    ticketing.venues.insert(fenway.id.clone(), fenway);
    ticketing
}

/// Two albums; one track appears on both, one is a remix, one is live
pub fn dispatch_catalog() -> MockCatalog {
    let mut catalog = MockCatalog::default();
    catalog.artists = vec![
        CatalogArtist {
            id: "tribute-band".to_string(),
            name: "Dispatch Tribute".to_string(),
            popularity: Some(80),
            genres: vec![],
            image_url: None,
        },
        CatalogArtist {
            id: DISPATCH_CATALOG_ID.to_string(),
            name: "Dispatch".to_string(),
            popularity: Some(61),
            genres: vec!["jam band".to_string()],
            image_url: None,
        },
    ];
    catalog.albums = vec![
        CatalogAlbum {
            id: "album-bang-bang".to_string(),
            name: "Bang Bang".to_string(),
            album_type: "album".to_string(),
            release_date: Some("1996".to_string()),
        },
        CatalogAlbum {
            id: "album-msg".to_string(),
            name: "Dispatch: Zimbabwe (Live at Madison Square Garden)".to_string(),
            album_type: "album".to_string(),
            release_date: Some("2009".to_string()),
        },
    ];
    catalog.tracks.insert(
        "album-bang-bang".to_string(),
        vec![
            track("trk-general", "The General", 70),
            track("trk-coins", "Two Coins", 55),
            track("trk-horses", "Flying Horses - Remix", 40),
        ],
    );
    catalog.tracks.insert(
        "album-msg".to_string(),
        vec![
            track("trk-general", "The General", 70),
            track("trk-elias", "Elias", 50),
        ],
    );
    catalog
}

/// Two past setlists at the same venue
pub fn dispatch_archive() -> MockArchive {
    let venue = ArchiveVenue {
        id: "3bd6bc5c".to_string(),
        name: "Hatch Memorial Shell".to_string(),
        city: Some("Boston".to_string()),
        state: Some("MA".to_string()),
        country: Some("US".to_string()),
        latitude: None,
        longitude: None,
    };

    let mut archive = MockArchive::default();
    archive.artists = vec![ArchiveArtist {
        mbid: DISPATCH_MBID.to_string(),
        name: "Dispatch".to_string(),
    }];
    archive.setlists = vec![
        ArchivedSetlist {
            id: "63de4613".to_string(),
            event_date: Some(days_from_today(-300)),
            tour_name: Some("Summer Tour".to_string()),
            venue: Some(venue.clone()),
            songs: vec!["The General".to_string(), "Two Coins".to_string()],
        },
        ArchivedSetlist {
            id: "7bd6a2e0".to_string(),
            event_date: Some(days_from_today(-301)),
            tour_name: None,
            venue: Some(venue),
            songs: vec!["Elias".to_string()],
        },
    ];
    archive
}

/// Defaults with fast retries, no jitter and generous upstream limits
pub fn test_config() -> ImportConfig {
    let mut config = ImportConfig::default();

    let fast = QueueSettings {
        concurrency: 2,
        rate_limit: None,
        attempts: 3,
        backoff: BackoffSettings::Fixed { delay_ms: 20 },
        keep_completed: 100,
        keep_failed: 100,
    };
    config.queues.artist_import = fast.clone();
    config.queues.artist_sync = fast.clone();
    config.queues.catalog_sync = fast.clone();
    config.queues.venue_sync = fast;

    let generous = UpstreamLimit {
        max: 1000,
        duration_ms: 1000,
        max_wait_ms: 1000,
    };
    config.rate_limits.ticketing = generous;
    config.rate_limits.catalog = generous;
    config.rate_limits.archive = generous;

    config.breaker.failure_threshold = 10;
    config.import.bulk_jitter_ms = 0;
    config.import.venue_sync_delay_ms = 0;
    config.import.call_timeout_ms = 2000;
    config
}

pub struct Harness {
    pub service: ImportService,
    pub db: Db,
    pub ticketing: Arc<MockTicketing>,
    pub catalog: Arc<MockCatalog>,
    pub archive: Arc<MockArchive>,
}

impl Harness {
    pub async fn start(
        ticketing: MockTicketing,
        catalog: MockCatalog,
        archive: MockArchive,
        config: ImportConfig,
    ) -> Self {
        let db = Db::new(in_memory_pool().await.unwrap(), 2000);
        let ticketing = Arc::new(ticketing);
        let catalog = Arc::new(catalog);
        let archive = Arc::new(archive);

        let adapters = Adapters {
            ticketing: ticketing.clone(),
            catalog: catalog.clone(),
            archive: archive.clone(),
        };
        let service = ImportService::new(config, adapters, db.clone()).await.unwrap();

        Self {
            service,
            db,
            ticketing,
            catalog,
            archive,
        }
    }

    /// Dispatch fixtures with the test configuration
    pub async fn dispatch() -> Self {
        Self::start(
            dispatch_ticketing(),
            dispatch_catalog(),
            dispatch_archive(),
            test_config(),
        )
        .await
    }

    pub async fn stop(self) {
        self.service.shutdown(Duration::from_secs(5)).await;
    }
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
