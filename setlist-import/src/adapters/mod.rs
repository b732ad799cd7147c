//! External service adapters
//!
//! The orchestrator depends only on these traits. Each provider exposes the
//! same three shapes: fetch one entity, search by name, and list children
//! page by page. HTTP implementations live in the submodules; tests swap in
//! fixture-backed fakes.

pub mod archive;
pub mod catalog;
mod http;
pub mod ticketing;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ImportResult;

pub use archive::SetlistFmClient;
pub use catalog::SpotifyClient;
pub use ticketing::TicketmasterClient;

/// A protected upstream dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dependency {
    Ticketing,
    Catalog,
    Archive,
}

impl Dependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Ticketing => "ticketing",
            Dependency::Catalog => "catalog",
            Dependency::Archive => "archive",
        }
    }

    pub fn all() -> [Dependency; 3] {
        [Dependency::Ticketing, Dependency::Catalog, Dependency::Archive]
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Zero-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
    pub page: u32,
    pub size: u32,
}

impl PageParams {
    pub fn first(size: u32) -> Self {
        Self { page: 0, size }
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            size: self.size,
        }
    }
}

/// One page of child entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.page + 1 < self.total_pages
    }
}

// ============================================================================
// Ticketing provider
// ============================================================================

/// A performer as listed by the ticketing provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attraction {
    pub id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub genres: Vec<String>,
    pub upcoming_events: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketVenue {
    pub id: String,
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub address: Option<String>,
    pub postal_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub url: Option<String>,
}

/// An upcoming event; fields are optional because the provider omits them
/// freely, validation happens in the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketEvent {
    pub id: String,
    pub name: String,
    pub date: Option<NaiveDate>,
    pub start_time: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub venue: Option<TicketVenue>,
}

#[async_trait]
pub trait TicketingApi: Send + Sync {
    async fn get_attraction(&self, attraction_id: &str) -> ImportResult<Attraction>;

    async fn search_attractions(&self, name: &str) -> ImportResult<Vec<Attraction>>;

    /// Events for an attraction, ordered by date ascending
    async fn list_events(
        &self,
        attraction_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<TicketEvent>>;

    async fn get_venue(&self, venue_id: &str) -> ImportResult<TicketVenue>;
}

// ============================================================================
// Music catalog provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogArtist {
    pub id: String,
    pub name: String,
    pub popularity: Option<u32>,
    pub genres: Vec<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogAlbum {
    pub id: String,
    pub name: String,
    /// album, single, compilation
    pub album_type: String,
    pub release_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogTrack {
    pub id: String,
    pub name: String,
    pub duration_ms: Option<u32>,
    pub popularity: Option<u32>,
    pub preview_url: Option<String>,
    pub track_number: Option<u32>,
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    async fn get_artist(&self, artist_id: &str) -> ImportResult<CatalogArtist>;

    async fn search_artists(&self, name: &str) -> ImportResult<Vec<CatalogArtist>>;

    async fn list_albums(
        &self,
        artist_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogAlbum>>;

    async fn list_tracks(
        &self,
        album_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogTrack>>;
}

// ============================================================================
// Setlist archive provider
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveArtist {
    /// MusicBrainz identifier used as the archive key
    pub mbid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveVenue {
    pub id: String,
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// A past performance with the songs that were played
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSetlist {
    pub id: String,
    pub event_date: Option<NaiveDate>,
    pub tour_name: Option<String>,
    pub venue: Option<ArchiveVenue>,
    pub songs: Vec<String>,
}

#[async_trait]
pub trait SetlistArchiveApi: Send + Sync {
    async fn get_artist(&self, mbid: &str) -> ImportResult<ArchiveArtist>;

    async fn search_artists(&self, name: &str) -> ImportResult<Vec<ArchiveArtist>>;

    /// Setlists for an artist, most recent first
    async fn list_setlists(
        &self,
        mbid: &str,
        page: PageParams,
    ) -> ImportResult<Page<ArchivedSetlist>>;
}

/// The three adapter handles injected into the service
#[derive(Clone)]
pub struct Adapters {
    pub ticketing: Arc<dyn TicketingApi>,
    pub catalog: Arc<dyn CatalogApi>,
    pub archive: Arc<dyn SetlistArchiveApi>,
}

impl Adapters {
    /// HTTP-backed adapters built from configured credentials
    ///
    /// Missing credentials do not fail construction; the affected adapter
    /// returns `ImportError::Configuration` on first use.
    pub fn http(
        credentials: &setlist_common::config::Credentials,
        locale: &str,
    ) -> ImportResult<Self> {
        Ok(Self {
            ticketing: Arc::new(TicketmasterClient::new(
                credentials.ticketmaster_api_key.clone(),
                locale,
            )?),
            catalog: Arc::new(SpotifyClient::new(
                credentials.spotify_client_id.clone(),
                credentials.spotify_client_secret.clone(),
            )?),
            archive: Arc::new(SetlistFmClient::new(credentials.setlistfm_api_key.clone())?),
        })
    }
}
