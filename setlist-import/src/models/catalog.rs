//! Persisted catalog entities
//!
//! Rows are keyed internally by UUID and externally by the provider id they
//! were imported from; every write is an upsert on the external id.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: Uuid,
    /// Ticketing attraction id
    pub ticketmaster_id: String,
    /// Music catalog id, absent until cross-referenced
    pub spotify_id: Option<String>,
    /// Setlist archive (MusicBrainz) id
    pub archive_mbid: Option<String>,
    pub name: String,
    pub slug: String,
    pub image_url: Option<String>,
    pub genres: Vec<String>,
    pub popularity: Option<u32>,
    pub upcoming_show_count: u32,
    pub song_count: u32,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create an artist row during the identifier phase
#[derive(Debug, Clone)]
pub struct NewArtist {
    pub ticketmaster_id: String,
    pub name: String,
    pub slug: String,
    pub image_url: Option<String>,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    /// Provider-qualified id, e.g. `tm:KovZpZA7AAEA` or `fm:6bd6ca6e`
    pub external_id: String,
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

/// Where a show record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShowOrigin {
    /// Upcoming event from the ticketing provider
    Ticketing,
    /// Past performance from the setlist archive
    Archive,
}

impl ShowOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShowOrigin::Ticketing => "ticketing",
            ShowOrigin::Archive => "archive",
        }
    }
}

impl fmt::Display for ShowOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShowOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ticketing" => Ok(ShowOrigin::Ticketing),
            "archive" => Ok(ShowOrigin::Archive),
            other => Err(format!("unknown show origin: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub id: Uuid,
    pub artist_id: Uuid,
    pub external_id: String,
    pub origin: ShowOrigin,
    pub name: String,
    pub date: Option<NaiveDate>,
    pub start_time: Option<String>,
    pub status: Option<String>,
    pub url: Option<String>,
    pub tour_name: Option<String>,
    /// Resolved venue row; may lag behind `venue_external_id` when venue
    /// resolution was deferred
    pub venue_id: Option<Uuid>,
    pub venue_external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: Uuid,
    /// Catalog track id
    pub external_id: String,
    pub name: String,
    pub album_name: Option<String>,
    pub duration_ms: Option<u32>,
    pub popularity: Option<u32>,
    pub preview_url: Option<String>,
    pub is_live: bool,
    pub is_remix: bool,
}

/// One entry of a setlist, ordered by `position`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetlistEntry {
    pub position: u32,
    pub song_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetlistKind {
    /// Generated from the artist's most popular studio songs
    Predicted,
}

impl SetlistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetlistKind::Predicted => "predicted",
        }
    }
}
