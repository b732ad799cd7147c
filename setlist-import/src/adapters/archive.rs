//! setlist.fm REST client
//!
//! - Endpoint: https://api.setlist.fm/rest/1.0
//! - Auth: `x-api-key` header
//! - Artists are keyed by MusicBrainz id

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

use super::http::{build_client, network_error, read_json, require_credential};
use super::{
    ArchiveArtist, ArchiveVenue, ArchivedSetlist, Dependency, Page, PageParams, SetlistArchiveApi,
};
use crate::error::{ImportError, ImportResult};

const API_BASE_URL: &str = "https://api.setlist.fm/rest/1.0";
const DEP: Dependency = Dependency::Archive;

pub struct SetlistFmClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl SetlistFmClient {
    pub fn new(api_key: Option<String>) -> ImportResult<Self> {
        Ok(Self {
            http_client: build_client(DEP)?,
            base_url: API_BASE_URL.to_string(),
            api_key,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        entity: &str,
    ) -> ImportResult<T> {
        let api_key = require_credential(DEP, &self.api_key, "api key")?;
        let url = format!("{}{}", self.base_url, path);

        tracing::debug!(url = %url, "Querying setlist.fm");

        let response = self
            .http_client
            .get(&url)
            .header("x-api-key", api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| network_error(DEP, e))?;

        read_json(DEP, response, entity).await
    }
}

#[async_trait]
impl SetlistArchiveApi for SetlistFmClient {
    async fn get_artist(&self, mbid: &str) -> ImportResult<ArchiveArtist> {
        let raw: SfArtist = self
            .get(&format!("/artist/{mbid}"), &[], &format!("artist {mbid}"))
            .await?;
        Ok(raw.into())
    }

    async fn search_artists(&self, name: &str) -> ImportResult<Vec<ArchiveArtist>> {
        let result: ImportResult<SfArtistSearch> = self
            .get(
                "/search/artists",
                &[
                    ("artistName", name.to_string()),
                    ("sort", "relevance".to_string()),
                ],
                "artist search",
            )
            .await;

        // setlist.fm answers an empty search with 404
        match result {
            Ok(raw) => Ok(raw.artist.into_iter().map(ArchiveArtist::from).collect()),
            Err(ImportError::UpstreamNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn list_setlists(
        &self,
        mbid: &str,
        page: PageParams,
    ) -> ImportResult<Page<ArchivedSetlist>> {
        // Pages are 1-based on the wire
        let result: ImportResult<SfSetlistPage> = self
            .get(
                &format!("/artist/{mbid}/setlists"),
                &[("p", (page.page + 1).to_string())],
                &format!("setlists for {mbid}"),
            )
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(ImportError::UpstreamNotFound { .. }) => {
                return Ok(Page {
                    items: Vec::new(),
                    page: page.page,
                    total_pages: page.page + 1,
                })
            }
            Err(e) => return Err(e),
        };

        let per_page = raw.items_per_page.max(1);
        Ok(Page {
            items: raw.setlist.into_iter().map(ArchivedSetlist::from).collect(),
            page: page.page,
            total_pages: raw.total.div_ceil(per_page).max(1),
        })
    }
}

// ============================================================================
// REST response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SfArtist {
    mbid: String,
    name: String,
}

impl From<SfArtist> for ArchiveArtist {
    fn from(raw: SfArtist) -> Self {
        ArchiveArtist {
            mbid: raw.mbid,
            name: raw.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SfArtistSearch {
    #[serde(default)]
    artist: Vec<SfArtist>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SfSetlistPage {
    #[serde(default)]
    setlist: Vec<SfSetlist>,
    total: u32,
    items_per_page: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SfSetlist {
    id: String,
    /// dd-MM-yyyy
    event_date: Option<String>,
    tour: Option<SfTour>,
    venue: Option<SfVenue>,
    sets: Option<SfSets>,
}

#[derive(Debug, Deserialize)]
struct SfTour {
    name: String,
}

#[derive(Debug, Deserialize)]
struct SfVenue {
    id: String,
    name: String,
    city: Option<SfCity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SfCity {
    name: Option<String>,
    state_code: Option<String>,
    country: Option<SfCountry>,
    coords: Option<SfCoords>,
}

#[derive(Debug, Deserialize)]
struct SfCountry {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SfCoords {
    lat: Option<f64>,
    long: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SfSets {
    #[serde(default)]
    set: Vec<SfSet>,
}

#[derive(Debug, Deserialize)]
struct SfSet {
    #[serde(default)]
    song: Vec<SfSong>,
}

#[derive(Debug, Deserialize)]
struct SfSong {
    name: String,
    #[serde(default)]
    tape: bool,
}

impl From<SfVenue> for ArchiveVenue {
    fn from(raw: SfVenue) -> Self {
        let city = raw.city;
        let (lat, long) = city
            .as_ref()
            .and_then(|c| c.coords.as_ref())
            .map(|c| (c.lat, c.long))
            .unwrap_or((None, None));
        ArchiveVenue {
            id: raw.id,
            name: raw.name,
            city: city.as_ref().and_then(|c| c.name.clone()),
            state: city.as_ref().and_then(|c| c.state_code.clone()),
            country: city
                .and_then(|c| c.country)
                .and_then(|country| country.code),
            latitude: lat,
            longitude: long,
        }
    }
}

impl From<SfSetlist> for ArchivedSetlist {
    fn from(raw: SfSetlist) -> Self {
        // Tape entries are intro/outro recordings, not performed songs
        let songs = raw
            .sets
            .map(|s| s.set)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|set| set.song)
            .filter(|song| !song.tape && !song.name.trim().is_empty())
            .map(|song| song.name)
            .collect();
        ArchivedSetlist {
            id: raw.id,
            event_date: raw
                .event_date
                .and_then(|d| NaiveDate::parse_from_str(&d, "%d-%m-%Y").ok()),
            tour_name: raw.tour.map(|t| t.name),
            venue: raw.venue.map(ArchiveVenue::from),
            songs,
        }
    }
}
