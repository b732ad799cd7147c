//! Ticketmaster Discovery API client
//!
//! - Endpoint: https://app.ticketmaster.com/discovery/v2
//! - Auth: `apikey` query parameter
//!
//! Only the fields the import pipeline consumes are decoded.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

use super::http::{build_client, network_error, read_json, require_credential};
use super::{Attraction, Dependency, Page, PageParams, TicketEvent, TicketVenue, TicketingApi};
use crate::error::ImportResult;

const DISCOVERY_BASE_URL: &str = "https://app.ticketmaster.com/discovery/v2";
const DEP: Dependency = Dependency::Ticketing;

pub struct TicketmasterClient {
    http_client: Client,
    base_url: String,
    api_key: Option<String>,
    locale: String,
}

impl TicketmasterClient {
    pub fn new(api_key: Option<String>, locale: &str) -> ImportResult<Self> {
        Ok(Self {
            http_client: build_client(DEP)?,
            base_url: DISCOVERY_BASE_URL.to_string(),
            api_key,
            locale: locale.to_string(),
        })
    }

    /// Point the client at another host (staging or a local stub)
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

        tracing::debug!(url = %url, "Querying Ticketmaster");

        let response = self
            .http_client
            .get(&url)
            .query(&[("apikey", api_key), ("locale", self.locale.as_str())])
            .query(query)
            .send()
            .await
            .map_err(|e| network_error(DEP, e))?;

        read_json(DEP, response, entity).await
    }
}

#[async_trait]
impl TicketingApi for TicketmasterClient {
    async fn get_attraction(&self, attraction_id: &str) -> ImportResult<Attraction> {
        let raw: TmAttraction = self
            .get(
                &format!("/attractions/{attraction_id}.json"),
                &[],
                &format!("attraction {attraction_id}"),
            )
            .await?;
        Ok(raw.into())
    }

    async fn search_attractions(&self, name: &str) -> ImportResult<Vec<Attraction>> {
        let raw: TmAttractionSearch = self
            .get(
                "/attractions.json",
                &[
                    ("keyword", name.to_string()),
                    ("classificationName", "music".to_string()),
                ],
                "attraction search",
            )
            .await?;
        Ok(raw
            .embedded
            .map(|e| e.attractions.into_iter().map(Attraction::from).collect())
            .unwrap_or_default())
    }

    async fn list_events(
        &self,
        attraction_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<TicketEvent>> {
        let raw: TmEventSearch = self
            .get(
                "/events.json",
                &[
                    ("attractionId", attraction_id.to_string()),
                    ("sort", "date,asc".to_string()),
                    ("size", page.size.to_string()),
                    ("page", page.page.to_string()),
                ],
                &format!("events for {attraction_id}"),
            )
            .await?;

        let items = raw
            .embedded
            .map(|e| e.events.into_iter().map(TicketEvent::from).collect())
            .unwrap_or_default();
        Ok(Page {
            items,
            page: raw.page.as_ref().map(|p| p.number).unwrap_or(page.page),
            total_pages: raw.page.map(|p| p.total_pages).unwrap_or(1),
        })
    }

    async fn get_venue(&self, venue_id: &str) -> ImportResult<TicketVenue> {
        let raw: TmVenue = self
            .get(
                &format!("/venues/{venue_id}.json"),
                &[],
                &format!("venue {venue_id}"),
            )
            .await?;
        Ok(raw.into())
    }
}

// ============================================================================
// Discovery API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TmAttractionSearch {
    #[serde(rename = "_embedded")]
    embedded: Option<TmAttractionList>,
}

#[derive(Debug, Deserialize)]
struct TmAttractionList {
    attractions: Vec<TmAttraction>,
}

#[derive(Debug, Deserialize)]
struct TmAttraction {
    id: String,
    name: String,
    #[serde(default)]
    images: Vec<TmImage>,
    #[serde(default)]
    classifications: Vec<TmClassification>,
    #[serde(rename = "upcomingEvents")]
    upcoming_events: Option<TmUpcoming>,
}

#[derive(Debug, Deserialize)]
struct TmImage {
    url: String,
    width: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TmClassification {
    genre: Option<TmNamed>,
}

#[derive(Debug, Deserialize)]
struct TmNamed {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TmUpcoming {
    #[serde(rename = "_total")]
    total: Option<u32>,
}

impl From<TmAttraction> for Attraction {
    fn from(raw: TmAttraction) -> Self {
        let image_url = raw
            .images
            .iter()
            .max_by_key(|img| img.width.unwrap_or(0))
            .map(|img| img.url.clone());
        let genres = raw
            .classifications
            .into_iter()
            .filter_map(|c| c.genre.map(|g| g.name))
            .filter(|g| g != "Undefined")
            .collect();
        Attraction {
            id: raw.id,
            name: raw.name,
            image_url,
            genres,
            upcoming_events: raw.upcoming_events.and_then(|u| u.total),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TmEventSearch {
    #[serde(rename = "_embedded")]
    embedded: Option<TmEventList>,
    page: Option<TmPage>,
}

#[derive(Debug, Deserialize)]
struct TmEventList {
    events: Vec<TmEvent>,
}

#[derive(Debug, Deserialize)]
struct TmPage {
    number: u32,
    #[serde(rename = "totalPages")]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct TmEvent {
    id: String,
    name: String,
    url: Option<String>,
    dates: Option<TmDates>,
    #[serde(rename = "_embedded")]
    embedded: Option<TmEventEmbedded>,
}

#[derive(Debug, Deserialize)]
struct TmDates {
    start: Option<TmStart>,
    status: Option<TmStatus>,
}

#[derive(Debug, Deserialize)]
struct TmStart {
    #[serde(rename = "localDate")]
    local_date: Option<String>,
    #[serde(rename = "localTime")]
    local_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmStatus {
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmEventEmbedded {
    #[serde(default)]
    venues: Vec<TmVenue>,
}

#[derive(Debug, Deserialize)]
struct TmVenue {
    id: String,
    name: Option<String>,
    city: Option<TmNamed>,
    state: Option<TmState>,
    country: Option<TmCountry>,
    address: Option<TmAddress>,
    #[serde(rename = "postalCode")]
    postal_code: Option<String>,
    location: Option<TmLocation>,
    timezone: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmState {
    #[serde(rename = "stateCode")]
    state_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmCountry {
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmAddress {
    line1: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmLocation {
    latitude: Option<String>,
    longitude: Option<String>,
}

impl From<TmVenue> for TicketVenue {
    fn from(raw: TmVenue) -> Self {
        let (latitude, longitude) = raw
            .location
            .map(|loc| {
                (
                    loc.latitude.and_then(|v| v.parse().ok()),
                    loc.longitude.and_then(|v| v.parse().ok()),
                )
            })
            .unwrap_or((None, None));
        TicketVenue {
            name: raw.name.unwrap_or_else(|| raw.id.clone()),
            id: raw.id,
            city: raw.city.map(|c| c.name),
            state: raw.state.and_then(|s| s.state_code),
            country: raw.country.and_then(|c| c.country_code),
            address: raw.address.and_then(|a| a.line1),
            postal_code: raw.postal_code,
            latitude,
            longitude,
            timezone: raw.timezone,
            url: raw.url,
        }
    }
}

impl From<TmEvent> for TicketEvent {
    fn from(raw: TmEvent) -> Self {
        let (date, start_time, status) = match raw.dates {
            Some(dates) => {
                let (date, time) = dates
                    .start
                    .map(|s| {
                        (
                            s.local_date
                                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
                            s.local_time,
                        )
                    })
                    .unwrap_or((None, None));
                (date, time, dates.status.and_then(|s| s.code))
            }
            None => (None, None, None),
        };
        TicketEvent {
            id: raw.id,
            name: raw.name,
            date,
            start_time,
            status,
            url: raw.url,
            venue: raw
                .embedded
                .and_then(|e| e.venues.into_iter().next())
                .map(TicketVenue::from),
        }
    }
}
