//! Spotify Web API client
//!
//! Client-credentials flow: the access token is fetched lazily and cached
//! until shortly before it expires.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::http::{build_client, network_error, read_json, require_credential};
use super::{CatalogAlbum, CatalogApi, CatalogArtist, CatalogTrack, Dependency, Page, PageParams};
use crate::error::{ImportError, ImportResult};

const API_BASE_URL: &str = "https://api.spotify.com/v1";
const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const DEP: Dependency = Dependency::Catalog;

/// Refresh this long before the advertised expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// `/v1/tracks` accepts at most 50 ids
const TRACK_BATCH_LIMIT: usize = 50;

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct SpotifyClient {
    http_client: Client,
    base_url: String,
    token_url: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl SpotifyClient {
    pub fn new(client_id: Option<String>, client_secret: Option<String>) -> ImportResult<Self> {
        Ok(Self {
            http_client: build_client(DEP)?,
            base_url: API_BASE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            client_id,
            client_secret,
            token: Mutex::new(None),
        })
    }

    pub fn with_base_urls(
        mut self,
        api_base_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        self.base_url = api_base_url.into();
        self.token_url = token_url.into();
        self
    }

    async fn access_token(&self) -> ImportResult<String> {
        let client_id = require_credential(DEP, &self.client_id, "client id")?;
        let client_secret = require_credential(DEP, &self.client_secret, "client secret")?;

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        tracing::debug!("Requesting Spotify access token");

        let response = self
            .http_client
            .post(&self.token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| network_error(DEP, e))?;

        let grant: TokenResponse = read_json(DEP, response, "access token").await?;
        let lifetime = Duration::from_secs(grant.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            access_token: grant.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(grant.access_token)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        entity: &str,
    ) -> ImportResult<T> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.base_url, path);

        tracing::debug!(url = %url, "Querying Spotify");

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&token)
            .query(query)
            .send()
            .await
            .map_err(|e| network_error(DEP, e))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Token revoked early; drop it so the next call re-authenticates
            *self.token.lock().await = None;
            return Err(ImportError::transient(DEP, "access token rejected"));
        }

        read_json(DEP, response, entity).await
    }

    /// Album track listings omit popularity; fill it from the full track objects
    async fn fill_popularity(&self, tracks: &mut [CatalogTrack]) -> ImportResult<()> {
        for chunk in tracks.chunks_mut(TRACK_BATCH_LIMIT) {
            let ids = chunk
                .iter()
                .map(|t| t.id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            let full: SpTrackBatch = self
                .get("/tracks", &[("ids", ids)], "track batch")
                .await?;
            let popularity: HashMap<String, u32> = full
                .tracks
                .into_iter()
                .flatten()
                .filter_map(|t| t.popularity.map(|p| (t.id, p)))
                .collect();
            for track in chunk.iter_mut() {
                if let Some(p) = popularity.get(&track.id) {
                    track.popularity = Some(*p);
                }
            }
        }
        Ok(())
    }
}

fn page_of<T>(items: Vec<T>, params: PageParams, total: u32) -> Page<T> {
    let size = params.size.max(1);
    Page {
        items,
        page: params.page,
        total_pages: total.div_ceil(size).max(1),
    }
}

#[async_trait]
impl CatalogApi for SpotifyClient {
    async fn get_artist(&self, artist_id: &str) -> ImportResult<CatalogArtist> {
        let raw: SpArtist = self
            .get(
                &format!("/artists/{artist_id}"),
                &[],
                &format!("artist {artist_id}"),
            )
            .await?;
        Ok(raw.into())
    }

    async fn search_artists(&self, name: &str) -> ImportResult<Vec<CatalogArtist>> {
        let raw: SpArtistSearch = self
            .get(
                "/search",
                &[
                    ("q", name.to_string()),
                    ("type", "artist".to_string()),
                    ("limit", "10".to_string()),
                ],
                "artist search",
            )
            .await?;
        Ok(raw.artists.items.into_iter().map(CatalogArtist::from).collect())
    }

    async fn list_albums(
        &self,
        artist_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogAlbum>> {
        let raw: SpPaging<SpAlbum> = self
            .get(
                &format!("/artists/{artist_id}/albums"),
                &[
                    ("include_groups", "album,single,compilation".to_string()),
                    ("limit", page.size.to_string()),
                    ("offset", (page.page * page.size).to_string()),
                ],
                &format!("albums for {artist_id}"),
            )
            .await?;
        let items = raw.items.into_iter().map(CatalogAlbum::from).collect();
        Ok(page_of(items, page, raw.total))
    }

    async fn list_tracks(
        &self,
        album_id: &str,
        page: PageParams,
    ) -> ImportResult<Page<CatalogTrack>> {
        let raw: SpPaging<SpTrack> = self
            .get(
                &format!("/albums/{album_id}/tracks"),
                &[
                    ("limit", page.size.to_string()),
                    ("offset", (page.page * page.size).to_string()),
                ],
                &format!("tracks for {album_id}"),
            )
            .await?;
        let mut items: Vec<CatalogTrack> = raw.items.into_iter().map(CatalogTrack::from).collect();
        if !items.is_empty() {
            self.fill_popularity(&mut items).await?;
        }
        Ok(page_of(items, page, raw.total))
    }
}

// ============================================================================
// Web API response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct SpPaging<T> {
    items: Vec<T>,
    total: u32,
}

#[derive(Debug, Deserialize)]
struct SpArtistSearch {
    artists: SpPaging<SpArtist>,
}

#[derive(Debug, Deserialize)]
struct SpImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct SpArtist {
    id: String,
    name: String,
    popularity: Option<u32>,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    images: Vec<SpImage>,
}

impl From<SpArtist> for CatalogArtist {
    fn from(raw: SpArtist) -> Self {
        CatalogArtist {
            id: raw.id,
            name: raw.name,
            popularity: raw.popularity,
            genres: raw.genres,
            // Spotify lists images widest first
            image_url: raw.images.into_iter().next().map(|i| i.url),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpAlbum {
    id: String,
    name: String,
    album_type: String,
    release_date: Option<String>,
}

impl From<SpAlbum> for CatalogAlbum {
    fn from(raw: SpAlbum) -> Self {
        CatalogAlbum {
            id: raw.id,
            name: raw.name,
            album_type: raw.album_type,
            release_date: raw.release_date,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpTrack {
    id: String,
    name: String,
    duration_ms: Option<u32>,
    popularity: Option<u32>,
    preview_url: Option<String>,
    track_number: Option<u32>,
}

impl From<SpTrack> for CatalogTrack {
    fn from(raw: SpTrack) -> Self {
        CatalogTrack {
            id: raw.id,
            name: raw.name,
            duration_ms: raw.duration_ms,
            popularity: raw.popularity,
            preview_url: raw.preview_url,
            track_number: raw.track_number,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpTrackBatch {
    /// Unknown ids come back as `null`
    tracks: Vec<Option<SpTrack>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_of_rounds_up() {
        let page = page_of(vec![1, 2, 3], PageParams { page: 0, size: 50 }, 120);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_more());

        let empty: Page<u32> = page_of(vec![], PageParams::first(50), 0);
        assert_eq!(empty.total_pages, 1);
        assert!(!empty.has_more());
    }

    #[test]
    fn test_track_batch_tolerates_null_entries() {
        let batch: SpTrackBatch = serde_json::from_value(serde_json::json!({
            "tracks": [
                { "id": "t1", "name": "The General", "popularity": 61 },
                null
            ]
        }))
        .unwrap();
        let tracks: Vec<_> = batch.tracks.into_iter().flatten().collect();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].popularity, Some(61));
    }

    #[tokio::test]
    async fn test_missing_secret_is_configuration_error() {
        let client = SpotifyClient::new(Some("id".into()), None).unwrap();
        let err = client.get_artist("0x").await.unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));
    }
}
