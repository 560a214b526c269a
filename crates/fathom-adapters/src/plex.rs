//! Plex Media Server library lookups.
//!
//! Items are matched by IMDb guid when Plex has one and by title and year
//! otherwise. File paths are never consulted.

use std::time::Duration;

use async_trait::async_trait;
use fathom_core::adapter::{
    LibraryEntry, LibraryQuery, MediaServerAdapter, ProbeStatus, ServiceAdapter,
};
use fathom_core::error::AppError;
use fathom_core::item::{Availability, ItemKind};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::http::{HttpService, probe_status};

const TYPE_MOVIE: &str = "1";
const TYPE_SHOW: &str = "2";

pub struct PlexMediaServer {
    http: HttpService,
    token: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "MediaContainer")]
    container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
struct MediaContainer {
    #[serde(rename = "Metadata", default)]
    metadata: Vec<Metadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    #[serde(default)]
    rating_key: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    title: String,
    year: Option<i32>,
    parent_index: Option<u32>,
    index: Option<u32>,
    #[serde(rename = "Guid", default)]
    guids: Vec<Guid>,
    #[serde(rename = "Media", default)]
    media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Media {
    #[serde(rename = "Part", default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    file: Option<String>,
}

impl Metadata {
    fn imdb_id(&self) -> Option<&str> {
        self.guids
            .iter()
            .find_map(|g| g.id.strip_prefix("imdb://"))
    }

    /// Guid match wins; title and year are the fallback.
    fn matches(&self, title: &str, year: Option<i32>, imdb_id: Option<&str>) -> bool {
        if let (Some(wanted), Some(found)) = (imdb_id, self.imdb_id()) {
            return wanted == found;
        }
        if !self.title.eq_ignore_ascii_case(title.trim()) {
            return false;
        }
        match (year, self.year) {
            (Some(wanted), Some(found)) => wanted == found,
            _ => true,
        }
    }

    fn entry(&self) -> LibraryEntry {
        let file_count = self
            .media
            .iter()
            .flat_map(|m| &m.parts)
            .filter(|p| p.file.as_deref().is_some_and(|f| !f.is_empty()))
            .count() as u32;
        let availability = if self.media.is_empty() {
            Availability::MetadataOnly
        } else if file_count == 0 {
            Availability::Ongoing
        } else {
            Availability::Playable
        };
        LibraryEntry {
            key: self.key.clone(),
            availability,
            file_count,
        }
    }
}

impl PlexMediaServer {
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpService::new(url, timeout)?,
            token: token.to_string(),
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AppError> {
        self.http.json(self.authed(request)).await
    }

    async fn search(&self, plex_type: &str, title: &str) -> Result<Vec<Metadata>, AppError> {
        let request = self.http.get("library/all").query(&[
            ("type", plex_type),
            ("title", title),
            ("includeGuids", "1"),
        ]);
        let envelope: Envelope = self.fetch(request).await?;
        Ok(envelope.container.metadata)
    }

    async fn find_movie(&self, query: &LibraryQuery) -> Result<Option<LibraryEntry>, AppError> {
        let found = self.search(TYPE_MOVIE, &query.title).await?;
        Ok(found
            .iter()
            .find(|m| m.matches(&query.title, query.year, query.imdb_id.as_deref()))
            .map(Metadata::entry))
    }

    async fn find_episode(&self, query: &LibraryQuery) -> Result<Option<LibraryEntry>, AppError> {
        let (Some(season), Some(episode)) = (query.season, query.episode) else {
            return Ok(None);
        };
        let shows = self.search(TYPE_SHOW, &query.title).await?;
        let Some(show) = shows
            .iter()
            .find(|s| s.matches(&query.title, query.year, query.imdb_id.as_deref()))
        else {
            return Ok(None);
        };

        let request = self
            .http
            .get(&format!("library/metadata/{}/allLeaves", show.rating_key));
        let envelope: Envelope = self.fetch(request).await?;
        Ok(envelope
            .container
            .metadata
            .iter()
            .find(|e| e.parent_index == Some(season) && e.index == Some(episode))
            .map(Metadata::entry))
    }
}

#[async_trait]
impl ServiceAdapter for PlexMediaServer {
    fn name(&self) -> &str {
        "plex"
    }

    async fn probe(&self) -> ProbeStatus {
        let result = self
            .fetch::<serde_json::Value>(self.http.get("library/sections"))
            .await;
        probe_status(result)
    }
}

#[async_trait]
impl MediaServerAdapter for PlexMediaServer {
    async fn lookup_library_entry(
        &self,
        query: &LibraryQuery,
    ) -> Result<Option<LibraryEntry>, AppError> {
        let entry = match query.kind {
            ItemKind::Movie => self.find_movie(query).await?,
            ItemKind::Episode => self.find_episode(query).await?,
            // Composites are reconciled through their episodes.
            ItemKind::Show | ItemKind::Season => None,
        };
        tracing::debug!(
            title = %query.title,
            found = entry.is_some(),
            "Plex lookup"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn plex(server: &MockServer) -> PlexMediaServer {
        PlexMediaServer::new(&server.uri(), "plex-token", Duration::from_secs(5)).unwrap()
    }

    fn movie_query(imdb_id: Option<&str>) -> LibraryQuery {
        LibraryQuery {
            kind: ItemKind::Movie,
            title: "The Matrix".into(),
            year: Some(1999),
            imdb_id: imdb_id.map(String::from),
            season: None,
            episode: None,
        }
    }

    fn episode_query(season: u32, episode: u32) -> LibraryQuery {
        LibraryQuery {
            kind: ItemKind::Episode,
            title: "Breaking Bad".into(),
            year: None,
            imdb_id: Some("tt0903747".into()),
            season: Some(season),
            episode: Some(episode),
        }
    }

    async fn mount_movies(server: &MockServer, movies: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/library/all"))
            .and(query_param("type", "1"))
            .and(header("X-Plex-Token", "plex-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MediaContainer": { "size": 1, "Metadata": movies }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_movie_with_file_is_playable() {
        let server = MockServer::start().await;
        mount_movies(
            &server,
            serde_json::json!([{
                "ratingKey": "10",
                "key": "/library/metadata/10",
                "title": "The Matrix",
                "year": 1999,
                "Guid": [{ "id": "imdb://tt0133093" }, { "id": "tmdb://603" }],
                "Media": [{ "Part": [{ "file": "/movies/The Matrix (1999)/matrix.mkv" }] }]
            }]),
        )
        .await;

        let entry = plex(&server)
            .lookup_library_entry(&movie_query(Some("tt0133093")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.key, "/library/metadata/10");
        assert_eq!(entry.availability, Availability::Playable);
        assert_eq!(entry.file_count, 1);
    }

    #[tokio::test]
    async fn test_guid_mismatch_is_not_a_match() {
        let server = MockServer::start().await;
        mount_movies(
            &server,
            serde_json::json!([{
                "ratingKey": "11",
                "key": "/library/metadata/11",
                "title": "The Matrix",
                "year": 1999,
                "Guid": [{ "id": "imdb://tt9999999" }],
                "Media": [{ "Part": [{ "file": "/movies/other.mkv" }] }]
            }]),
        )
        .await;

        let entry = plex(&server)
            .lookup_library_entry(&movie_query(Some("tt0133093")))
            .await
            .unwrap();
        assert!(entry.is_none());
    }

    #[tokio::test]
    async fn test_title_year_fallback_and_availability() {
        let server = MockServer::start().await;
        mount_movies(
            &server,
            serde_json::json!([
                { "ratingKey": "1", "key": "/library/metadata/1", "title": "The Matrix", "year": 2021, "Media": [] },
                { "ratingKey": "2", "key": "/library/metadata/2", "title": "the matrix", "year": 1999 }
            ]),
        )
        .await;

        let entry = plex(&server)
            .lookup_library_entry(&movie_query(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.key, "/library/metadata/2");
        assert_eq!(entry.availability, Availability::MetadataOnly);
        assert_eq!(entry.file_count, 0);
    }

    #[tokio::test]
    async fn test_episode_lookup_walks_show_leaves() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/library/all"))
            .and(query_param("type", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MediaContainer": { "Metadata": [{
                    "ratingKey": "50",
                    "key": "/library/metadata/50/children",
                    "title": "Breaking Bad",
                    "Guid": [{ "id": "imdb://tt0903747" }]
                }]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/library/metadata/50/allLeaves"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "MediaContainer": { "Metadata": [
                    { "key": "/library/metadata/51", "title": "Pilot", "parentIndex": 1, "index": 1,
                      "Media": [{ "Part": [{ "file": "/tv/s01e01.mkv" }] }] },
                    { "key": "/library/metadata/52", "title": "Cat's in the Bag", "parentIndex": 1, "index": 2,
                      "Media": [{ "Part": [{}] }] }
                ]}
            })))
            .mount(&server)
            .await;

        let server_plex = plex(&server);
        let first = server_plex
            .lookup_library_entry(&episode_query(1, 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.key, "/library/metadata/51");
        assert_eq!(first.availability, Availability::Playable);

        let second = server_plex
            .lookup_library_entry(&episode_query(1, 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.availability, Availability::Ongoing);

        assert!(
            server_plex
                .lookup_library_entry(&episode_query(2, 1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_probe_bad_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/library/sections"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(matches!(
            plex(&server).probe().await,
            ProbeStatus::Unauthorized(_)
        ));
    }
}
