//! Orionoid stream index.
//!
//! Authentication takes two keys: one identifying the application and one
//! identifying the user. Every response wraps a `result` envelope whose
//! status must be checked even on HTTP 200.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_core::adapter::{ProbeStatus, RawRelease, ScraperAdapter, SearchQuery, ServiceAdapter};
use fathom_core::error::AppError;
use fathom_core::item::ItemKind;
use serde::Deserialize;

use crate::http::{HttpService, probe_status};

/// The API serves at most this many streams per page.
const MAX_LIMIT: u32 = 200;

pub struct OrionoidScraper {
    http: HttpService,
    app_key: String,
    user_key: String,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: ResultStatus,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ResultStatus {
    status: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamData {
    #[serde(default)]
    streams: Vec<OrionStream>,
}

#[derive(Debug, Deserialize)]
struct OrionStream {
    file: OrionFile,
    stream: Option<StreamInfo>,
}

#[derive(Debug, Deserialize)]
struct OrionFile {
    hash: Option<String>,
    name: Option<String>,
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    seeds: Option<u32>,
    time: Option<i64>,
}

impl OrionoidScraper {
    pub fn new(
        url: &str,
        app_key: &str,
        user_key: &str,
        limit: u32,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpService::new(url, timeout)?,
            app_key: app_key.to_string(),
            user_key: user_key.to_string(),
            limit: limit.clamp(1, MAX_LIMIT),
        })
    }

    fn auth(&self) -> [(&'static str, String); 2] {
        [
            ("keyapp", self.app_key.clone()),
            ("keyuser", self.user_key.clone()),
        ]
    }

    fn stream_params(&self, query: &SearchQuery) -> Option<Vec<(&'static str, String)>> {
        let imdb_id = query.imdb_id.as_deref()?;
        let numeric = imdb_id.trim_start_matches("tt").to_string();

        let mut params = vec![
            ("mode", "stream".to_string()),
            ("action", "retrieve".to_string()),
            ("idimdb", numeric),
            ("streamtype", "torrent".to_string()),
            ("filename", "true".to_string()),
            ("limitcount", self.limit.to_string()),
            ("video3d", "false".to_string()),
            ("sortorder", "descending".to_string()),
            ("sortvalue", "popularity".to_string()),
        ];
        match query.kind {
            ItemKind::Movie => params.push(("type", "movie".to_string())),
            ItemKind::Season | ItemKind::Episode => {
                params.push(("type", "show".to_string()));
                params.push(("numberseason", query.season?.to_string()));
                params.push((
                    "numberepisode",
                    query.episode.unwrap_or(1).to_string(),
                ));
            }
            ItemKind::Show => return None,
        }
        params.extend(self.auth());
        Some(params)
    }
}

/// Maps a non-success envelope onto the error taxonomy.
fn envelope_error(result: &ResultStatus) -> AppError {
    let detail = if result.message.is_empty() {
        format!("{} ({})", result.status, result.kind)
    } else {
        result.message.clone()
    };
    if result.kind.contains("key") {
        AppError::Unauthorized(detail)
    } else if result.kind.contains("limit") {
        AppError::RateLimitExceeded
    } else {
        AppError::HttpError(format!("Orionoid: {detail}"))
    }
}

#[async_trait]
impl ServiceAdapter for OrionoidScraper {
    fn name(&self) -> &str {
        "orionoid"
    }

    async fn probe(&self) -> ProbeStatus {
        let mut params = vec![
            ("mode", "user".to_string()),
            ("action", "retrieve".to_string()),
        ];
        params.extend(self.auth());
        let result = self
            .http
            .json::<Envelope<serde_json::Value>>(self.http.get("").query(&params))
            .await
            .and_then(|envelope| {
                if envelope.result.status == "success" {
                    Ok(())
                } else {
                    Err(AppError::Unauthorized(format!(
                        "status {}",
                        envelope.result.status
                    )))
                }
            });
        probe_status(result)
    }
}

#[async_trait]
impl ScraperAdapter for OrionoidScraper {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, AppError> {
        let Some(params) = self.stream_params(query) else {
            return Ok(Vec::new());
        };

        let envelope: Envelope<StreamData> =
            self.http.json(self.http.get("").query(&params)).await?;
        if envelope.result.status != "success" {
            // A title Orionoid has no streams for is reported as an error.
            if envelope.result.kind.starts_with("stream") {
                return Ok(Vec::new());
            }
            return Err(envelope_error(&envelope.result));
        }

        let streams = envelope.data.map(|d| d.streams).unwrap_or_default();
        let total = streams.len();
        let releases: Vec<RawRelease> = streams.into_iter().filter_map(to_release).collect();
        tracing::debug!(title = %query.title, total, releases = releases.len(), "Orionoid search complete");
        Ok(releases)
    }
}

fn to_release(stream: OrionStream) -> Option<RawRelease> {
    let hash = stream.file.hash.filter(|h| !h.is_empty())?;
    let name = stream.file.name.filter(|n| !n.is_empty())?;

    let mut release = RawRelease::new(name, hash);
    if let Some(size) = stream.file.size {
        release = release.with_size(size);
    }
    if let Some(info) = stream.stream {
        if let Some(seeds) = info.seeds {
            release = release.with_seeders(seeds);
        }
        if let Some(at) = info.time.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0)) {
            release = release.with_published_at(at);
        }
    }
    Some(release)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn scraper(server: &MockServer) -> OrionoidScraper {
        OrionoidScraper::new(&server.uri(), "APPKEY", "USERKEY", 500, Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_show_search_sends_numbers_and_caps_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("mode", "stream"))
            .and(query_param("type", "show"))
            .and(query_param("idimdb", "0903747"))
            .and(query_param("numberseason", "2"))
            .and(query_param("numberepisode", "1"))
            .and(query_param("limitcount", "200"))
            .and(query_param("keyapp", "APPKEY"))
            .and(query_param("keyuser", "USERKEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "status": "success", "type": "streamretrieve" },
                "data": {
                    "streams": [
                        {
                            "file": { "hash": "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC", "name": "Breaking.Bad.S02.1080p", "size": 10000 },
                            "stream": { "seeds": 55, "time": 1700000000 }
                        },
                        { "file": { "hash": null, "name": "Missing.Hash" } }
                    ]
                }
            })))
            .mount(&server)
            .await;

        let query = SearchQuery::season("Breaking Bad", Some("tt0903747".into()), 2);
        let releases = scraper(&server).search(&query).await.unwrap();

        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].title, "Breaking.Bad.S02.1080p");
        assert_eq!(releases[0].info_hash, "c".repeat(40));
        assert_eq!(releases[0].seeders, Some(55));
        assert!(releases[0].published_at.is_some());
    }

    #[tokio::test]
    async fn test_no_streams_is_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "status": "error", "type": "streammissing", "message": "No streams" }
            })))
            .mount(&server)
            .await;

        let query = SearchQuery::movie("Obscure", None, Some("tt1".into()));
        assert!(scraper(&server).search(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_user_key_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "status": "error", "type": "userkey", "message": "Invalid user key" }
            })))
            .mount(&server)
            .await;

        let query = SearchQuery::movie("The Matrix", None, Some("tt0133093".into()));
        let err = scraper(&server).search(&query).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(matches!(
            scraper(&server).probe().await,
            ProbeStatus::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_accepts_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("mode", "user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": { "status": "success" },
                "data": { "status": "active" }
            })))
            .mount(&server)
            .await;

        assert_eq!(scraper(&server).probe().await, ProbeStatus::Ok);
    }
}
