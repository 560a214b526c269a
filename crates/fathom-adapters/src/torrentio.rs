//! Torrentio, a Stremio addon that answers by IMDb id.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use fathom_core::adapter::{ProbeStatus, RawRelease, ScraperAdapter, SearchQuery, ServiceAdapter};
use fathom_core::error::AppError;
use fathom_core::item::ItemKind;
use regex::Regex;
use serde::Deserialize;

use crate::http::{HttpService, probe_status};

static SEEDERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"👤\s*(\d+)").expect("valid regex"));
static SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"💾\s*([\d.]+)\s*(TB|GB|MB|KB)").expect("valid regex"));

pub struct TorrentioScraper {
    http: HttpService,
    filter: String,
}

#[derive(Debug, Deserialize)]
struct StreamsResponse {
    #[serde(default)]
    streams: Vec<Stream>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stream {
    #[serde(default)]
    title: String,
    info_hash: Option<String>,
}

impl TorrentioScraper {
    pub fn new(url: &str, filter: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpService::new(url, timeout)?,
            filter: filter.trim_matches('/').to_string(),
        })
    }

    fn prefix(&self) -> String {
        if self.filter.is_empty() {
            String::new()
        } else {
            format!("{}/", self.filter)
        }
    }

    /// Stream path for the query, or `None` if Torrentio cannot answer it.
    fn stream_path(&self, query: &SearchQuery) -> Option<String> {
        let imdb_id = query.imdb_id.as_deref()?;
        let prefix = self.prefix();
        match query.kind {
            ItemKind::Movie => Some(format!("{prefix}stream/movie/{imdb_id}.json")),
            ItemKind::Season | ItemKind::Episode => {
                let season = query.season?;
                // Season packs show up among the streams of the first episode.
                let episode = query.episode.unwrap_or(1);
                Some(format!(
                    "{prefix}stream/series/{imdb_id}:{season}:{episode}.json"
                ))
            }
            ItemKind::Show => None,
        }
    }
}

#[async_trait]
impl ServiceAdapter for TorrentioScraper {
    fn name(&self) -> &str {
        "torrentio"
    }

    async fn probe(&self) -> ProbeStatus {
        let request = self.http.get(&format!("{}manifest.json", self.prefix()));
        probe_status(self.http.send(request).await)
    }
}

#[async_trait]
impl ScraperAdapter for TorrentioScraper {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, AppError> {
        let Some(path) = self.stream_path(query) else {
            tracing::debug!(title = %query.title, "No IMDb id, skipping Torrentio");
            return Ok(Vec::new());
        };

        let response: StreamsResponse = self.http.json(self.http.get(&path)).await?;
        let releases: Vec<RawRelease> = response.streams.iter().filter_map(parse_stream).collect();
        tracing::debug!(
            title = %query.title,
            streams = response.streams.len(),
            releases = releases.len(),
            "Torrentio search complete"
        );
        Ok(releases)
    }
}

fn parse_stream(stream: &Stream) -> Option<RawRelease> {
    let hash = stream.info_hash.as_deref().filter(|h| !h.is_empty())?;
    let title = stream.title.lines().next()?.trim();
    if title.is_empty() {
        return None;
    }

    let mut release = RawRelease::new(title, hash);
    if let Some(seeders) = SEEDERS
        .captures(&stream.title)
        .and_then(|c| c[1].parse().ok())
    {
        release = release.with_seeders(seeders);
    }
    if let Some(size) = SIZE
        .captures(&stream.title)
        .and_then(|c| parse_size(&c[1], &c[2]))
    {
        release = release.with_size(size);
    }
    Some(release)
}

pub(crate) fn parse_size(amount: &str, unit: &str) -> Option<u64> {
    let amount: f64 = amount.parse().ok()?;
    let multiplier = match unit.to_ascii_uppercase().as_str() {
        "TB" => 1024f64.powi(4),
        "GB" => 1024f64.powi(3),
        "MB" => 1024f64.powi(2),
        "KB" => 1024f64,
        _ => return None,
    };
    Some((amount * multiplier) as u64)
}
