//! Jackett, an indexer proxy searched by free text.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use fathom_core::adapter::{ProbeStatus, RawRelease, ScraperAdapter, SearchQuery, ServiceAdapter};
use fathom_core::error::AppError;
use fathom_core::item::ItemKind;
use regex::Regex;
use serde::Deserialize;

use crate::http::{HttpService, probe_status};

const CATEGORY_MOVIES: &str = "2000";
const CATEGORY_TV: &str = "5000";

static BTIH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)xt=urn:btih:([0-9a-f]{40}|[a-z2-7]{32})").expect("valid regex")
});

pub struct JackettScraper {
    http: HttpService,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "Results", default)]
    results: Vec<JackettResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JackettResult {
    #[serde(default)]
    title: String,
    info_hash: Option<String>,
    magnet_uri: Option<String>,
    seeders: Option<u32>,
    size: Option<u64>,
    publish_date: Option<String>,
}

impl JackettScraper {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpService::new(url, timeout)?,
            api_key: api_key.to_string(),
        })
    }
}

/// Free-text search terms for a query.
fn search_terms(query: &SearchQuery) -> String {
    match (query.kind, query.season, query.episode) {
        (ItemKind::Episode, Some(s), Some(e)) => format!("{} S{s:02}E{e:02}", query.title),
        (ItemKind::Season, Some(s), _) => format!("{} S{s:02}", query.title),
        _ => match query.year {
            Some(year) => format!("{} {year}", query.title),
            None => query.title.clone(),
        },
    }
}

fn category(kind: ItemKind) -> &'static str {
    match kind {
        ItemKind::Movie => CATEGORY_MOVIES,
        _ => CATEGORY_TV,
    }
}

#[async_trait]
impl ServiceAdapter for JackettScraper {
    fn name(&self) -> &str {
        "jackett"
    }

    async fn probe(&self) -> ProbeStatus {
        let request = self
            .http
            .get("api/v2.0/indexers/all/results/torznab/api")
            .query(&[("apikey", self.api_key.as_str()), ("t", "caps")]);
        probe_status(self.http.send(request).await)
    }
}

#[async_trait]
impl ScraperAdapter for JackettScraper {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, AppError> {
        if query.kind == ItemKind::Show {
            return Ok(Vec::new());
        }

        let terms = search_terms(query);
        let request = self.http.get("api/v2.0/indexers/all/results").query(&[
            ("apikey", self.api_key.as_str()),
            ("Query", terms.as_str()),
            ("Category[]", category(query.kind)),
        ]);
        let response: SearchResponse = self.http.json(request).await?;

        let releases: Vec<RawRelease> = response.results.into_iter().filter_map(to_release).collect();
        tracing::debug!(%terms, releases = releases.len(), "Jackett search complete");
        Ok(releases)
    }
}

fn to_release(result: JackettResult) -> Option<RawRelease> {
    if result.title.trim().is_empty() {
        return None;
    }
    let hash = result
        .info_hash
        .filter(|h| !h.is_empty())
        .or_else(|| {
            let magnet = result.magnet_uri.as_deref()?;
            BTIH.captures(magnet).map(|c| c[1].to_string())
        })?;

    let mut release = RawRelease::new(result.title.trim(), hash);
    if let Some(seeders) = result.seeders {
        release = release.with_seeders(seeders);
    }
    if let Some(size) = result.size.filter(|s| *s > 0) {
        release = release.with_size(size);
    }
    if let Some(at) = result.publish_date.as_deref().and_then(parse_date) {
        release = release.with_published_at(at);
    }
    Some(release)
}

/// Jackett reports dates with or without an offset depending on the indexer.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
