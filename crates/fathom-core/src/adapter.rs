//! Capability interfaces for external services.
//!
//! Every scraper, debrid service, and media server sits behind one of the
//! traits below. Adapters classify provider failures into [`AppError`] before
//! returning, so nothing above this module sees a provider's error shape.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::item::{Availability, Candidate, Item, ItemKind};
use crate::settings::{ServiceName, Settings};

/// Outcome of a cheap connectivity and credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Unreachable(String),
    Unauthorized(String),
}

impl ProbeStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeStatus::Ok)
    }

    /// Folds a failed call into a probe result.
    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::Unauthorized(msg) => ProbeStatus::Unauthorized(msg.clone()),
            other => ProbeStatus::Unreachable(other.to_string()),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProbeStatus::Ok => None,
            ProbeStatus::Unreachable(r) | ProbeStatus::Unauthorized(r) => Some(r),
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Ok => write!(f, "ok"),
            ProbeStatus::Unreachable(r) => write!(f, "unreachable: {r}"),
            ProbeStatus::Unauthorized(r) => write!(f, "unauthorized: {r}"),
        }
    }
}

/// What a scraper is asked to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub kind: ItemKind,
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl SearchQuery {
    pub fn movie(title: impl Into<String>, year: Option<i32>, imdb_id: Option<String>) -> Self {
        Self {
            kind: ItemKind::Movie,
            title: title.into(),
            year,
            imdb_id,
            season: None,
            episode: None,
        }
    }

    pub fn season(title: impl Into<String>, imdb_id: Option<String>, season: u32) -> Self {
        Self {
            kind: ItemKind::Season,
            title: title.into(),
            year: None,
            imdb_id,
            season: Some(season),
            episode: None,
        }
    }

    pub fn episode(
        title: impl Into<String>,
        year: Option<i32>,
        imdb_id: Option<String>,
        season: u32,
        episode: u32,
    ) -> Self {
        Self {
            kind: ItemKind::Episode,
            title: title.into(),
            year,
            imdb_id,
            season: Some(season),
            episode: Some(episode),
        }
    }

    pub fn for_item(item: &Item) -> Self {
        Self {
            kind: item.kind,
            title: item.title.clone(),
            year: item.year,
            imdb_id: item.imdb_id.clone(),
            season: item.season_number,
            episode: item.episode_number,
        }
    }
}

/// A release as reported by a scraper, before parsing and ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRelease {
    pub title: String,
    pub info_hash: String,
    pub seeders: Option<u32>,
    pub size_bytes: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
}

impl RawRelease {
    pub fn new(title: impl Into<String>, info_hash: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            info_hash: info_hash.into().to_lowercase(),
            seeders: None,
            size_bytes: None,
            published_at: None,
        }
    }

    pub fn with_seeders(mut self, seeders: u32) -> Self {
        self.seeders = Some(seeders);
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = Some(bytes);
        self
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }
}

/// Normalized debrid-side progress.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadStatus {
    pub phase: DownloadPhase,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub files: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPhase {
    Queued,
    Downloading,
    Completed,
    /// Terminal failure on the debrid side, already classified.
    Failed(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Dead torrent, virus, infringing file: pick a different release.
    ReleaseUnavailable(String),
    /// Quota, expired link, account problem.
    Rejected(String),
}

impl FailureReason {
    pub fn into_error(self) -> AppError {
        match self {
            FailureReason::ReleaseUnavailable(msg) => AppError::ReleaseUnavailable(msg),
            FailureReason::Rejected(msg) => AppError::Rejected(msg),
        }
    }
}

/// Correlation keys for a media-server lookup. Never a filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryQuery {
    pub kind: ItemKind,
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

impl LibraryQuery {
    pub fn for_item(item: &Item) -> Self {
        Self {
            kind: item.kind,
            title: item.title.clone(),
            year: item.year,
            imdb_id: item.imdb_id.clone(),
            season: item.season_number,
            episode: item.episode_number,
        }
    }
}

/// What the media server knows about an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryEntry {
    pub key: String,
    pub availability: Availability,
    pub file_count: u32,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Shared surface of every external service.
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> ProbeStatus;
}

/// Indexer queried for candidate releases.
#[async_trait]
pub trait ScraperAdapter: ServiceAdapter {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, AppError>;
}

/// Service that turns a located release into a downloadable one.
#[async_trait]
pub trait DebridAdapter: ServiceAdapter {
    /// Submits the release and returns the debrid handle token.
    async fn submit_download(&self, release: &Candidate) -> Result<String, AppError>;

    async fn poll_download(&self, token: &str) -> Result<DownloadStatus, AppError>;
}

/// Media server whose library is reconciled against completed downloads.
#[async_trait]
pub trait MediaServerAdapter: ServiceAdapter {
    async fn lookup_library_entry(
        &self,
        query: &LibraryQuery,
    ) -> Result<Option<LibraryEntry>, AppError>;
}

/// The fixed set of adapter variants.
#[derive(Clone)]
pub enum AdapterKind {
    Scraper(Arc<dyn ScraperAdapter>),
    Debrid(Arc<dyn DebridAdapter>),
    MediaServer(Arc<dyn MediaServerAdapter>),
}

impl AdapterKind {
    pub fn name(&self) -> &str {
        match self {
            AdapterKind::Scraper(a) => a.name(),
            AdapterKind::Debrid(a) => a.name(),
            AdapterKind::MediaServer(a) => a.name(),
        }
    }

    pub async fn probe(&self) -> ProbeStatus {
        match self {
            AdapterKind::Scraper(a) => a.probe().await,
            AdapterKind::Debrid(a) => a.probe().await,
            AdapterKind::MediaServer(a) => a.probe().await,
        }
    }

    /// Probe bounded by `timeout`; a probe that overruns counts as unreachable.
    pub async fn probe_within(&self, timeout: Duration) -> ProbeStatus {
        match tokio::time::timeout(timeout, self.probe()).await {
            Ok(status) => status,
            Err(_) => ProbeStatus::Unreachable(AppError::Timeout(timeout).to_string()),
        }
    }
}

impl fmt::Debug for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self {
            AdapterKind::Scraper(_) => "Scraper",
            AdapterKind::Debrid(_) => "Debrid",
            AdapterKind::MediaServer(_) => "MediaServer",
        };
        write!(f, "{class}({})", self.name())
    }
}

/// A configured scraper with its ranking and pacing parameters.
#[derive(Clone)]
pub struct ScraperEntry {
    pub adapter: Arc<dyn ScraperAdapter>,
    /// Secondary ranking key; higher wins.
    pub trust: u32,
    /// Minimum interval between calls, if the service limits us.
    pub min_interval: Option<Duration>,
}

impl ScraperEntry {
    pub fn new(adapter: Arc<dyn ScraperAdapter>, trust: u32) -> Self {
        Self {
            adapter,
            trust,
            min_interval: None,
        }
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

/// Immutable snapshot of every configured adapter.
#[derive(Clone, Default)]
pub struct AdapterSet {
    pub scrapers: Vec<ScraperEntry>,
    pub debrid: Option<Arc<dyn DebridAdapter>>,
    pub media_server: Option<Arc<dyn MediaServerAdapter>>,
}

impl AdapterSet {
    /// Every adapter as its typed variant.
    pub fn all(&self) -> Vec<AdapterKind> {
        let mut all: Vec<AdapterKind> = self
            .scrapers
            .iter()
            .map(|s| AdapterKind::Scraper(s.adapter.clone()))
            .collect();
        if let Some(debrid) = &self.debrid {
            all.push(AdapterKind::Debrid(debrid.clone()));
        }
        if let Some(media) = &self.media_server {
            all.push(AdapterKind::MediaServer(media.clone()));
        }
        all
    }
}

/// Live adapter set, swapped wholesale when settings are reloaded.
///
/// Readers take a cheap `Arc` snapshot and never hold the lock across an
/// adapter call.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    current: Arc<RwLock<Arc<AdapterSet>>>,
}

impl AdapterRegistry {
    pub fn new(set: AdapterSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(set))),
        }
    }

    pub fn snapshot(&self) -> Arc<AdapterSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, set: AdapterSet) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(set);
    }
}

/// Builds adapters from settings.
///
/// Lets the settings layer validate a single service and the registry rebuild
/// everything on reload without knowing concrete adapter types.
pub trait AdapterFactory: Send + Sync {
    /// Builds one service. `Ok(None)` means the service is disabled.
    fn build(&self, service: ServiceName, settings: &Settings)
    -> Result<Option<AdapterKind>, AppError>;

    /// Builds the full set of enabled adapters.
    fn build_all(&self, settings: &Settings) -> Result<AdapterSet, AppError>;
}

/// Runs an adapter call under a deadline, aborting early on cancellation.
pub async fn bounded<T, Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: Fut,
) -> Result<T, AppError>
where
    Fut: Future<Output = Result<T, AppError>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(AppError::Cancelled),
        result = tokio::time::timeout(timeout, call) => {
            result.unwrap_or(Err(AppError::Timeout(timeout)))
        }
    }
}
