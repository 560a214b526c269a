//! Test utilities: mock adapters, factory, and reporter.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapter::{
    AdapterFactory, AdapterKind, AdapterSet, DebridAdapter, DownloadPhase, DownloadStatus,
    FailureReason, LibraryEntry, LibraryQuery, MediaServerAdapter, ProbeStatus, RawRelease,
    ScraperAdapter, ScraperEntry, SearchQuery, ServiceAdapter,
};
use crate::error::AppError;
use crate::item::{Availability, Candidate, Item, MediaRequest};
use crate::release::Resolution;
use crate::scheduler::{PipelineEvent, PipelineReporter};
use crate::settings::{ServiceName, Settings};

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Mock scraper returning a fixed release list.
#[derive(Clone)]
pub struct MockScraper {
    name: String,
    releases: Arc<Mutex<Vec<RawRelease>>>,
    /// Queue of errors. Each search pops one before falling back to `releases`.
    errors: Arc<Mutex<VecDeque<AppError>>>,
    /// When set, every search fails with a network error.
    down: Option<String>,
    probe: ProbeStatus,
    probe_delay: Option<Duration>,
    search_delay: Option<Duration>,
    queries: Arc<Mutex<Vec<SearchQuery>>>,
    probes: Arc<AtomicUsize>,
}

impl MockScraper {
    pub fn new(name: &str, releases: Vec<RawRelease>) -> Self {
        Self {
            name: name.to_string(),
            releases: Arc::new(Mutex::new(releases)),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            down: None,
            probe: ProbeStatus::Ok,
            probe_delay: None,
            search_delay: None,
            queries: Arc::new(Mutex::new(Vec::new())),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Scraper whose probe and searches both fail.
    pub fn unreachable(name: &str) -> Self {
        let mut scraper = Self::new(name, vec![]);
        scraper.down = Some("connection refused".to_string());
        scraper.probe = ProbeStatus::Unreachable("connection refused".to_string());
        scraper
    }

    /// Scraper that probes fine but whose searches fail.
    pub fn failing(name: &str, message: &str) -> Self {
        let mut scraper = Self::new(name, vec![]);
        scraper.down = Some(message.to_string());
        scraper
    }

    /// Delays every probe and search.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self.search_delay = Some(delay);
        self
    }

    /// Delays searches only; probes answer at once.
    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = Some(delay);
        self
    }

    pub fn with_probe(mut self, status: ProbeStatus) -> Self {
        self.probe = status;
        self
    }

    pub fn with_error(self, error: AppError) -> Self {
        self.errors.lock().unwrap().push_back(error);
        self
    }

    pub fn set_releases(&self, releases: Vec<RawRelease>) {
        *self.releases.lock().unwrap() = releases;
    }

    pub fn search_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ServiceAdapter for MockScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> ProbeStatus {
        self.probes.fetch_add(1, Ordering::SeqCst);
        pause(self.probe_delay).await;
        self.probe.clone()
    }
}

#[async_trait]
impl ScraperAdapter for MockScraper {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<RawRelease>, AppError> {
        self.queries.lock().unwrap().push(query.clone());
        pause(self.search_delay).await;
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        if let Some(message) = &self.down {
            return Err(AppError::NetworkError(message.clone()));
        }
        Ok(self.releases.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MockDebrid
// ---------------------------------------------------------------------------

/// Mock debrid service. Polls pop queued statuses, then report completion.
#[derive(Clone)]
pub struct MockDebrid {
    submit_errors: Arc<Mutex<VecDeque<AppError>>>,
    statuses: Arc<Mutex<VecDeque<Result<DownloadStatus, AppError>>>>,
    pub submitted: Arc<Mutex<Vec<String>>>,
    polls: Arc<AtomicUsize>,
    probe: ProbeStatus,
}

impl Default for MockDebrid {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDebrid {
    pub fn new() -> Self {
        Self {
            submit_errors: Arc::new(Mutex::new(VecDeque::new())),
            statuses: Arc::new(Mutex::new(VecDeque::new())),
            submitted: Arc::new(Mutex::new(Vec::new())),
            polls: Arc::new(AtomicUsize::new(0)),
            probe: ProbeStatus::Ok,
        }
    }

    pub fn with_submit_error(self, error: AppError) -> Self {
        self.submit_errors.lock().unwrap().push_back(error);
        self
    }

    pub fn with_statuses(self, statuses: Vec<Result<DownloadStatus, AppError>>) -> Self {
        self.statuses.lock().unwrap().extend(statuses);
        self
    }

    pub fn with_probe(mut self, status: ProbeStatus) -> Self {
        self.probe = status;
        self
    }

    pub fn push_status(&self, status: Result<DownloadStatus, AppError>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceAdapter for MockDebrid {
    fn name(&self) -> &str {
        "real_debrid"
    }

    async fn probe(&self) -> ProbeStatus {
        self.probe.clone()
    }
}

#[async_trait]
impl DebridAdapter for MockDebrid {
    async fn submit_download(&self, release: &Candidate) -> Result<String, AppError> {
        if let Some(error) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(release.release_id.clone());
        Ok(format!("rd-{}", submitted.len()))
    }

    async fn poll_download(&self, _token: &str) -> Result<DownloadStatus, AppError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(completed()))
    }
}

/// Status of a download still in progress.
pub fn downloading(progress: f64) -> DownloadStatus {
    DownloadStatus {
        phase: DownloadPhase::Downloading,
        progress,
        bytes_done: (progress * 1_000_000.0) as u64,
        bytes_total: 1_000_000,
        files: 1,
    }
}

pub fn completed() -> DownloadStatus {
    DownloadStatus {
        phase: DownloadPhase::Completed,
        progress: 1.0,
        bytes_done: 1_000_000,
        bytes_total: 1_000_000,
        files: 1,
    }
}

pub fn failed(reason: FailureReason) -> DownloadStatus {
    DownloadStatus {
        phase: DownloadPhase::Failed(reason),
        progress: 0.0,
        bytes_done: 0,
        bytes_total: 0,
        files: 0,
    }
}

// ---------------------------------------------------------------------------
// MockMediaServer
// ---------------------------------------------------------------------------

/// Mock media server. Every lookup sees the same configurable entry.
#[derive(Clone)]
pub struct MockMediaServer {
    entry: Arc<Mutex<Option<LibraryEntry>>>,
    errors: Arc<Mutex<VecDeque<AppError>>>,
    lookups: Arc<Mutex<Vec<LibraryQuery>>>,
}

impl Default for MockMediaServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaServer {
    /// Media server that has not indexed anything yet.
    pub fn new() -> Self {
        Self {
            entry: Arc::new(Mutex::new(None)),
            errors: Arc::new(Mutex::new(VecDeque::new())),
            lookups: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_entry(self, availability: Availability) -> Self {
        self.set_availability(Some(availability));
        self
    }

    pub fn with_error(self, error: AppError) -> Self {
        self.errors.lock().unwrap().push_back(error);
        self
    }

    pub fn with_file_count(self, file_count: u32) -> Self {
        if let Some(entry) = self.entry.lock().unwrap().as_mut() {
            entry.file_count = file_count;
        }
        self
    }

    pub fn set_availability(&self, availability: Option<Availability>) {
        *self.entry.lock().unwrap() = availability.map(|availability| LibraryEntry {
            key: "/library/metadata/1".to_string(),
            availability,
            file_count: 1,
        });
    }

    pub fn lookups(&self) -> Vec<LibraryQuery> {
        self.lookups.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceAdapter for MockMediaServer {
    fn name(&self) -> &str {
        "plex"
    }

    async fn probe(&self) -> ProbeStatus {
        ProbeStatus::Ok
    }
}

#[async_trait]
impl MediaServerAdapter for MockMediaServer {
    async fn lookup_library_entry(
        &self,
        query: &LibraryQuery,
    ) -> Result<Option<LibraryEntry>, AppError> {
        self.lookups.lock().unwrap().push(query.clone());
        if let Some(error) = self.errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(self.entry.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MockAdapterFactory
// ---------------------------------------------------------------------------

/// Factory handing out pre-built adapters per service.
///
/// Services without a registered adapter build as disabled.
#[derive(Clone, Default)]
pub struct MockAdapterFactory {
    adapters: Arc<Mutex<HashMap<ServiceName, AdapterKind>>>,
    builds: Arc<AtomicUsize>,
}

impl MockAdapterFactory {
    pub fn with_adapter(self, service: ServiceName, adapter: AdapterKind) -> Self {
        self.adapters.lock().unwrap().insert(service, adapter);
        self
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn build(
        &self,
        service: ServiceName,
        _settings: &Settings,
    ) -> Result<Option<AdapterKind>, AppError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(self.adapters.lock().unwrap().get(&service).cloned())
    }

    fn build_all(&self, settings: &Settings) -> Result<AdapterSet, AppError> {
        let mut set = AdapterSet::default();
        for service in ServiceName::ALL {
            match self.build(service, settings)? {
                Some(AdapterKind::Scraper(adapter)) => {
                    set.scrapers.push(ScraperEntry::new(adapter, 1));
                }
                Some(AdapterKind::Debrid(adapter)) => set.debrid = Some(adapter),
                Some(AdapterKind::MediaServer(adapter)) => set.media_server = Some(adapter),
                None => {}
            }
        }
        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock pipeline reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        self.events.lock().unwrap().push(event.label().to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A movie in CONTENT titled "The Matrix" (1999).
pub fn make_movie(id: &str) -> Item {
    Item::movie(id, "The Matrix", Some(1999))
}

/// A ranked candidate with the given id and score.
pub fn make_candidate(release_id: &str, score: u32) -> Candidate {
    Candidate {
        release_id: release_id.to_string(),
        title: format!("The.Matrix.1999.1080p.BluRay.x264-{release_id}"),
        signature: release_id.to_string(),
        score,
        adapter: "torrentio".to_string(),
        trust: 1,
        sources: vec!["torrentio".to_string()],
        resolution: Resolution::P1080,
        seeders: Some(100),
        size_bytes: None,
        published_at: None,
        seen_order: 0,
    }
}

/// A release that passes the default parser for "The Matrix" (1999).
pub fn matrix_release(hash: &str, quality: &str) -> RawRelease {
    RawRelease::new(format!("The.Matrix.1999.{quality}-GRP"), hash).with_seeders(50)
}

/// Show with one season of `episodes` episodes, parents first.
pub fn make_show(imdb_id: &str, episodes: u32) -> Vec<Item> {
    MediaRequest::show(imdb_id, "Breaking Bad", Some(2008))
        .with_season(1, 1..=episodes)
        .into_items()
        .unwrap()
}
