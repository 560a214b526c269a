//! Pipeline scheduler: moves items through scrape, download, and reconcile.
//!
//! Every wakeup for an item goes through one router task. The router drops
//! wakeups for items that are already queued or being worked on, arms a
//! timer for deferred items, and hands the rest to the stage's dispatcher.
//! Dispatchers bound concurrency with a semaphore per stage and run each
//! item on the shared [`TaskTracker`], so shutdown waits for in-flight work.
//!
//! Writes are compare-and-set against the state a worker read. A lost race
//! is never an error: the winner's change event wakes the item again.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::adapter::{AdapterRegistry, AdapterSet};
use crate::download::DownloadManager;
use crate::error::{AppError, ErrorKind};
use crate::health::HealthGate;
use crate::item::{DownloadHandle, Item, ItemError, ItemFilter, ItemKind, ItemState, MediaRequest};
use crate::reconcile::{LibraryReconciler, Reconciled};
use crate::release::ParserSettings;
use crate::retry::{RescrapePolicy, RetryConfig};
use crate::scrape::{ScrapeOrchestrator, apply_pack};
use crate::settings::Settings;
use crate::state::{Stage, exhausted, rollup};
use crate::store::{DEFAULT_PAGE_SIZE, EventedStore, ItemEvent, ItemStore, collect_items, list_items};
use crate::throttle::Throttle;

/// Minimum spacing between calls to the debrid service.
pub const DEBRID_MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Compare-and-set retries when recomputing a parent's rollup.
const MAX_ROLLUP_ATTEMPTS: usize = 5;

/// Compare-and-set retries for operator-driven writes.
const MAX_CAS_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables for a running pipeline, resolved from [`Settings`] at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Identifies this pipeline instance in logs.
    pub instance_id: String,
    pub scrape_concurrency: usize,
    pub download_concurrency: usize,
    pub reconcile_concurrency: usize,
    pub scrape_retry: RetryConfig,
    pub download_retry: RetryConfig,
    pub reconcile_retry: RetryConfig,
    pub adapter_timeout: Duration,
    /// Spacing between progress polls of an active download.
    pub poll_interval: Duration,
    /// Spacing between library lookups for a finished download.
    pub reconcile_interval: Duration,
    /// How long a finished download may stay invisible to the media server.
    pub reconcile_timeout: Duration,
    /// Spacing between rechecks of partially available library items.
    pub library_recheck: Duration,
    /// Full store scan interval; catches anything a lost wakeup missed.
    pub sweep_interval: Duration,
    pub release_retry_budget: u32,
    /// Season-pack searches before episodes are scraped one by one.
    pub pack_attempts: u32,
    pub debrid_interval: Duration,
    pub rescrape: RescrapePolicy,
    pub parser: ParserSettings,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let general = &settings.general;
        Self {
            instance_id: format!("pipeline-{}", &Uuid::new_v4().to_string()[..8]),
            scrape_concurrency: general.concurrency.scrape.max(1),
            download_concurrency: general.concurrency.download.max(1),
            reconcile_concurrency: general.concurrency.reconcile.max(1),
            scrape_retry: RetryConfig::from(&general.retry.scrape),
            download_retry: RetryConfig::from(&general.retry.download),
            reconcile_retry: RetryConfig::from(&general.retry.reconcile),
            adapter_timeout: settings.adapter_timeout(),
            poll_interval: Duration::from_secs(general.poll_interval_secs.max(1)),
            reconcile_interval: Duration::from_secs(general.reconcile_interval_secs.max(1)),
            reconcile_timeout: Duration::from_secs(general.reconcile_timeout_secs),
            library_recheck: Duration::from_secs(general.library_recheck_secs.max(1)),
            sweep_interval: Duration::from_secs(general.sweep_interval_secs.max(1)),
            release_retry_budget: general.release_retry_budget,
            pack_attempts: settings.scrapers.pack_attempts,
            debrid_interval: DEBRID_MIN_INTERVAL,
            rescrape: settings.scrapers.rescrape_policy(),
            parser: settings.scrapers.parser.clone(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn concurrency(&self, stage: Stage) -> usize {
        match stage {
            Stage::Scrape => self.scrape_concurrency,
            Stage::Download => self.download_concurrency,
            Stage::Reconcile => self.reconcile_concurrency,
        }
    }

    pub fn retry(&self, stage: Stage) -> &RetryConfig {
        match stage {
            Stage::Scrape => &self.scrape_retry,
            Stage::Download => &self.download_retry,
            Stage::Reconcile => &self.reconcile_retry,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started {
        instance_id: &'a str,
    },
    Swept {
        items: usize,
    },
    Dispatched {
        item_id: &'a str,
        stage: Stage,
    },
    Transitioned {
        item_id: &'a str,
        from: ItemState,
        to: ItemState,
    },
    Progress {
        item_id: &'a str,
        progress: f64,
    },
    RetryScheduled {
        item_id: &'a str,
        stage: Stage,
        attempt: u32,
        delay: Duration,
        error: &'a str,
    },
    Remediated {
        item_id: &'a str,
        release_id: &'a str,
    },
    Failed {
        item_id: &'a str,
        stage: Stage,
        error: &'a str,
    },
    Conflict {
        item_id: &'a str,
    },
    RolledUp {
        item_id: &'a str,
        from: ItemState,
        to: ItemState,
    },
    Removed {
        item_id: &'a str,
    },
    Stopped {
        instance_id: &'a str,
    },
}

impl PipelineEvent<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            PipelineEvent::Started { .. } => "started",
            PipelineEvent::Swept { .. } => "swept",
            PipelineEvent::Dispatched { .. } => "dispatched",
            PipelineEvent::Transitioned { .. } => "transitioned",
            PipelineEvent::Progress { .. } => "progress",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::Remediated { .. } => "remediated",
            PipelineEvent::Failed { .. } => "failed",
            PipelineEvent::Conflict { .. } => "conflict",
            PipelineEvent::RolledUp { .. } => "rolled_up",
            PipelineEvent::Removed { .. } => "removed",
            PipelineEvent::Stopped { .. } => "stopped",
        }
    }
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl PipelineReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started { instance_id } => {
                tracing::info!(%instance_id, "Pipeline started");
            }
            PipelineEvent::Swept { items } => {
                tracing::debug!(%items, "Store swept");
            }
            PipelineEvent::Dispatched { item_id, stage } => {
                tracing::debug!(%item_id, %stage, "Item dispatched");
            }
            PipelineEvent::Transitioned { item_id, from, to } => {
                tracing::info!(%item_id, %from, %to, "Item transitioned");
            }
            PipelineEvent::Progress { item_id, progress } => {
                tracing::debug!(%item_id, %progress, "Download progress");
            }
            PipelineEvent::RetryScheduled {
                item_id,
                stage,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(
                    %item_id,
                    %stage,
                    %attempt,
                    delay_secs = delay.as_secs(),
                    %error,
                    "Stage failed, will retry"
                );
            }
            PipelineEvent::Remediated {
                item_id,
                release_id,
            } => {
                tracing::info!(%item_id, %release_id, "Release excluded, rescraping");
            }
            PipelineEvent::Failed {
                item_id,
                stage,
                error,
            } => {
                tracing::error!(%item_id, %stage, %error, "Item failed");
            }
            PipelineEvent::Conflict { item_id } => {
                tracing::debug!(%item_id, "Lost a write race, skipping");
            }
            PipelineEvent::RolledUp { item_id, from, to } => {
                tracing::info!(%item_id, %from, %to, "Parent state rolled up");
            }
            PipelineEvent::Removed { item_id } => {
                tracing::info!(%item_id, "Item removed");
            }
            PipelineEvent::Stopped { instance_id } => {
                tracing::info!(%instance_id, "Pipeline stopped");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where a wakeup sends an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Stage(Stage),
    /// Deferred; wake again after the delay.
    After(Duration),
    /// Nothing to do until something changes.
    Idle,
}

/// Decides the next step for `item`.
///
/// `parent` is only consulted for episodes that have not been scraped yet:
/// they wait while their season still has pack searches left.
pub fn route(item: &Item, parent: Option<&Item>, pack_attempts: u32, now: DateTime<Utc>) -> Route {
    if let Some(at) = item.next_attempt_at
        && at > now
    {
        return Route::After((at - now).to_std().unwrap_or_default());
    }

    match item.kind {
        ItemKind::Show => Route::Idle,
        ItemKind::Season => {
            if item.state == ItemState::Content && item.scrape_attempts < pack_attempts {
                Route::Stage(Stage::Scrape)
            } else {
                Route::Idle
            }
        }
        ItemKind::Movie | ItemKind::Episode => match item.state {
            ItemState::Content | ItemState::ScrapedNotFound => {
                if parent.is_some_and(|season| awaits_pack(season, pack_attempts)) {
                    Route::Idle
                } else {
                    Route::Stage(Stage::Scrape)
                }
            }
            ItemState::Scraped if item.chosen_release.is_some() => Route::Stage(Stage::Download),
            ItemState::Scraped => Route::Stage(Stage::Scrape),
            ItemState::Downloading => match &item.download {
                Some(handle) if handle.is_complete() => Route::Stage(Stage::Reconcile),
                Some(_) => Route::Stage(Stage::Download),
                None => Route::Idle,
            },
            ItemState::LibraryOngoing | ItemState::LibraryMetadata => {
                Route::Stage(Stage::Reconcile)
            }
            _ => Route::Idle,
        },
    }
}

fn awaits_pack(season: &Item, pack_attempts: u32) -> bool {
    season.kind == ItemKind::Season
        && season.state == ItemState::Content
        && season.scrape_attempts < pack_attempts
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tracking {
    queued: HashSet<String>,
    active: HashSet<String>,
    in_flight: HashMap<String, CancellationToken>,
    timers: HashMap<String, (u64, CancellationToken)>,
    next_timer: u64,
}

struct Receivers {
    wake: mpsc::UnboundedReceiver<String>,
    scrape: mpsc::UnboundedReceiver<String>,
    download: mpsc::UnboundedReceiver<String>,
    reconcile: mpsc::UnboundedReceiver<String>,
}

struct StageQueue {
    tx: mpsc::UnboundedSender<String>,
    permits: Arc<Semaphore>,
}

struct Shared<S: ItemStore> {
    store: EventedStore<S>,
    registry: AdapterRegistry,
    orchestrator: ScrapeOrchestrator,
    downloads: DownloadManager,
    reconciler: LibraryReconciler,
    config: PipelineConfig,
    reporter: Arc<dyn PipelineReporter>,
    wake_tx: mpsc::UnboundedSender<String>,
    scrape: StageQueue,
    download: StageQueue,
    reconcile: StageQueue,
    tracking: Mutex<Tracking>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Handle to the item pipeline. Cheap to clone.
pub struct Pipeline<S: ItemStore> {
    shared: Arc<Shared<S>>,
}

impl<S: ItemStore> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: ItemStore + 'static> Pipeline<S> {
    pub fn new(
        store: EventedStore<S>,
        registry: AdapterRegistry,
        health: HealthGate,
        config: PipelineConfig,
    ) -> Self {
        Self::with_reporter(store, registry, health, config, Arc::new(TracingReporter))
    }

    pub fn with_reporter(
        store: EventedStore<S>,
        registry: AdapterRegistry,
        health: HealthGate,
        config: PipelineConfig,
        reporter: Arc<dyn PipelineReporter>,
    ) -> Self {
        let throttle = Throttle::new();
        let orchestrator = ScrapeOrchestrator::new(
            health.clone(),
            throttle.clone(),
            config.adapter_timeout,
            config.parser.clone(),
            config.rescrape.clone(),
        );
        let downloads = DownloadManager::new(
            health.clone(),
            throttle,
            config.adapter_timeout,
            config.debrid_interval,
            config.release_retry_budget,
        );
        let reconciler =
            LibraryReconciler::new(health, config.adapter_timeout, config.reconcile_timeout);

        let (wake_tx, wake) = mpsc::unbounded_channel();
        let (scrape_tx, scrape) = mpsc::unbounded_channel();
        let (download_tx, download) = mpsc::unbounded_channel();
        let (reconcile_tx, reconcile) = mpsc::unbounded_channel();
        let queue = |tx, stage| StageQueue {
            tx,
            permits: Arc::new(Semaphore::new(config.concurrency(stage))),
        };
        let (scrape_queue, download_queue, reconcile_queue) = (
            queue(scrape_tx, Stage::Scrape),
            queue(download_tx, Stage::Download),
            queue(reconcile_tx, Stage::Reconcile),
        );

        let shared = Shared {
            store,
            registry,
            orchestrator,
            downloads,
            reconciler,
            reporter,
            wake_tx,
            scrape: scrape_queue,
            download: download_queue,
            reconcile: reconcile_queue,
            tracking: Mutex::new(Tracking::default()),
            receivers: Mutex::new(Some(Receivers {
                wake,
                scrape,
                download,
                reconcile,
            })),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn store(&self) -> &EventedStore<S> {
        &self.shared.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Whether a worker currently holds `id`.
    pub fn is_active(&self, id: &str) -> bool {
        self.shared.tracking().active.contains(id)
    }

    /// Asks the router to look at `id` again.
    pub fn wake(&self, id: &str) {
        self.shared.wake(id);
    }

    /// Runs the pipeline until `shutdown` fires, then drains in-flight work.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AppError> {
        let receivers = self
            .shared
            .receivers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| AppError::Generic("pipeline is already running".into()))?;
        let shared = &self.shared;
        shared.reporter.report(PipelineEvent::Started {
            instance_id: &shared.config.instance_id,
        });

        let events = shared.store.subscribe();
        shared.tracker.spawn(route_loop(Arc::clone(shared), receivers.wake));
        shared
            .tracker
            .spawn(dispatch_loop(Arc::clone(shared), Stage::Scrape, receivers.scrape));
        shared
            .tracker
            .spawn(dispatch_loop(Arc::clone(shared), Stage::Download, receivers.download));
        shared
            .tracker
            .spawn(dispatch_loop(Arc::clone(shared), Stage::Reconcile, receivers.reconcile));
        shared.tracker.spawn(listen_loop(Arc::clone(shared), events));
        shared.tracker.spawn(sweep_loop(Arc::clone(shared)));

        tokio::select! {
            () = shutdown.cancelled() => {}
            () = shared.shutdown.cancelled() => {}
        }
        shared.shutdown.cancel();
        shared.tracker.close();
        shared.tracker.wait().await;

        shared.reporter.report(PipelineEvent::Stopped {
            instance_id: &shared.config.instance_id,
        });
        Ok(())
    }

    /// Stores a new request and starts it moving.
    ///
    /// Items that already exist are left as they are, so repeating a request
    /// only adds what is new.
    pub async fn intake(&self, request: MediaRequest) -> Result<Vec<Item>, AppError> {
        let items = request.into_items()?;
        let shared = &self.shared;

        let mut parents: Vec<String> = Vec::new();
        for item in &items {
            if shared.store.insert_new(item).await? {
                tracing::info!(item_id = %item.id, kind = %item.kind, "Item requested");
            }
            if let Some(parent) = &item.parent
                && !parents.contains(parent)
            {
                parents.push(parent.clone());
            }
        }
        // Deepest parents first so seasons settle before their show.
        for parent in parents.iter().rev() {
            shared.rollup_one(parent).await?;
        }

        let mut stored = Vec::with_capacity(items.len());
        for item in items {
            shared.wake(&item.id);
            match shared.store.get(&item.id).await? {
                Some(current) => stored.push(current),
                None => stored.push(item),
            }
        }
        Ok(stored)
    }

    /// Sends a failed or not-found item back into the pipeline.
    ///
    /// Retrying a show or season retries every failed or not-found episode
    /// under it.
    pub async fn retry(&self, id: &str) -> Result<Item, AppError> {
        let shared = &self.shared;
        let item = shared
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;
        if !item.is_composite() {
            return shared.retry_leaf(id).await;
        }

        let mut retried = 0;
        for leaf in shared.leaves_of(id).await? {
            if !matches!(leaf.state, ItemState::Error | ItemState::ScrapedNotFound) {
                continue;
            }
            match shared.retry_leaf(&leaf.id).await {
                Ok(_) => retried += 1,
                Err(e) if e.kind() == ErrorKind::Conflict => {}
                Err(e) => return Err(e),
            }
        }
        if retried == 0 {
            return Err(AppError::InvalidRequest(format!(
                "nothing under {id} needs a retry"
            )));
        }
        shared
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound(id.to_string()))
    }

    /// Deletes an item and cancels any work in flight for it.
    ///
    /// With `cascade`, descendants go too; otherwise they stay and keep
    /// moving on their own. Returns the removed ids.
    pub async fn remove(&self, id: &str, cascade: bool) -> Result<Vec<String>, AppError> {
        let shared = &self.shared;
        let item = shared
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;

        let mut ids = vec![item.id.clone()];
        if cascade {
            let mut frontier = vec![item.id.clone()];
            while let Some(next) = frontier.pop() {
                for child in collect_items(&shared.store, ItemFilter::children_of(&next)).await? {
                    frontier.push(child.id.clone());
                    ids.push(child.id);
                }
            }
        }

        // Children before parents, so a failure never leaves orphans behind.
        for removed in ids.iter().rev() {
            shared.cancel_work(removed);
            if shared.store.remove(removed).await?.is_some() {
                shared.reporter.report(PipelineEvent::Removed { item_id: removed });
            }
        }
        shared.propagate_up(item.parent.clone()).await;
        Ok(ids)
    }

    /// Wakes every item that may still have work to do.
    pub async fn sweep(&self) -> Result<usize, AppError> {
        self.shared.sweep().await
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn route_loop<S: ItemStore + 'static>(
    shared: Arc<Shared<S>>,
    mut wakeups: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let id = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = wakeups.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        if let Err(e) = shared.route_one(&id).await {
            tracing::warn!(item_id = %id, error = %e, "Failed to route item");
        }
    }
}

async fn dispatch_loop<S: ItemStore + 'static>(
    shared: Arc<Shared<S>>,
    stage: Stage,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    let permits = Arc::clone(&shared.queue(stage).permits);
    loop {
        let id = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(id) => id,
                None => break,
            },
        };
        let permit = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let worker = Arc::clone(&shared);
        shared.tracker.spawn(worker.work(stage, id, permit));
    }
}

async fn listen_loop<S: ItemStore + 'static>(
    shared: Arc<Shared<S>>,
    mut events: broadcast::Receiver<ItemEvent>,
) {
    loop {
        let event = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(ItemEvent::Changed { id, .. }) => shared.wake(&id),
            Ok(ItemEvent::Removed { id, .. }) => shared.cancel_work(&id),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(%missed, "Change feed lagged, sweeping");
                if let Err(e) = shared.sweep().await {
                    tracing::warn!(error = %e, "Sweep failed");
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn sweep_loop<S: ItemStore + 'static>(shared: Arc<Shared<S>>) {
    // First tick fires immediately: picks up whatever was pending at startup.
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    loop {
        tokio::select! {
            () = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.sweep().await {
                    tracing::warn!(error = %e, "Sweep failed");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduling internals
// ---------------------------------------------------------------------------

impl<S: ItemStore + 'static> Shared<S> {
    fn tracking(&self) -> MutexGuard<'_, Tracking> {
        self.tracking.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn queue(&self, stage: Stage) -> &StageQueue {
        match stage {
            Stage::Scrape => &self.scrape,
            Stage::Download => &self.download,
            Stage::Reconcile => &self.reconcile,
        }
    }

    fn wake(&self, id: &str) {
        // Fails only once the router is gone, i.e. during shutdown.
        let _ = self.wake_tx.send(id.to_string());
    }

    /// Cancels in-flight work and pending timers for `id`.
    fn cancel_work(&self, id: &str) {
        let mut tracking = self.tracking();
        if let Some(token) = tracking.in_flight.get(id) {
            token.cancel();
        }
        if let Some((_, timer)) = tracking.timers.remove(id) {
            timer.cancel();
        }
        tracking.queued.remove(id);
    }

    async fn route_of(&self, item: &Item) -> Result<Route, AppError> {
        let parent = match (&item.parent, item.kind, item.state) {
            (Some(parent), ItemKind::Episode, ItemState::Content | ItemState::ScrapedNotFound) => {
                self.store.get(parent).await?
            }
            _ => None,
        };
        Ok(route(
            item,
            parent.as_ref(),
            self.config.pack_attempts,
            Utc::now(),
        ))
    }

    async fn route_one(self: &Arc<Self>, id: &str) -> Result<(), AppError> {
        {
            let mut tracking = self.tracking();
            if let Some((_, timer)) = tracking.timers.remove(id) {
                timer.cancel();
            }
            if tracking.active.contains(id) || tracking.queued.contains(id) {
                return Ok(());
            }
        }

        let Some(item) = self.store.get(id).await? else {
            return Ok(());
        };
        match self.route_of(&item).await? {
            Route::Stage(stage) => self.enqueue(stage, id),
            Route::After(delay) => self.schedule(id, delay),
            Route::Idle => {}
        }
        Ok(())
    }

    fn enqueue(&self, stage: Stage, id: &str) {
        self.tracking().queued.insert(id.to_string());
        if self.queue(stage).tx.send(id.to_string()).is_ok() {
            self.reporter
                .report(PipelineEvent::Dispatched { item_id: id, stage });
        }
    }

    fn schedule(self: &Arc<Self>, id: &str, delay: Duration) {
        let token = self.shutdown.child_token();
        let generation = {
            let mut tracking = self.tracking();
            tracking.next_timer += 1;
            let generation = tracking.next_timer;
            tracking
                .timers
                .insert(id.to_string(), (generation, token.clone()));
            generation
        };

        let shared = Arc::clone(self);
        let id = id.to_string();
        self.tracker.spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let fired = {
                        let mut tracking = shared.tracking();
                        let current = tracking
                            .timers
                            .get(&id)
                            .is_some_and(|(g, _)| *g == generation);
                        if current {
                            tracking.timers.remove(&id);
                        }
                        current
                    };
                    if fired {
                        shared.wake(&id);
                    }
                }
            }
        });
    }

    async fn work(self: Arc<Self>, stage: Stage, id: String, permit: OwnedSemaphorePermit) {
        let cancel = self.shutdown.child_token();
        {
            let mut tracking = self.tracking();
            tracking.queued.remove(&id);
            tracking.active.insert(id.clone());
            tracking.in_flight.insert(id.clone(), cancel.clone());
        }

        if let Err(e) = self.process(stage, &id, &cancel).await {
            tracing::error!(item_id = %id, %stage, error = %e, "Failed to record stage outcome");
        }

        {
            let mut tracking = self.tracking();
            tracking.active.remove(&id);
            tracking.in_flight.remove(&id);
        }
        drop(permit);
        if !self.shutdown.is_cancelled() {
            self.wake(&id);
        }
    }

    async fn process(
        &self,
        stage: Stage,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let Some(item) = self.store.get(id).await? else {
            return Ok(());
        };
        // The item may have moved on since it was queued.
        if self.route_of(&item).await? != Route::Stage(stage) {
            return Ok(());
        }

        let adapters = self.registry.snapshot();
        let outcome = match stage {
            Stage::Scrape => self.run_scrape(&item, &adapters, cancel).await,
            Stage::Download => self.run_download(&item, &adapters, cancel).await,
            Stage::Reconcile => self.run_reconcile(&item, &adapters, cancel).await,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => self.handle_failure(stage, &item, e).await,
        }
    }

    // -- stages ---------------------------------------------------------------

    async fn run_scrape(
        &self,
        item: &Item,
        adapters: &AdapterSet,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let (next, report) = self
            .orchestrator
            .scrape(item, &adapters.scrapers, cancel)
            .await?;
        if !report.unreachable.is_empty() {
            tracing::info!(
                item_id = %item.id,
                unreachable = ?report.unreachable_names(),
                "Scraped with some services unreachable"
            );
        }

        if !next.is_composite() {
            self.commit(&next, item.state).await?;
            return Ok(());
        }

        // Episodes stay held until the season records this attempt, so the
        // pack lands on them before any of them scrapes on its own.
        if !next.candidates.is_empty() {
            self.apply_pack_to_children(&next).await?;
        }
        let attempts = next.scrape_attempts;
        let candidates = next.candidates;
        let retry_at = (candidates.is_empty() && attempts < self.config.pack_attempts)
            .then(|| Utc::now() + self.orchestrator.rescrape_delay(attempts));
        self.update_composite(&item.id, move |season| {
            season.clear_failure();
            season.scrape_attempts = attempts;
            season.candidates = candidates.clone();
            season.next_attempt_at = retry_at;
            season.touch();
        })
        .await?;
        self.wake_children(&item.id).await
    }

    async fn run_download(
        &self,
        item: &Item,
        adapters: &AdapterSet,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let debrid = adapters
            .debrid
            .clone()
            .ok_or(AppError::NotConfigured("debrid"))?;

        match item.state {
            ItemState::Scraped => {
                let next = match self.shared_download(item).await? {
                    Some(handle) => {
                        tracing::info!(item_id = %item.id, token = %handle.token, "Joining sibling download");
                        self.downloads.adopt(item, &handle)?
                    }
                    None => self.downloads.start(item, &debrid, cancel).await?,
                };
                self.commit(&next, item.state).await?;
            }
            ItemState::Downloading => {
                let mut next = self.downloads.poll(item, &debrid, cancel).await?;
                match &next.download {
                    Some(handle) if !handle.is_complete() => {
                        self.reporter.report(PipelineEvent::Progress {
                            item_id: &item.id,
                            progress: handle.progress,
                        });
                        next.next_attempt_at = Some(Utc::now() + self.config.poll_interval);
                    }
                    _ => {}
                }
                self.commit(&next, item.state).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn run_reconcile(
        &self,
        item: &Item,
        adapters: &AdapterSet,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let media = adapters
            .media_server
            .clone()
            .ok_or(AppError::NotConfigured("media server"))?;

        let mut next = match self.reconciler.reconcile(item, &media, cancel).await? {
            Reconciled::Visible(next) => next,
            Reconciled::NotYetVisible => {
                let mut next = item.clone();
                next.clear_failure();
                next.touch();
                next
            }
        };
        let wait = match next.state {
            ItemState::Library => None,
            ItemState::Downloading => Some(self.config.reconcile_interval),
            _ => Some(self.config.library_recheck),
        };
        if let Some(wait) = wait {
            next.next_attempt_at = Some(Utc::now() + wait);
        }
        self.commit(&next, item.state).await?;
        Ok(())
    }

    /// Handle of a sibling episode already downloading the same release.
    async fn shared_download(&self, item: &Item) -> Result<Option<DownloadHandle>, AppError> {
        let (Some(parent), Some(chosen)) = (&item.parent, &item.chosen_release) else {
            return Ok(None);
        };
        let siblings = collect_items(
            &self.store,
            ItemFilter::children_of(parent).with_states([ItemState::Downloading]),
        )
        .await?;
        Ok(siblings
            .into_iter()
            .filter(|s| s.id != item.id)
            .filter_map(|s| s.download)
            .find(|handle| handle.release.release_id == chosen.release_id))
    }

    async fn apply_pack_to_children(&self, season: &Item) -> Result<(), AppError> {
        let children = collect_items(&self.store, ItemFilter::children_of(&season.id)).await?;
        let mut applied = 0;
        for child in children {
            let mut next = child.clone();
            if !apply_pack(&mut next, &season.candidates)? {
                continue;
            }
            match self.store.cas_update(&next, child.state).await {
                Ok(stored) => {
                    applied += 1;
                    self.reporter.report(PipelineEvent::Transitioned {
                        item_id: &stored.id,
                        from: child.state,
                        to: stored.state,
                    });
                }
                Err(e) if e.kind() == ErrorKind::Conflict => {
                    self.reporter
                        .report(PipelineEvent::Conflict { item_id: &child.id });
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(season_id = %season.id, %applied, "Season pack applied");
        self.propagate_up(Some(season.id.clone())).await;
        Ok(())
    }

    async fn wake_children(&self, id: &str) -> Result<(), AppError> {
        for child in collect_items(&self.store, ItemFilter::children_of(id)).await? {
            self.wake(&child.id);
        }
        Ok(())
    }

    async fn leaves_of(&self, id: &str) -> Result<Vec<Item>, AppError> {
        let mut leaves = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(next) = frontier.pop() {
            for child in collect_items(&self.store, ItemFilter::children_of(&next)).await? {
                if child.is_composite() {
                    frontier.push(child.id);
                } else {
                    leaves.push(child);
                }
            }
        }
        Ok(leaves)
    }

    // -- writes ---------------------------------------------------------------

    /// Writes `next` if the stored item is still in `expected`, then updates
    /// the parents' rollup.
    async fn commit(&self, next: &Item, expected: ItemState) -> Result<Item, AppError> {
        let stored = self.store.cas_update(next, expected).await?;
        if stored.state != expected {
            self.reporter.report(PipelineEvent::Transitioned {
                item_id: &stored.id,
                from: expected,
                to: stored.state,
            });
            if !stored.is_composite() {
                self.propagate_up(stored.parent.clone()).await;
            }
        }
        Ok(stored)
    }

    /// Recomputes rollups from `parent` upward until one stays the same.
    async fn propagate_up(&self, mut parent: Option<String>) {
        while let Some(id) = parent {
            match self.rollup_one(&id).await {
                Ok(Some(updated)) => parent = updated.parent,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(item_id = %id, error = %e, "Failed to roll up parent state");
                    break;
                }
            }
        }
    }

    /// Sets a composite's state from its children. `None` when unchanged.
    async fn rollup_one(&self, id: &str) -> Result<Option<Item>, AppError> {
        for _ in 0..MAX_ROLLUP_ATTEMPTS {
            let Some(parent) = self.store.get(id).await? else {
                return Ok(None);
            };
            let children = collect_items(&self.store, ItemFilter::children_of(id)).await?;
            let state = rollup(&children);
            if state == parent.state {
                return Ok(None);
            }

            let mut next = parent.clone();
            next.state = state;
            next.touch();
            match self.store.cas_update(&next, parent.state).await {
                Ok(stored) => {
                    self.reporter.report(PipelineEvent::RolledUp {
                        item_id: id,
                        from: parent.state,
                        to: stored.state,
                    });
                    return Ok(Some(stored));
                }
                Err(e) if e.kind() == ErrorKind::Conflict => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(item_id = %id, "Rollup kept conflicting, leaving it to the next change");
        Ok(None)
    }

    /// Applies `change` to a composite, re-reading it whenever a concurrent
    /// rollup wins the write. Rollups only touch the state, so reapplying
    /// on the fresh record loses nothing.
    async fn update_composite(
        &self,
        id: &str,
        change: impl Fn(&mut Item) + Send,
    ) -> Result<Option<Item>, AppError> {
        let mut last = None;
        for _ in 0..MAX_ROLLUP_ATTEMPTS {
            let Some(current) = self.store.get(id).await? else {
                return Ok(None);
            };
            let mut next = current.clone();
            change(&mut next);
            match self.store.cas_update(&next, current.state).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(e) if e.kind() == ErrorKind::Conflict => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| AppError::ItemNotFound(id.to_string())))
    }

    async fn retry_leaf(&self, id: &str) -> Result<Item, AppError> {
        let mut last = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;
            let mut next = item.clone();
            next.prepare_retry()?;
            match self.commit(&next, item.state).await {
                Ok(stored) => {
                    tracing::info!(item_id = %id, state = %stored.state, "Item retried");
                    self.wake(id);
                    return Ok(stored);
                }
                Err(e) if e.kind() == ErrorKind::Conflict => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| AppError::ItemNotFound(id.to_string())))
    }

    async fn sweep(&self) -> Result<usize, AppError> {
        let filter = ItemFilter::all().with_states(
            ItemState::ALL
                .into_iter()
                .filter(|s| !matches!(s, ItemState::Library | ItemState::Error | ItemState::Unknown)),
        );
        let mut items = std::pin::pin!(list_items(self.store.clone(), filter, DEFAULT_PAGE_SIZE));
        let mut count = 0;
        while let Some(item) = items.next().await {
            self.wake(&item?.id);
            count += 1;
        }
        self.reporter.report(PipelineEvent::Swept { items: count });
        Ok(count)
    }

    // -- failures -------------------------------------------------------------

    /// Classifies a stage failure and records it. The only path into ERROR.
    async fn handle_failure(&self, stage: Stage, seen: &Item, error: AppError) -> Result<(), AppError> {
        if error.kind() == ErrorKind::Conflict {
            self.reporter
                .report(PipelineEvent::Conflict { item_id: &seen.id });
            return Ok(());
        }
        let Some(item) = self.store.get(&seen.id).await? else {
            return Ok(());
        };
        let message = error.to_string();

        if item.is_composite() {
            return self.fail_composite(stage, item, &error, &message).await;
        }
        if item.revision != seen.revision {
            // Someone else moved the item while this stage ran.
            self.reporter
                .report(PipelineEvent::Conflict { item_id: &item.id });
            return Ok(());
        }

        let mut next = item.clone();
        if stage == Stage::Download && matches!(error, AppError::ReleaseUnavailable(_)) {
            if let Some(remediated) = self.downloads.remediate(&item, &error) {
                let release_id = remediated
                    .excluded_releases
                    .last()
                    .cloned()
                    .unwrap_or_default();
                self.reporter.report(PipelineEvent::Remediated {
                    item_id: &item.id,
                    release_id: &release_id,
                });
                return self.commit_failure(&remediated, item.state).await;
            }
            next.fail(ItemError::new(
                ErrorKind::Exhausted,
                stage,
                format!("release retry budget spent: {message}"),
            ));
            self.reporter.report(PipelineEvent::Failed {
                item_id: &item.id,
                stage,
                error: &message,
            });
            return self.commit_failure(&next, item.state).await;
        }

        let retry = self.config.retry(stage);
        let attempts = item.attempts + 1;
        next.attempts = attempts;
        if error.is_retryable() && retry.can_retry(attempts) {
            let delay = retry.delay_for_attempt(attempts);
            next.last_error = Some(ItemError::from_app_error(stage, &error));
            next.next_attempt_at = Some(Utc::now() + delay);
            next.touch();
            self.reporter.report(PipelineEvent::RetryScheduled {
                item_id: &item.id,
                stage,
                attempt: attempts,
                delay,
                error: &message,
            });
        } else {
            let classified = if error.is_retryable() {
                exhausted(stage, &error, attempts)
            } else {
                ItemError::from_app_error(stage, &error)
            };
            next.fail(classified);
            self.reporter.report(PipelineEvent::Failed {
                item_id: &item.id,
                stage,
                error: &message,
            });
        }
        self.commit_failure(&next, item.state).await
    }

    /// Season pack searches never park the season in ERROR; once they give up,
    /// the episodes are scraped one by one.
    async fn fail_composite(
        &self,
        stage: Stage,
        item: Item,
        error: &AppError,
        message: &str,
    ) -> Result<(), AppError> {
        let attempts = item.attempts + 1;
        let retry = self.config.retry(stage);
        let delay = (error.is_retryable() && retry.can_retry(attempts))
            .then(|| retry.delay_for_attempt(attempts));
        match delay {
            Some(delay) => self.reporter.report(PipelineEvent::RetryScheduled {
                item_id: &item.id,
                stage,
                attempt: attempts,
                delay,
                error: message,
            }),
            None => {
                tracing::warn!(season_id = %item.id, error = %message, "Giving up on season pack");
            }
        }

        let recorded = ItemError::from_app_error(stage, error);
        let pack_attempts = self.config.pack_attempts;
        self.update_composite(&item.id, move |season| {
            season.attempts = attempts;
            season.last_error = Some(recorded.clone());
            match delay {
                Some(delay) => season.next_attempt_at = Some(Utc::now() + delay),
                None => {
                    season.scrape_attempts = season.scrape_attempts.max(pack_attempts);
                    season.next_attempt_at = None;
                }
            }
            season.touch();
        })
        .await?;
        self.wake_children(&item.id).await
    }

    async fn commit_failure(&self, next: &Item, expected: ItemState) -> Result<(), AppError> {
        match self.commit(next, expected).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {
                self.reporter
                    .report(PipelineEvent::Conflict { item_id: &next.id });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
