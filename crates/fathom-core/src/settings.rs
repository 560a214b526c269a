//! Application settings and their lifecycle.
//!
//! Settings live in a JSON document. The manager keeps two copies: a working
//! copy edited through `set`, and the active snapshot the running adapters
//! were built from. `save` persists the working copy, `reload` reads the file
//! back and makes it active.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{AdapterFactory, ProbeStatus};
use crate::error::AppError;
use crate::release::ParserSettings;
use crate::retry::{RescrapePolicy, RetryConfig};

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub scrapers: ScraperSettings,
    pub debrid: DebridSettings,
    pub media_server: MediaServerSettings,
    pub content: ContentSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub debug: bool,
    pub concurrency: ConcurrencySettings,
    pub retry: StageRetrySettings,
    pub adapter_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    /// How long a probe result is trusted by the health gate.
    pub probe_ttl_secs: u64,
    pub poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Completed downloads not indexed within this window are failed.
    pub reconcile_timeout_secs: u64,
    pub library_recheck_secs: u64,
    pub sweep_interval_secs: u64,
    /// Automatic re-selections after a release turns out to be unavailable.
    pub release_retry_budget: u32,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            debug: false,
            concurrency: ConcurrencySettings::default(),
            retry: StageRetrySettings::default(),
            adapter_timeout_secs: 30,
            probe_timeout_secs: 10,
            probe_ttl_secs: 300,
            poll_interval_secs: 30,
            reconcile_interval_secs: 60,
            reconcile_timeout_secs: 6 * 3600,
            library_recheck_secs: 6 * 3600,
            sweep_interval_secs: 600,
            release_retry_budget: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySettings {
    pub scrape: usize,
    pub download: usize,
    pub reconcile: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            scrape: 4,
            download: 2,
            reconcile: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetrySettings {
    pub scrape: RetrySettings,
    pub download: RetrySettings,
    pub reconcile: RetrySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 3600,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new(
            settings.max_attempts,
            Duration::from_secs(settings.base_delay_secs),
            Duration::from_secs(settings.max_delay_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScraperSettings {
    /// Hours to wait before rescraping, by how often the item came up empty.
    pub after_2: f64,
    pub after_5: f64,
    pub after_10: f64,
    /// Season-pack searches before falling back to single episodes.
    pub pack_attempts: u32,
    pub parser: ParserSettings,
    pub torrentio: TorrentioSettings,
    pub jackett: JackettSettings,
    pub orionoid: OrionoidSettings,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            after_2: 2.0,
            after_5: 6.0,
            after_10: 24.0,
            pack_attempts: 2,
            parser: ParserSettings::default(),
            torrentio: TorrentioSettings::default(),
            jackett: JackettSettings::default(),
            orionoid: OrionoidSettings::default(),
        }
    }
}

impl ScraperSettings {
    pub fn rescrape_policy(&self) -> RescrapePolicy {
        let hours = |h: f64| Duration::from_secs_f64((h.max(0.0)) * 3600.0);
        RescrapePolicy {
            after_2: hours(self.after_2),
            after_5: hours(self.after_5),
            after_10: hours(self.after_10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentioSettings {
    pub enabled: bool,
    pub url: String,
    pub filter: String,
    pub trust: u32,
}

impl Default for TorrentioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://torrentio.strem.fun".to_string(),
            filter: "sort=qualitysize%7Cqualityfilter=480p,scr,cam".to_string(),
            trust: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JackettSettings {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    pub trust: u32,
}

impl Default for JackettSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://localhost:9117".to_string(),
            api_key: String::new(),
            trust: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrionoidSettings {
    pub enabled: bool,
    pub url: String,
    /// Application key issued to this program by Orionoid.
    pub app_key: String,
    /// The user's own key.
    pub api_key: String,
    pub limit: u32,
    pub trust: u32,
    pub min_interval_secs: u64,
}

impl Default for OrionoidSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://api.orionoid.com".to_string(),
            app_key: String::new(),
            api_key: String::new(),
            limit: 50,
            trust: 1,
            min_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebridSettings {
    pub real_debrid: RealDebridSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealDebridSettings {
    pub url: String,
    pub api_key: String,
}

impl Default for RealDebridSettings {
    fn default() -> Self {
        Self {
            url: "https://api.real-debrid.com/rest/1.0".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaServerSettings {
    pub plex: PlexSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexSettings {
    pub url: String,
    pub token: String,
}

impl Default for PlexSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:32400".to_string(),
            token: String::new(),
        }
    }
}

/// Intake sources. Consumed by external requesters; stored here so the
/// settings document stays the single place users configure them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSettings {
    pub overseerr: ContentSource,
    pub plex_watchlist: ContentSource,
    pub listrr: ContentSource,
    pub mdblist: ContentSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSource {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    pub update_interval_secs: u64,
}

impl Default for ContentSource {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            api_key: String::new(),
            update_interval_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Services that can be probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceName {
    Torrentio,
    Jackett,
    Orionoid,
    RealDebrid,
    Plex,
}

impl ServiceName {
    pub const ALL: [ServiceName; 5] = [
        ServiceName::Torrentio,
        ServiceName::Jackett,
        ServiceName::Orionoid,
        ServiceName::RealDebrid,
        ServiceName::Plex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Torrentio => "torrentio",
            ServiceName::Jackett => "jackett",
            ServiceName::Orionoid => "orionoid",
            ServiceName::RealDebrid => "real_debrid",
            ServiceName::Plex => "plex",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ServiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        ServiceName::ALL
            .into_iter()
            .find(|name| name.as_str() == wanted || name.as_str().replace('_', "") == wanted)
            .ok_or_else(|| format!("Unknown service: {s}"))
    }
}

/// Addressable part of the settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsKey {
    General,
    Scrapers,
    Debrid,
    MediaServer,
    Content,
    Parser,
    Service(ServiceName),
}

impl SettingsKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsKey::General => "general",
            SettingsKey::Scrapers => "scrapers",
            SettingsKey::Debrid => "debrid",
            SettingsKey::MediaServer => "media_server",
            SettingsKey::Content => "content",
            SettingsKey::Parser => "parser",
            SettingsKey::Service(name) => name.as_str(),
        }
    }

    pub fn service(&self) -> Option<ServiceName> {
        match self {
            SettingsKey::Service(name) => Some(*name),
            _ => None,
        }
    }
}

impl fmt::Display for SettingsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SettingsKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "general" => Ok(SettingsKey::General),
            "scrapers" | "scraping" => Ok(SettingsKey::Scrapers),
            "debrid" => Ok(SettingsKey::Debrid),
            "media_server" => Ok(SettingsKey::MediaServer),
            "content" => Ok(SettingsKey::Content),
            "parser" => Ok(SettingsKey::Parser),
            other => other
                .parse::<ServiceName>()
                .map(SettingsKey::Service)
                .map_err(|_| format!("Unknown settings key: {s}")),
        }
    }
}

impl Settings {
    /// JSON value of one section.
    pub fn section(&self, key: SettingsKey) -> Result<Value, AppError> {
        let value = match key {
            SettingsKey::General => serde_json::to_value(&self.general)?,
            SettingsKey::Scrapers => serde_json::to_value(&self.scrapers)?,
            SettingsKey::Debrid => serde_json::to_value(&self.debrid)?,
            SettingsKey::MediaServer => serde_json::to_value(&self.media_server)?,
            SettingsKey::Content => serde_json::to_value(&self.content)?,
            SettingsKey::Parser => serde_json::to_value(&self.scrapers.parser)?,
            SettingsKey::Service(ServiceName::Torrentio) => {
                serde_json::to_value(&self.scrapers.torrentio)?
            }
            SettingsKey::Service(ServiceName::Jackett) => {
                serde_json::to_value(&self.scrapers.jackett)?
            }
            SettingsKey::Service(ServiceName::Orionoid) => {
                serde_json::to_value(&self.scrapers.orionoid)?
            }
            SettingsKey::Service(ServiceName::RealDebrid) => {
                serde_json::to_value(&self.debrid.real_debrid)?
            }
            SettingsKey::Service(ServiceName::Plex) => {
                serde_json::to_value(&self.media_server.plex)?
            }
        };
        Ok(value)
    }

    /// Merges a partial JSON patch into one section.
    ///
    /// Fields absent from the patch keep their current values.
    pub fn apply(&mut self, key: SettingsKey, patch: Value) -> Result<(), AppError> {
        let mut merged = self.section(key)?;
        merge_json(&mut merged, patch);
        match key {
            SettingsKey::General => self.general = serde_json::from_value(merged)?,
            SettingsKey::Scrapers => self.scrapers = serde_json::from_value(merged)?,
            SettingsKey::Debrid => self.debrid = serde_json::from_value(merged)?,
            SettingsKey::MediaServer => self.media_server = serde_json::from_value(merged)?,
            SettingsKey::Content => self.content = serde_json::from_value(merged)?,
            SettingsKey::Parser => self.scrapers.parser = serde_json::from_value(merged)?,
            SettingsKey::Service(ServiceName::Torrentio) => {
                self.scrapers.torrentio = serde_json::from_value(merged)?
            }
            SettingsKey::Service(ServiceName::Jackett) => {
                self.scrapers.jackett = serde_json::from_value(merged)?
            }
            SettingsKey::Service(ServiceName::Orionoid) => {
                self.scrapers.orionoid = serde_json::from_value(merged)?
            }
            SettingsKey::Service(ServiceName::RealDebrid) => {
                self.debrid.real_debrid = serde_json::from_value(merged)?
            }
            SettingsKey::Service(ServiceName::Plex) => {
                self.media_server.plex = serde_json::from_value(merged)?
            }
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.general.adapter_timeout_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.general.probe_timeout_secs.max(1))
    }
}

/// Recursively merges `patch` into `base`. Non-object values replace.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Per-key outcome of a `set` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl ServiceValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsValidation {
    pub all_services_true: bool,
    pub services: BTreeMap<String, ServiceValidation>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns the settings file and the working/active copies.
pub struct SettingsManager {
    path: PathBuf,
    working: Mutex<Settings>,
    active: RwLock<Arc<Settings>>,
    /// Held across a whole `set`, `save`, or `reload` so their awaits never interleave.
    updates: tokio::sync::Mutex<()>,
}

impl SettingsManager {
    /// Loads settings from `path`, writing defaults first if the file is missing.
    pub fn load_or_init(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Settings file missing, writing defaults");
            write_settings(&path, &Settings::default())?;
        }
        let settings = read_settings(&path)?;
        Ok(Self::with_settings(path, settings))
    }

    /// Manager over in-memory settings; `save` still writes to `path`.
    pub fn with_settings(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            working: Mutex::new(settings.clone()),
            active: RwLock::new(Arc::new(settings)),
            updates: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot the running components were built from.
    pub fn active(&self) -> Arc<Settings> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current working copy, including set-but-unsaved changes.
    pub fn working(&self) -> Settings {
        self.lock_working().clone()
    }

    fn lock_working(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.working.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned settings mutex");
            poisoned.into_inner()
        })
    }

    /// Values of the requested sections from the working copy.
    pub fn get(&self, keys: &[SettingsKey]) -> Result<serde_json::Map<String, Value>, AppError> {
        let working = self.working();
        keys.iter()
            .map(|key| Ok((key.to_string(), working.section(*key)?)))
            .collect()
    }

    /// Applies `updates` to the working copy, probing every touched service.
    ///
    /// Values that deserialize are kept even when their probe fails, so a
    /// user can save a configuration for a service that is down right now.
    pub async fn set(
        &self,
        updates: serde_json::Map<String, Value>,
        factory: &dyn AdapterFactory,
    ) -> SettingsValidation {
        let _update = self.updates.lock().await;
        let mut candidate = self.working();
        let mut services = BTreeMap::new();
        let mut to_probe = Vec::new();

        for (name, patch) in updates {
            let key = match name.parse::<SettingsKey>() {
                Ok(key) => key,
                Err(e) => {
                    services.insert(name, ServiceValidation::failed(e));
                    continue;
                }
            };
            if let Err(e) = candidate.apply(key, patch) {
                services.insert(name, ServiceValidation::failed(e.to_string()));
                continue;
            }
            match key.service() {
                Some(service) => to_probe.push((name, service)),
                None => {
                    services.insert(name, ServiceValidation::ok());
                }
            }
        }

        let timeout = candidate.probe_timeout();
        let probes = to_probe.into_iter().map(|(name, service)| {
            let built = factory.build(service, &candidate);
            async move {
                let validation = match built {
                    Ok(Some(adapter)) => match adapter.probe_within(timeout).await {
                        ProbeStatus::Ok => ServiceValidation::ok(),
                        failed => ServiceValidation::failed(failed.to_string()),
                    },
                    // Disabled services have nothing to reach.
                    Ok(None) => ServiceValidation::ok(),
                    Err(e) => ServiceValidation::failed(e.to_string()),
                };
                (name, validation)
            }
        });
        services.extend(join_all(probes).await);

        *self.lock_working() = candidate;

        let all_services_true = services.values().all(|v| v.valid);
        SettingsValidation {
            all_services_true,
            services,
        }
    }

    /// Persists the working copy.
    pub async fn save(&self) -> Result<(), AppError> {
        let _update = self.updates.lock().await;
        let working = self.working();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_settings(&path, &working))
            .await
            .map_err(|e| AppError::Generic(format!("settings writer stopped: {e}")))??;
        tracing::info!(path = %self.path.display(), "Settings saved");
        Ok(())
    }

    /// Reads the file back and makes it the active snapshot.
    pub async fn reload(&self) -> Result<Arc<Settings>, AppError> {
        let _update = self.updates.lock().await;
        let path = self.path.clone();
        let settings = tokio::task::spawn_blocking(move || read_settings(&path))
            .await
            .map_err(|e| AppError::Generic(format!("settings reader stopped: {e}")))??;
        *self.lock_working() = settings.clone();
        let settings = Arc::new(settings);
        *self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings.clone();
        tracing::info!(path = %self.path.display(), "Settings loaded");
        Ok(settings)
    }
}

fn read_settings(path: &Path) -> Result<Settings, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!("cannot read settings {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Writes through a temporary sibling so a crash never leaves a torn file.
fn write_settings(path: &Path, settings: &Settings) -> Result<(), AppError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::ConfigError(format!("cannot create {}: {e}", dir.display()))
        })?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)
        .and_then(|()| std::fs::rename(&tmp, path))
        .map_err(|e| AppError::ConfigError(format!("cannot write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adapter::AdapterKind;
    use crate::testutil::{MockAdapterFactory, MockScraper};

    #[test]
    fn test_keys_parse() {
        assert_eq!(
            "media-server".parse::<SettingsKey>().unwrap(),
            SettingsKey::MediaServer
        );
        assert_eq!(
            "realdebrid".parse::<SettingsKey>().unwrap(),
            SettingsKey::Service(ServiceName::RealDebrid)
        );
        assert!("nonsense".parse::<SettingsKey>().is_err());
    }

    #[test]
    fn test_apply_merges_partial_patch() {
        let mut settings = Settings::default();
        settings
            .apply(
                SettingsKey::Service(ServiceName::Jackett),
                json!({"enabled": true, "api_key": "secret"}),
            )
            .unwrap();
        assert!(settings.scrapers.jackett.enabled);
        assert_eq!(settings.scrapers.jackett.api_key, "secret");
        assert_eq!(settings.scrapers.jackett.url, "http://localhost:9117");
    }

    #[test]
    fn test_apply_rejects_wrong_types() {
        let mut settings = Settings::default();
        let result = settings.apply(
            SettingsKey::General,
            json!({"poll_interval_secs": "soon"}),
        );
        assert!(result.is_err());
        assert_eq!(settings.general.poll_interval_secs, 30);
    }

    #[test]
    fn test_rescrape_policy_from_hours() {
        let policy = ScraperSettings::default().rescrape_policy();
        assert_eq!(policy.after_2, Duration::from_secs(7200));
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let manager = SettingsManager::load_or_init(&path).unwrap();

        assert!(path.exists());
        assert_eq!(*manager.active(), Settings::default());
    }

    #[tokio::test]
    async fn test_set_save_reload_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let manager = SettingsManager::load_or_init(&path).unwrap();
        let factory = MockAdapterFactory::default();

        let mut updates = serde_json::Map::new();
        updates.insert("general".into(), json!({"poll_interval_secs": 5}));
        let validation = manager.set(updates, &factory).await;
        assert!(validation.all_services_true);

        // Set but unsaved: working copy changed, active snapshot did not.
        assert_eq!(manager.working().general.poll_interval_secs, 5);
        assert_eq!(manager.active().general.poll_interval_secs, 30);

        manager.save().await.unwrap();
        let reloaded = manager.reload().await.unwrap();
        assert_eq!(reloaded.general.poll_interval_secs, 5);
        assert_eq!(manager.active().general.poll_interval_secs, 5);
    }

    #[tokio::test]
    async fn test_set_reports_each_failing_service() {
        let manager = SettingsManager::with_settings("unused.json", Settings::default());
        let factory = MockAdapterFactory::default()
            .with_adapter(
                ServiceName::Torrentio,
                AdapterKind::Scraper(std::sync::Arc::new(MockScraper::new("torrentio", vec![]))),
            )
            .with_adapter(
                ServiceName::Plex,
                AdapterKind::Scraper(std::sync::Arc::new(
                    MockScraper::new("plex", vec![])
                        .with_probe(ProbeStatus::Unauthorized("bad token".into())),
                )),
            );

        let mut updates = serde_json::Map::new();
        updates.insert("torrentio".into(), json!({"enabled": true}));
        updates.insert("plex".into(), json!({"token": "wrong"}));
        updates.insert("bogus".into(), json!({}));

        let validation = manager.set(updates, &factory).await;

        assert!(!validation.all_services_true);
        assert!(validation.services["torrentio"].valid);
        assert!(!validation.services["plex"].valid);
        assert!(
            validation.services["plex"]
                .error
                .as_deref()
                .unwrap()
                .contains("bad token")
        );
        assert!(!validation.services["bogus"].valid);
        assert_eq!(manager.working().media_server.plex.token, "wrong");
    }

    #[tokio::test]
    async fn test_overlapping_sets_keep_both_sections() {
        let manager = SettingsManager::with_settings("unused.json", Settings::default());
        let factory = MockAdapterFactory::default().with_adapter(
            ServiceName::Torrentio,
            AdapterKind::Scraper(std::sync::Arc::new(
                MockScraper::new("torrentio", vec![]).with_delay(Duration::from_millis(100)),
            )),
        );

        let mut scrapers = serde_json::Map::new();
        scrapers.insert("torrentio".into(), json!({"filter": "qualityfilter=480p"}));
        let mut debrid = serde_json::Map::new();
        debrid.insert("real_debrid".into(), json!({"api_key": "rd-key"}));

        let (slow, fast) = tokio::join!(
            manager.set(scrapers, &factory),
            manager.set(debrid, &factory),
        );

        assert!(slow.all_services_true);
        assert!(fast.all_services_true);
        let working = manager.working();
        assert_eq!(working.scrapers.torrentio.filter, "qualityfilter=480p");
        assert_eq!(working.debrid.real_debrid.api_key, "rd-key");
    }

    #[test]
    fn test_get_returns_requested_sections() {
        let manager = SettingsManager::with_settings("unused.json", Settings::default());
        let values = manager
            .get(&[SettingsKey::General, SettingsKey::Content])
            .unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["general"]["sweep_interval_secs"], 600);
        assert!(values.contains_key("content"));
    }
}
