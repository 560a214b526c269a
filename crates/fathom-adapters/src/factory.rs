//! Builds live HTTP adapters from settings.

use std::sync::Arc;
use std::time::Duration;

use fathom_core::adapter::{AdapterFactory, AdapterKind, AdapterSet, ScraperAdapter, ScraperEntry};
use fathom_core::error::AppError;
use fathom_core::settings::{ServiceName, Settings};

use crate::jackett::JackettScraper;
use crate::orionoid::OrionoidScraper;
use crate::plex::PlexMediaServer;
use crate::real_debrid::RealDebrid;
use crate::torrentio::TorrentioScraper;

/// Factory for the adapters shipped with Fathom.
///
/// A service that is switched off, or that has no credentials to use, is
/// reported as disabled rather than as an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpAdapterFactory;

impl HttpAdapterFactory {
    pub fn new() -> Self {
        Self
    }
}

fn require(value: &str, service: ServiceName, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::ConfigError(format!(
            "{service} is enabled but {field} is not set"
        )));
    }
    Ok(())
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(
        &self,
        service: ServiceName,
        settings: &Settings,
    ) -> Result<Option<AdapterKind>, AppError> {
        let timeout = settings.adapter_timeout();
        let scrapers = &settings.scrapers;

        let adapter = match service {
            ServiceName::Torrentio => {
                let cfg = &scrapers.torrentio;
                if !cfg.enabled {
                    return Ok(None);
                }
                AdapterKind::Scraper(Arc::new(TorrentioScraper::new(
                    &cfg.url,
                    &cfg.filter,
                    timeout,
                )?))
            }
            ServiceName::Jackett => {
                let cfg = &scrapers.jackett;
                if !cfg.enabled {
                    return Ok(None);
                }
                require(&cfg.api_key, service, "api_key")?;
                AdapterKind::Scraper(Arc::new(JackettScraper::new(
                    &cfg.url,
                    &cfg.api_key,
                    timeout,
                )?))
            }
            ServiceName::Orionoid => {
                let cfg = &scrapers.orionoid;
                if !cfg.enabled {
                    return Ok(None);
                }
                require(&cfg.app_key, service, "app_key")?;
                require(&cfg.api_key, service, "api_key")?;
                AdapterKind::Scraper(Arc::new(OrionoidScraper::new(
                    &cfg.url,
                    &cfg.app_key,
                    &cfg.api_key,
                    cfg.limit,
                    timeout,
                )?))
            }
            ServiceName::RealDebrid => {
                let cfg = &settings.debrid.real_debrid;
                if cfg.api_key.trim().is_empty() {
                    return Ok(None);
                }
                AdapterKind::Debrid(Arc::new(RealDebrid::new(&cfg.url, &cfg.api_key, timeout)?))
            }
            ServiceName::Plex => {
                let cfg = &settings.media_server.plex;
                if cfg.token.trim().is_empty() {
                    return Ok(None);
                }
                AdapterKind::MediaServer(Arc::new(PlexMediaServer::new(
                    &cfg.url, &cfg.token, timeout,
                )?))
            }
        };
        Ok(Some(adapter))
    }

    fn build_all(&self, settings: &Settings) -> Result<AdapterSet, AppError> {
        let mut set = AdapterSet::default();
        for service in ServiceName::ALL {
            let adapter = match self.build(service, settings) {
                Ok(Some(adapter)) => adapter,
                Ok(None) => {
                    tracing::debug!(%service, "Service disabled");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(%service, error = %e, "Skipping misconfigured service");
                    continue;
                }
            };
            match adapter {
                AdapterKind::Scraper(scraper) => {
                    set.scrapers.push(scraper_entry(service, scraper, settings));
                }
                AdapterKind::Debrid(debrid) => set.debrid = Some(debrid),
                AdapterKind::MediaServer(media) => set.media_server = Some(media),
            }
        }
        tracing::info!(
            scrapers = set.scrapers.len(),
            debrid = set.debrid.is_some(),
            media_server = set.media_server.is_some(),
            "Adapters built"
        );
        Ok(set)
    }
}

fn scraper_entry(
    service: ServiceName,
    adapter: Arc<dyn ScraperAdapter>,
    settings: &Settings,
) -> ScraperEntry {
    let scrapers = &settings.scrapers;
    match service {
        ServiceName::Torrentio => ScraperEntry::new(adapter, scrapers.torrentio.trust),
        ServiceName::Jackett => ScraperEntry::new(adapter, scrapers.jackett.trust),
        ServiceName::Orionoid => {
            let entry = ScraperEntry::new(adapter, scrapers.orionoid.trust);
            match scrapers.orionoid.min_interval_secs {
                0 => entry,
                secs => entry.with_min_interval(Duration::from_secs(secs)),
            }
        }
        ServiceName::RealDebrid | ServiceName::Plex => ScraperEntry::new(adapter, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Settings {
        let mut settings = Settings::default();
        settings.scrapers.jackett.enabled = true;
        settings.scrapers.jackett.api_key = "jackett-key".into();
        settings.scrapers.orionoid.enabled = true;
        settings.scrapers.orionoid.app_key = "APP".into();
        settings.scrapers.orionoid.api_key = "USER".into();
        settings.debrid.real_debrid.api_key = "rd-key".into();
        settings.media_server.plex.token = "plex-token".into();
        settings
    }

    #[test]
    fn test_defaults_build_torrentio_only() {
        let set = HttpAdapterFactory::new()
            .build_all(&Settings::default())
            .unwrap();
        let names: Vec<&str> = set.scrapers.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["torrentio"]);
        assert!(set.debrid.is_none());
        assert!(set.media_server.is_none());
    }

    #[test]
    fn test_full_configuration() {
        let settings = configured();
        let set = HttpAdapterFactory::new().build_all(&settings).unwrap();

        let names: Vec<&str> = set.scrapers.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["torrentio", "jackett", "orionoid"]);
        assert_eq!(set.scrapers[0].trust, settings.scrapers.torrentio.trust);
        assert_eq!(
            set.scrapers[2].min_interval,
            Some(Duration::from_secs(settings.scrapers.orionoid.min_interval_secs))
        );
        assert_eq!(set.debrid.as_ref().unwrap().name(), "real_debrid");
        assert_eq!(set.media_server.as_ref().unwrap().name(), "plex");
        assert_eq!(set.all().len(), 5);
    }

    #[test]
    fn test_enabled_without_key_is_config_error() {
        let mut settings = Settings::default();
        settings.scrapers.jackett.enabled = true;
        let err = HttpAdapterFactory::new()
            .build(ServiceName::Jackett, &settings)
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));

        // A broken service is skipped, the rest still build.
        let set = HttpAdapterFactory::new().build_all(&settings).unwrap();
        assert_eq!(set.scrapers.len(), 1);
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let mut settings = configured();
        settings.media_server.plex.url = "not a url".into();
        let err = HttpAdapterFactory::new()
            .build(ServiceName::Plex, &settings)
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_disabled_services_build_nothing() {
        let mut settings = configured();
        settings.scrapers.torrentio.enabled = false;
        settings.debrid.real_debrid.api_key.clear();
        let factory = HttpAdapterFactory::new();
        assert!(
            factory
                .build(ServiceName::Torrentio, &settings)
                .unwrap()
                .is_none()
        );
        assert!(
            factory
                .build(ServiceName::RealDebrid, &settings)
                .unwrap()
                .is_none()
        );
    }
}
