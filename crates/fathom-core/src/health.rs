//! Health gate consulted before dispatching work to a service.
//!
//! A service is healthy when its last probe succeeded and its circuit is not
//! open. Probe results are cached so the hot path never waits on a probe
//! more than once per TTL, and the API can report health without probing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::adapter::{AdapterKind, ProbeStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

/// Failed probes are retried sooner than successful ones are refreshed.
struct ProbeExpiry {
    ok_ttl: Duration,
    failed_ttl: Duration,
}

impl Expiry<String, ProbeStatus> for ProbeExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &ProbeStatus,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(if value.is_ok() {
            self.ok_ttl
        } else {
            self.failed_ttl
        })
    }
}

#[derive(Clone)]
pub struct HealthGate {
    probes: Cache<String, ProbeStatus>,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    breaker_config: CircuitBreakerConfig,
    probe_timeout: Duration,
}

impl HealthGate {
    pub fn new(probe_ttl: Duration, probe_timeout: Duration) -> Self {
        Self::with_breaker_config(probe_ttl, probe_timeout, CircuitBreakerConfig::default())
    }

    pub fn with_breaker_config(
        probe_ttl: Duration,
        probe_timeout: Duration,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let expiry = ProbeExpiry {
            ok_ttl: probe_ttl,
            failed_ttl: (probe_ttl / 10).max(Duration::from_secs(1)).min(probe_ttl),
        };
        Self {
            probes: Cache::builder().max_capacity(64).expire_after(expiry).build(),
            breakers: Arc::new(Mutex::new(HashMap::new())),
            breaker_config,
            probe_timeout,
        }
    }

    /// Breaker for `service`, created on first use.
    pub fn breaker(&self, service: &str) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(service, self.breaker_config.clone()))
            .clone()
    }

    /// Cached probe result, probing (bounded) on a miss.
    ///
    /// Concurrent misses for the same service share one probe.
    pub async fn status(&self, adapter: &AdapterKind) -> ProbeStatus {
        let timeout = self.probe_timeout;
        let probe_target = adapter.clone();
        self.probes
            .get_with(adapter.name().to_string(), async move {
                let status = probe_target.probe_within(timeout).await;
                if !status.is_ok() {
                    tracing::warn!(service = probe_target.name(), %status, "Probe failed");
                }
                status
            })
            .await
    }

    pub async fn is_healthy(&self, adapter: &AdapterKind) -> bool {
        if self.breaker(adapter.name()).state() == CircuitState::Open {
            return false;
        }
        self.status(adapter).await.is_ok()
    }

    /// Last known probe result without probing.
    pub async fn cached(&self, service: &str) -> Option<ProbeStatus> {
        self.probes.get(service).await
    }

    pub async fn record_probe(&self, service: &str, status: ProbeStatus) {
        self.probes.insert(service.to_string(), status).await;
    }

    /// Forgets every probe and breaker, e.g. after credentials changed.
    pub fn invalidate_all(&self) {
        self.probes.invalidate_all();
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    pub fn circuits(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<CircuitBreaker> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::testutil::MockScraper;

    fn gate() -> HealthGate {
        HealthGate::new(Duration::from_secs(60), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_probe_result_is_cached() {
        let scraper = Arc::new(MockScraper::new("torrentio", vec![]));
        let adapter = AdapterKind::Scraper(scraper.clone());
        let gate = gate();

        assert!(gate.is_healthy(&adapter).await);
        assert!(gate.is_healthy(&adapter).await);

        assert_eq!(scraper.probe_count(), 1);
        assert_eq!(gate.cached("torrentio").await, Some(ProbeStatus::Ok));
    }

    #[tokio::test]
    async fn test_unreachable_probe_is_unhealthy() {
        let adapter = AdapterKind::Scraper(Arc::new(
            MockScraper::new("jackett", vec![])
                .with_probe(ProbeStatus::Unreachable("connection refused".into())),
        ));
        assert!(!gate().is_healthy(&adapter).await);
    }

    #[tokio::test]
    async fn test_open_circuit_is_unhealthy_without_probing() {
        let scraper = Arc::new(MockScraper::new("orionoid", vec![]));
        let adapter = AdapterKind::Scraper(scraper.clone());
        let gate = HealthGate::with_breaker_config(
            Duration::from_secs(60),
            Duration::from_millis(50),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        gate.breaker("orionoid")
            .record_failure(&AppError::NetworkError("reset".into()));

        assert!(!gate.is_healthy(&adapter).await);
        assert_eq!(scraper.probe_count(), 0);
        assert_eq!(gate.circuits()[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_invalidate_forgets_probes() {
        let gate = gate();
        gate.record_probe("plex", ProbeStatus::Ok).await;
        gate.invalidate_all();
        assert_eq!(gate.cached("plex").await, None);
    }
}
