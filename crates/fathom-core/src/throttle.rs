//! Per-service call pacing.
//!
//! Some services allow only one call every few seconds (Orionoid) or a fixed
//! number per minute (Real-Debrid). Callers share one [`Throttle`] and name
//! the service they are about to call; concurrent callers for the same
//! service are spaced out, other services are unaffected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Clone, Default)]
pub struct Throttle {
    /// Earliest instant the next call to each service may start.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `service` may be called again, reserving the slot after it.
    ///
    /// Slots are reserved before sleeping, so N concurrent callers end up
    /// `interval` apart instead of all waking at once.
    pub async fn wait(&self, service: &str, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let start = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let start = slots
                .get(service)
                .copied()
                .filter(|slot| *slot > now)
                .unwrap_or(now);
            slots.insert(service.to_string(), start + interval);
            start
        };

        let delay = start.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            tracing::debug!(
                service,
                sleep_ms = delay.as_millis() as u64,
                "Throttling call"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spaces_calls_to_same_service() {
        let throttle = Throttle::new();
        let start = Instant::now();
        throttle.wait("orionoid", Duration::from_millis(80)).await;
        throttle.wait("orionoid", Duration::from_millis(80)).await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_services_are_independent() {
        let throttle = Throttle::new();
        let start = Instant::now();
        throttle.wait("orionoid", Duration::from_millis(200)).await;
        throttle.wait("torrentio", Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_staggered() {
        let throttle = Throttle::new();
        let start = Instant::now();
        let calls: Vec<_> = (0..3)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move {
                    throttle.wait("real_debrid", Duration::from_millis(50)).await;
                    start.elapsed()
                })
            })
            .collect();
        let mut finished: Vec<Duration> = Vec::new();
        for call in calls {
            finished.push(call.await.unwrap());
        }
        finished.sort();
        assert!(finished[2] >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_zero_interval_never_waits() {
        let throttle = Throttle::new();
        let start = Instant::now();
        for _ in 0..10 {
            throttle.wait("torrentio", Duration::ZERO).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
