//! Per-service circuit breaker.
//!
//! A scraper or debrid service that keeps timing out is skipped for a while
//! instead of being called (and waited on) for every item.
//!
//! ```text
//! CLOSED --[N transport failures]--> OPEN --[cool-down]--> HALF_OPEN
//!   ^                                  ^                       |
//!   |                                  +------[failure]--------+
//!   +-------------------------[M successes]--------------------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transport failures before the circuit opens.
    pub failure_threshold: u32,
    /// Successful calls in half-open state needed to close again.
    pub success_threshold: u32,
    /// Cool-down before an open circuit lets a trial call through.
    pub cooldown: Duration,
    /// Cool-down growth factor when the service is rate limiting us.
    pub rate_limit_multiplier: u32,
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 1,
            cooldown: Duration::from_secs(60),
            rate_limit_multiplier: 2,
            max_cooldown: Duration::from_secs(600),
        }
    }
}

#[derive(Debug)]
struct Tracker {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    last_error: Option<String>,
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failures: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit for {service} is open, retry after {}s", .retry_after.as_secs())]
    Open {
        service: String,
        retry_after: Duration,
    },
    #[error(transparent)]
    Inner(AppError),
}

impl CircuitBreakerError {
    /// Collapses into an [`AppError`]; an open circuit reads as unavailability.
    pub fn into_app_error(self) -> AppError {
        match self {
            open @ CircuitBreakerError::Open { .. } => {
                AppError::ServiceUnavailable(open.to_string())
            }
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe breaker guarding calls to one service.
#[derive(Clone)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    tracker: Arc<Mutex<Tracker>>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let tracker = Tracker {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            opened_at: None,
            cooldown: config.cooldown,
            last_error: None,
        };
        Self {
            service: service.into(),
            config,
            tracker: Arc::new(Mutex::new(tracker)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn lock(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(service = %self.service, "Recovered from poisoned breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Current state; an open circuit whose cool-down elapsed reads as half-open.
    pub fn state(&self) -> CircuitState {
        let mut tracker = self.lock();
        self.refresh(&mut tracker);
        tracker.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let mut tracker = self.lock();
        self.refresh(&mut tracker);
        CircuitSnapshot {
            service: self.service.clone(),
            state: tracker.state,
            failures: tracker.failures,
            last_error: tracker.last_error.clone(),
            retry_after: Self::remaining(&tracker),
        }
    }

    fn remaining(tracker: &Tracker) -> Option<Duration> {
        if tracker.state != CircuitState::Open {
            return None;
        }
        tracker
            .opened_at
            .map(|at| tracker.cooldown.saturating_sub(at.elapsed()))
    }

    /// Runs `operation` unless the circuit is open.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut tracker = self.lock();
            self.refresh(&mut tracker);
            if tracker.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    service: self.service.clone(),
                    retry_after: Self::remaining(&tracker).unwrap_or(tracker.cooldown),
                });
            }
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            // The service answered; a refusal says nothing about its health.
            Err(_) => self.record_success(),
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut tracker = self.lock();
        match tracker.state {
            CircuitState::HalfOpen => {
                tracker.successes += 1;
                if tracker.successes >= self.config.success_threshold {
                    tracing::info!(service = %self.service, "Circuit closed");
                    tracker.state = CircuitState::Closed;
                    tracker.failures = 0;
                    tracker.successes = 0;
                    tracker.opened_at = None;
                    tracker.last_error = None;
                    tracker.cooldown = self.config.cooldown;
                }
            }
            CircuitState::Closed => tracker.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut tracker = self.lock();
        self.refresh(&mut tracker);
        tracker.last_error = Some(error.to_string());

        let trip = match tracker.state {
            CircuitState::Closed => {
                tracker.failures += 1;
                tracker.failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !trip {
            return;
        }

        if matches!(error, AppError::RateLimitExceeded) {
            tracker.cooldown = tracker
                .cooldown
                .saturating_mul(self.config.rate_limit_multiplier.max(1))
                .min(self.config.max_cooldown);
        }
        tracing::warn!(
            service = %self.service,
            failures = tracker.failures,
            cooldown_secs = tracker.cooldown.as_secs(),
            %error,
            "Circuit opened"
        );
        tracker.state = CircuitState::Open;
        tracker.opened_at = Some(Instant::now());
        tracker.successes = 0;
    }

    pub fn reset(&self) {
        let mut tracker = self.lock();
        tracker.state = CircuitState::Closed;
        tracker.failures = 0;
        tracker.successes = 0;
        tracker.opened_at = None;
        tracker.last_error = None;
        tracker.cooldown = self.config.cooldown;
    }

    fn refresh(&self, tracker: &mut Tracker) {
        if tracker.state == CircuitState::Open
            && let Some(opened_at) = tracker.opened_at
            && opened_at.elapsed() >= tracker.cooldown
        {
            tracing::debug!(service = %self.service, "Circuit half-open");
            tracker.state = CircuitState::HalfOpen;
            tracker.successes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "torrentio",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown,
                ..Default::default()
            },
        )
    }

    fn timeout() -> AppError {
        AppError::Timeout(Duration::from_secs(30))
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure(&timeout());
        cb.record_failure(&timeout());
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(&timeout());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_streak() {
        let cb = breaker(2, Duration::from_secs(60));
        cb.record_failure(&timeout());
        cb.record_success();
        cb.record_failure(&timeout());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_then_closes() {
        let cb = breaker(1, Duration::from_millis(5));
        cb.record_failure(&timeout());
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(5));
        cb.record_failure(&timeout());
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(&timeout());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_rate_limit_extends_cooldown() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure(&AppError::RateLimitExceeded);
        let snapshot = cb.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.retry_after.unwrap() > Duration::from_secs(100));
    }

    #[test]
    fn test_reset_closes() {
        let cb = breaker(1, Duration::from_secs(600));
        cb.record_failure(&timeout());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_open_circuit_skips_call() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure(&timeout());

        let result = cb.call(|| async { Ok::<_, AppError>(42) }).await;

        let err = result.unwrap_err();
        assert!(matches!(err, CircuitBreakerError::Open { .. }));
        assert!(matches!(
            err.into_app_error(),
            AppError::ServiceUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_refusals_do_not_trip() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb
            .call(|| async { Err::<(), _>(AppError::Unauthorized("bad key".into())) })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb
            .call(|| async { Err::<(), _>(AppError::NetworkError("refused".into())) })
            .await;
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
