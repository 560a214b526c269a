use std::time::Duration;

/// Retry policy for one stage: exponential backoff with a capped delay and
/// a capped number of attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far (1-indexed).
    ///
    /// base, 2×base, 4×base, ... capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn can_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

/// Pacing for automatic rescrapes of items nothing was found for.
///
/// The more often an item has come up empty, the longer it waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescrapePolicy {
    /// Wait while scraped at most twice.
    pub after_2: Duration,
    /// Wait while scraped at most five times.
    pub after_5: Duration,
    /// Wait beyond that.
    pub after_10: Duration,
}

impl Default for RescrapePolicy {
    fn default() -> Self {
        Self {
            after_2: Duration::from_secs(2 * 3600),
            after_5: Duration::from_secs(6 * 3600),
            after_10: Duration::from_secs(24 * 3600),
        }
    }
}

impl RescrapePolicy {
    pub fn delay_for(&self, scrape_attempts: u32) -> Duration {
        match scrape_attempts {
            0..=2 => self.after_2,
            3..=5 => self.after_5,
            _ => self.after_10,
        }
    }
}
