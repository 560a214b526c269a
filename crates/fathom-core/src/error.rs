use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::ItemState;

/// Coarse failure classification shared by every pipeline stage.
///
/// Stages decide between retry and escalation from the kind alone, so
/// provider-specific error shapes never need to travel past an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, rate limits, temporary unavailability. Retried with backoff.
    Transient,
    /// A valid terminal outcome, e.g. nothing found.
    NotFound,
    /// The service refused the request.
    Rejected,
    /// Compare-and-set lost against a concurrent writer. Recomputed, never surfaced.
    Conflict,
    /// Retry budget spent. Needs a manual retry.
    Exhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application-wide error types for Fathom.
#[derive(Error, Debug)]
pub enum AppError {
    /// Service answered with an unexpected HTTP status.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Call exceeded its deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Service reported itself temporarily unavailable (5xx, maintenance).
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Credentials missing or refused.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Service refused the request (quota, expired link, bad input).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Debrid service cannot provide the chosen release.
    #[error("Release unavailable: {0}")]
    ReleaseUnavailable(String),

    /// Every scraper was unreachable, as opposed to reachable but empty.
    #[error("No scraper reachable (unreachable: {})", .0.join(", "))]
    NoScraperReachable(Vec<String>),

    /// No adapter configured for a service class the stage needs.
    #[error("No {0} service configured")]
    NotConfigured(&'static str),

    /// Download finished but the media server never showed it.
    #[error("Download completed but never indexed after {}s", .0.as_secs())]
    NeverIndexed(Duration),

    /// Compare-and-set lost against a concurrent writer.
    #[error("Conflict on item {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: ItemState,
        actual: ItemState,
    },

    /// In-flight work was cancelled because the item was removed.
    #[error("Cancelled")]
    Cancelled,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Transition not present in the state machine.
    #[error("Illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: ItemState,
        to: ItemState,
    },

    /// Caller supplied an invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error (missing env var, unreadable settings file).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Maps the error onto the pipeline's failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::NetworkError(_)
            | AppError::ServiceUnavailable(_)
            | AppError::NoScraperReachable(_)
            | AppError::NotConfigured(_)
            | AppError::DatabaseError(_) => ErrorKind::Transient,
            AppError::ItemNotFound(_) => ErrorKind::NotFound,
            AppError::Conflict { .. } | AppError::Cancelled => ErrorKind::Conflict,
            AppError::NeverIndexed(_) => ErrorKind::Exhausted,
            AppError::HttpError(_)
            | AppError::Unauthorized(_)
            | AppError::Rejected(_)
            | AppError::ReleaseUnavailable(_)
            | AppError::IllegalTransition { .. }
            | AppError::InvalidRequest(_)
            | AppError::SerializationError(_)
            | AppError::ConfigError(_)
            | AppError::Generic(_) => ErrorKind::Rejected,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Returns true if this error should trip the circuit breaker.
    ///
    /// Only transport-level failures count; a service that answers with a
    /// refusal is reachable and keeps its circuit closed.
    pub fn should_trip_circuit(&self) -> bool {
        matches!(
            self,
            AppError::NetworkError(_)
                | AppError::Timeout(_)
                | AppError::RateLimitExceeded
                | AppError::ServiceUnavailable(_)
        )
    }
}
