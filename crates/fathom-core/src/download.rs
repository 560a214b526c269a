//! Debrid submission, progress polling, and release remediation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{DebridAdapter, DownloadPhase, bounded};
use crate::error::AppError;
use crate::health::HealthGate;
use crate::item::{DownloadHandle, Item, ItemState};
use crate::throttle::Throttle;

#[derive(Clone)]
pub struct DownloadManager {
    health: HealthGate,
    throttle: Throttle,
    timeout: Duration,
    /// Minimum spacing between debrid calls.
    min_interval: Duration,
    /// Automatic re-selections after "release unavailable".
    retry_budget: u32,
}

impl DownloadManager {
    pub fn new(
        health: HealthGate,
        throttle: Throttle,
        timeout: Duration,
        min_interval: Duration,
        retry_budget: u32,
    ) -> Self {
        Self {
            health,
            throttle,
            timeout,
            min_interval,
            retry_budget,
        }
    }

    async fn call<T, F, Fut>(
        &self,
        debrid: &Arc<dyn DebridAdapter>,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, AppError>>,
    {
        tokio::select! {
            () = cancel.cancelled() => return Err(AppError::Cancelled),
            () = self.throttle.wait(debrid.name(), self.min_interval) => {}
        }
        self.health
            .breaker(debrid.name())
            .call(|| bounded(self.timeout, cancel, op()))
            .await
            .map_err(|e| e.into_app_error())
    }

    /// Submits the chosen release. The returned item is DOWNLOADING.
    pub async fn start(
        &self,
        item: &Item,
        debrid: &Arc<dyn DebridAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Item, AppError> {
        let release = match (&item.state, &item.chosen_release) {
            (ItemState::Scraped, Some(release)) => release.clone(),
            _ => {
                return Err(AppError::InvalidRequest(format!(
                    "{} has no release to download (state {})",
                    item.id, item.state
                )));
            }
        };

        let token = self
            .call(debrid, cancel, || debrid.submit_download(&release))
            .await?;
        tracing::info!(
            item_id = %item.id,
            release = %release.title,
            %token,
            "Release submitted"
        );

        let mut next = item.clone();
        next.download = Some(DownloadHandle::new(token, release));
        next.transition(ItemState::Downloading)?;
        Ok(next)
    }

    /// Joins a download a sibling already started for the same release.
    ///
    /// Episodes sharing a season pack ride on one debrid download.
    pub fn adopt(&self, item: &Item, handle: &DownloadHandle) -> Result<Item, AppError> {
        let mut next = item.clone();
        next.download = Some(handle.clone());
        next.transition(ItemState::Downloading)?;
        Ok(next)
    }

    /// Refreshes progress. State stays DOWNLOADING; completion is recorded
    /// on the handle and handed to reconciliation by the caller.
    pub async fn poll(
        &self,
        item: &Item,
        debrid: &Arc<dyn DebridAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Item, AppError> {
        let Some(handle) = item.download.as_ref().filter(|_| item.state == ItemState::Downloading)
        else {
            return Err(AppError::InvalidRequest(format!(
                "{} is not downloading (state {})",
                item.id, item.state
            )));
        };

        let status = self
            .call(debrid, cancel, || debrid.poll_download(&handle.token))
            .await?;

        let mut next = item.clone();
        let Some(handle) = next.download.as_mut() else {
            return Ok(next);
        };
        handle.progress = status.progress.clamp(0.0, 1.0);
        handle.bytes_done = status.bytes_done;
        handle.bytes_total = status.bytes_total;
        handle.files = status.files;
        match status.phase {
            DownloadPhase::Queued | DownloadPhase::Downloading => {}
            DownloadPhase::Completed => {
                handle.progress = 1.0;
                if handle.completed_at.is_none() {
                    handle.completed_at = Some(Utc::now());
                    tracing::info!(item_id = %item.id, files = status.files, "Download completed");
                }
            }
            DownloadPhase::Failed(reason) => return Err(reason.into_error()),
        }
        next.clear_failure();
        next.touch();
        Ok(next)
    }

    /// Whether the release retry budget still covers another re-selection.
    pub fn can_reselect(&self, item: &Item) -> bool {
        item.release_retries < self.retry_budget
    }

    /// Excludes the failed release and sends the item back to CONTENT.
    ///
    /// Returns `None` when `error` is not a release problem or the budget is
    /// spent; the caller then parks the item in ERROR.
    pub fn remediate(&self, item: &Item, error: &AppError) -> Option<Item> {
        if !matches!(error, AppError::ReleaseUnavailable(_)) || !self.can_reselect(item) {
            return None;
        }
        let failed = item
            .download
            .as_ref()
            .map(|d| d.release.release_id.clone())
            .or_else(|| item.chosen_release.as_ref().map(|c| c.release_id.clone()))?;

        let mut next = item.clone();
        if !next.excluded_releases.contains(&failed) {
            next.excluded_releases.push(failed.clone());
        }
        next.candidates.retain(|c| c.release_id != failed);
        next.release_retries += 1;
        next.download = None;
        next.transition(ItemState::Content).ok()?;
        tracing::info!(
            item_id = %item.id,
            release = %failed,
            retries = next.release_retries,
            "Release unavailable, scraping again without it"
        );
        Some(next)
    }
}
