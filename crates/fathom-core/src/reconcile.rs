//! Library reconciliation: confirming completed downloads on the media server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{LibraryQuery, MediaServerAdapter, bounded};
use crate::error::AppError;
use crate::health::HealthGate;
use crate::item::{Availability, Item, ItemKind, ItemState, LibraryRef};

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub enum Reconciled {
    /// The media server shows the item; the record carries the new state.
    Visible(Item),
    /// Not indexed yet; check again later.
    NotYetVisible,
}

#[derive(Clone)]
pub struct LibraryReconciler {
    health: HealthGate,
    timeout: Duration,
    /// Give up on a completed download the server never shows after this long.
    staleness: Duration,
}

impl LibraryReconciler {
    pub fn new(health: HealthGate, timeout: Duration, staleness: Duration) -> Self {
        Self {
            health,
            timeout,
            staleness,
        }
    }

    /// Whether `item` is something this component can look up.
    pub fn accepts(item: &Item) -> bool {
        match item.state {
            ItemState::Downloading => item.download.as_ref().is_some_and(|d| d.is_complete()),
            ItemState::LibraryOngoing | ItemState::LibraryMetadata => true,
            _ => false,
        }
    }

    pub async fn reconcile(
        &self,
        item: &Item,
        media: &Arc<dyn MediaServerAdapter>,
        cancel: &CancellationToken,
    ) -> Result<Reconciled, AppError> {
        if !Self::accepts(item) {
            return Err(AppError::InvalidRequest(format!(
                "{} is not awaiting reconciliation (state {})",
                item.id, item.state
            )));
        }

        let query = LibraryQuery::for_item(item);
        let entry = self
            .health
            .breaker(media.name())
            .call(|| bounded(self.timeout, cancel, media.lookup_library_entry(&query)))
            .await
            .map_err(|e| e.into_app_error())?;

        let Some(entry) = entry else {
            self.check_staleness(item)?;
            tracing::debug!(item_id = %item.id, "Not in library yet");
            return Ok(Reconciled::NotYetVisible);
        };

        let mut next = item.clone();
        let expected = expected_files(item);
        let availability = if entry.availability == Availability::Playable
            && entry.file_count < expected
        {
            tracing::info!(
                item_id = %item.id,
                found = entry.file_count,
                expected,
                "Library entry is missing files"
            );
            Availability::Ongoing
        } else {
            entry.availability
        };
        let state = availability.as_state();
        next.library = Some(LibraryRef {
            key: entry.key,
            availability,
            file_count: entry.file_count,
            checked_at: Utc::now(),
        });
        next.transition(state)?;
        tracing::info!(item_id = %item.id, %state, "Found in library");
        Ok(Reconciled::Visible(next))
    }

    fn check_staleness(&self, item: &Item) -> Result<(), AppError> {
        if item.state != ItemState::Downloading {
            return Ok(());
        }
        let Some(completed_at) = item.download.as_ref().and_then(|d| d.completed_at) else {
            return Ok(());
        };
        let waited = (Utc::now() - completed_at).to_std().unwrap_or_default();
        if waited > self.staleness {
            return Err(AppError::NeverIndexed(self.staleness));
        }
        Ok(())
    }
}

/// Playable files the library must show before an item counts as complete.
///
/// An episode maps to a single file even when it came from a season pack.
fn expected_files(item: &Item) -> u32 {
    match item.kind {
        ItemKind::Movie => item.download.as_ref().map_or(1, |d| d.files.max(1)),
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::item::DownloadHandle;
    use crate::testutil::{MockMediaServer, make_candidate, make_movie, make_show};

    fn reconciler() -> LibraryReconciler {
        LibraryReconciler::new(
            HealthGate::new(Duration::from_secs(60), Duration::from_millis(50)),
            Duration::from_millis(200),
            Duration::from_secs(3600),
        )
    }

    fn completed_download() -> Item {
        let mut item = make_movie("tt1");
        item.state = ItemState::Downloading;
        item.chosen_release = Some(make_candidate("aaa", 1));
        let mut handle = DownloadHandle::new("rd-1", make_candidate("aaa", 1));
        handle.completed_at = Some(Utc::now());
        item.download = Some(handle);
        item
    }

    #[tokio::test]
    async fn test_visible_playable_is_library() {
        let media: Arc<dyn MediaServerAdapter> =
            Arc::new(MockMediaServer::new().with_entry(Availability::Playable));

        let outcome = reconciler()
            .reconcile(&completed_download(), &media, &CancellationToken::new())
            .await
            .unwrap();

        let Reconciled::Visible(item) = outcome else {
            panic!("expected a library match");
        };
        assert_eq!(item.state, ItemState::Library);
        assert_eq!(item.library.unwrap().key, "/library/metadata/1");
        assert!(item.download.is_some());
    }

    #[tokio::test]
    async fn test_availability_maps_to_library_family() {
        for (availability, state) in [
            (Availability::Ongoing, ItemState::LibraryOngoing),
            (Availability::MetadataOnly, ItemState::LibraryMetadata),
        ] {
            let media: Arc<dyn MediaServerAdapter> =
                Arc::new(MockMediaServer::new().with_entry(availability));
            let outcome = reconciler()
                .reconcile(&completed_download(), &media, &CancellationToken::new())
                .await
                .unwrap();
            assert!(matches!(outcome, Reconciled::Visible(item) if item.state == state));
        }
    }

    #[tokio::test]
    async fn test_not_visible_leaves_state_alone() {
        let mock = MockMediaServer::new();
        let media: Arc<dyn MediaServerAdapter> = Arc::new(mock.clone());

        let outcome = reconciler()
            .reconcile(&completed_download(), &media, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, Reconciled::NotYetVisible));
        let lookups = mock.lookups();
        assert_eq!(lookups[0].imdb_id.as_deref(), Some("tt1"));
        assert_eq!(lookups[0].title, "The Matrix");
    }

    #[tokio::test]
    async fn test_stale_download_is_never_indexed() {
        let media: Arc<dyn MediaServerAdapter> = Arc::new(MockMediaServer::new());
        let mut item = completed_download();
        if let Some(handle) = item.download.as_mut() {
            handle.completed_at = Some(Utc::now() - ChronoDuration::hours(2));
        }

        let err = reconciler()
            .reconcile(&item, &media, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::NeverIndexed(_)));
        assert_eq!(err.kind(), ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn test_ongoing_recheck_promotes_to_library() {
        let media: Arc<dyn MediaServerAdapter> =
            Arc::new(MockMediaServer::new().with_entry(Availability::Playable));
        let mut item = completed_download();
        item.state = ItemState::LibraryOngoing;

        let outcome = reconciler()
            .reconcile(&item, &media, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Visible(item) if item.state == ItemState::Library));
    }

    #[tokio::test]
    async fn test_incomplete_download_is_not_reconciled() {
        let media: Arc<dyn MediaServerAdapter> = Arc::new(MockMediaServer::new());
        let mut item = completed_download();
        if let Some(handle) = item.download.as_mut() {
            handle.completed_at = None;
        }
        assert!(
            reconciler()
                .reconcile(&item, &media, &CancellationToken::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_files_hold_item_in_ongoing() {
        let media: Arc<dyn MediaServerAdapter> = Arc::new(
            MockMediaServer::new()
                .with_entry(Availability::Playable)
                .with_file_count(1),
        );
        let mut item = completed_download();
        if let Some(handle) = item.download.as_mut() {
            handle.files = 2;
        }

        let outcome = reconciler()
            .reconcile(&item, &media, &CancellationToken::new())
            .await
            .unwrap();
        let Reconciled::Visible(partial) = outcome else {
            panic!("expected a library match");
        };
        assert_eq!(partial.state, ItemState::LibraryOngoing);
        let library = partial.library.as_ref().unwrap();
        assert_eq!(library.availability, Availability::Ongoing);
        assert_eq!(library.file_count, 1);
        assert!(LibraryReconciler::accepts(&partial));

        let complete: Arc<dyn MediaServerAdapter> = Arc::new(
            MockMediaServer::new()
                .with_entry(Availability::Playable)
                .with_file_count(2),
        );
        let outcome = reconciler()
            .reconcile(&partial, &complete, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Visible(item) if item.state == ItemState::Library));
    }

    #[tokio::test]
    async fn test_pack_episode_needs_one_file() {
        let media: Arc<dyn MediaServerAdapter> =
            Arc::new(MockMediaServer::new().with_entry(Availability::Playable));
        let mut episode = make_show("tt0903747", 3).remove(2);
        episode.state = ItemState::Downloading;
        episode.chosen_release = Some(make_candidate("pack", 1));
        let mut handle = DownloadHandle::new("rd-pack", make_candidate("pack", 1));
        handle.files = 3;
        handle.completed_at = Some(Utc::now());
        episode.download = Some(handle);

        let outcome = reconciler()
            .reconcile(&episode, &media, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, Reconciled::Visible(item) if item.state == ItemState::Library));
    }
}
