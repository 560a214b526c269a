//! Item persistence.
//!
//! Every write that advances an item goes through compare-and-set: the caller
//! names the state (and, for full records, the revision) it read, and the
//! store refuses the write with [`AppError::Conflict`] if someone else got
//! there first. The caller reloads and recomputes.

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use tokio::sync::broadcast;

use crate::error::AppError;
use crate::item::{Item, ItemFilter, ItemState};

/// Page size used when streaming the whole store.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Durable mapping from item id to the current record.
pub trait ItemStore: Send + Sync + Clone {
    fn get(&self, id: &str) -> impl Future<Output = Result<Option<Item>, AppError>> + Send;

    /// Writes `item` unconditionally and returns the stored record.
    fn upsert(&self, item: &Item) -> impl Future<Output = Result<Item, AppError>> + Send;

    /// Writes `item` only if its id is unused. Returns whether it was written.
    fn insert_new(&self, item: &Item) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Moves the stored item from `expected` to `next` and nothing else.
    fn cas_state(
        &self,
        id: &str,
        expected: ItemState,
        next: ItemState,
    ) -> impl Future<Output = Result<Item, AppError>> + Send;

    /// Replaces the stored record if it is still in `expected` at
    /// `item.revision`. The returned record carries the bumped revision.
    fn cas_update(
        &self,
        item: &Item,
        expected: ItemState,
    ) -> impl Future<Output = Result<Item, AppError>> + Send;

    /// Deletes one item. Returns the removed record, if there was one.
    fn remove(&self, id: &str) -> impl Future<Output = Result<Option<Item>, AppError>> + Send;

    /// Items matching `filter` with ids strictly after `after`, ordered by id.
    fn list_page(
        &self,
        filter: &ItemFilter,
        after: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Item>, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct PageCursor<S> {
    store: S,
    filter: ItemFilter,
    after: Option<String>,
    page_size: usize,
    exhausted: bool,
}

async fn next_page<S: ItemStore>(
    mut cursor: PageCursor<S>,
) -> Result<Option<(Vec<Item>, PageCursor<S>)>, AppError> {
    if cursor.exhausted {
        return Ok(None);
    }
    let page = cursor
        .store
        .list_page(&cursor.filter, cursor.after.as_deref(), cursor.page_size)
        .await?;
    let Some(last) = page.last() else {
        return Ok(None);
    };
    cursor.after = Some(last.id.clone());
    cursor.exhausted = page.len() < cursor.page_size;
    Ok(Some((page, cursor)))
}

/// Lazily streams every item matching `filter`.
///
/// Pages are fetched as the stream is consumed, so a long-lived consumer sees
/// writes that land after it started. Calling this again restarts from the
/// first page.
pub fn list_items<S>(
    store: S,
    filter: ItemFilter,
    page_size: usize,
) -> impl Stream<Item = Result<Item, AppError>> + Send + 'static
where
    S: ItemStore + 'static,
{
    let cursor = PageCursor {
        store,
        filter,
        after: None,
        page_size: page_size.max(1),
        exhausted: false,
    };
    stream::try_unfold(cursor, next_page)
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Item, AppError>)))
        .try_flatten()
}

/// Collects a filtered listing into memory. For small result sets only.
pub async fn collect_items<S>(store: &S, filter: ItemFilter) -> Result<Vec<Item>, AppError>
where
    S: ItemStore + 'static,
{
    list_items(store.clone(), filter, DEFAULT_PAGE_SIZE)
        .try_collect()
        .await
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Store backed by a process-local map. Used when no database is configured.
#[derive(Clone, Default)]
pub struct MemoryItemStore {
    items: Arc<RwLock<BTreeMap<String, Item>>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Item>> {
        self.items
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Item>> {
        self.items
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn conflict(id: &str, expected: ItemState, actual: ItemState) -> AppError {
    AppError::Conflict {
        id: id.to_string(),
        expected,
        actual,
    }
}

impl ItemStore for MemoryItemStore {
    async fn get(&self, id: &str) -> Result<Option<Item>, AppError> {
        Ok(self.read().get(id).cloned())
    }

    async fn upsert(&self, item: &Item) -> Result<Item, AppError> {
        let mut items = self.write();
        let mut stored = item.clone();
        stored.revision = items
            .get(&item.id)
            .map_or(item.revision, |current| current.revision + 1);
        items.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn insert_new(&self, item: &Item) -> Result<bool, AppError> {
        let mut items = self.write();
        if items.contains_key(&item.id) {
            return Ok(false);
        }
        items.insert(item.id.clone(), item.clone());
        Ok(true)
    }

    async fn cas_state(
        &self,
        id: &str,
        expected: ItemState,
        next: ItemState,
    ) -> Result<Item, AppError> {
        let mut items = self.write();
        let stored = items
            .get_mut(id)
            .ok_or_else(|| AppError::ItemNotFound(id.to_string()))?;
        if stored.state != expected {
            return Err(conflict(id, expected, stored.state));
        }
        stored.state = next;
        stored.revision += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn cas_update(&self, item: &Item, expected: ItemState) -> Result<Item, AppError> {
        let mut items = self.write();
        let stored = items
            .get_mut(&item.id)
            .ok_or_else(|| AppError::ItemNotFound(item.id.clone()))?;
        if stored.state != expected || stored.revision != item.revision {
            return Err(conflict(&item.id, expected, stored.state));
        }
        let mut next = item.clone();
        next.revision = stored.revision + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn remove(&self, id: &str) -> Result<Option<Item>, AppError> {
        Ok(self.write().remove(id))
    }

    async fn list_page(
        &self,
        filter: &ItemFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Item>, AppError> {
        let items = self.read();
        let lower = match after {
            Some(id) => Bound::Excluded(id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(items
            .range((lower, Bound::Unbounded))
            .map(|(_, item)| item)
            .filter(|item| filter.matches(item))
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Published after a write commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemEvent {
    Changed {
        id: String,
        parent: Option<String>,
        state: ItemState,
        revision: u64,
    },
    Removed {
        id: String,
        parent: Option<String>,
    },
}

impl ItemEvent {
    pub fn id(&self) -> &str {
        match self {
            ItemEvent::Changed { id, .. } | ItemEvent::Removed { id, .. } => id,
        }
    }

    fn changed(item: &Item) -> Self {
        ItemEvent::Changed {
            id: item.id.clone(),
            parent: item.parent.clone(),
            state: item.state,
            revision: item.revision,
        }
    }
}

/// Store wrapper that broadcasts an [`ItemEvent`] for every committed write.
///
/// Receivers that fall behind get `RecvError::Lagged` and are expected to
/// resynchronize with a full listing.
#[derive(Clone)]
pub struct EventedStore<S> {
    inner: S,
    events: broadcast::Sender<ItemEvent>,
}

impl<S: ItemStore> EventedStore<S> {
    pub fn new(inner: S) -> Self {
        Self::with_capacity(inner, 1024)
    }

    pub fn with_capacity(inner: S, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { inner, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.events.subscribe()
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn publish(&self, event: ItemEvent) {
        // No receivers is fine: nobody is scheduling yet.
        let _ = self.events.send(event);
    }
}

impl<S: ItemStore> ItemStore for EventedStore<S> {
    async fn get(&self, id: &str) -> Result<Option<Item>, AppError> {
        self.inner.get(id).await
    }

    async fn upsert(&self, item: &Item) -> Result<Item, AppError> {
        let stored = self.inner.upsert(item).await?;
        self.publish(ItemEvent::changed(&stored));
        Ok(stored)
    }

    async fn insert_new(&self, item: &Item) -> Result<bool, AppError> {
        let inserted = self.inner.insert_new(item).await?;
        if inserted {
            self.publish(ItemEvent::changed(item));
        }
        Ok(inserted)
    }

    async fn cas_state(
        &self,
        id: &str,
        expected: ItemState,
        next: ItemState,
    ) -> Result<Item, AppError> {
        let stored = self.inner.cas_state(id, expected, next).await?;
        self.publish(ItemEvent::changed(&stored));
        Ok(stored)
    }

    async fn cas_update(&self, item: &Item, expected: ItemState) -> Result<Item, AppError> {
        let stored = self.inner.cas_update(item, expected).await?;
        self.publish(ItemEvent::changed(&stored));
        Ok(stored)
    }

    async fn remove(&self, id: &str) -> Result<Option<Item>, AppError> {
        let removed = self.inner.remove(id).await?;
        if let Some(item) = &removed {
            self.publish(ItemEvent::Removed {
                id: item.id.clone(),
                parent: item.parent.clone(),
            });
        }
        Ok(removed)
    }

    async fn list_page(
        &self,
        filter: &ItemFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Item>, AppError> {
        self.inner.list_page(filter, after, limit).await
    }
}
