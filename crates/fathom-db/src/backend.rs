//! Store selection at startup.

use fathom_core::error::AppError;
use fathom_core::item::{Item, ItemFilter, ItemState};
use fathom_core::store::{ItemStore, MemoryItemStore};

use crate::item_repository::PgItemRepository;

/// The store a process runs against: PostgreSQL when a database is
/// configured, otherwise a process-local map.
#[derive(Clone)]
pub enum ItemBackend {
    Postgres(PgItemRepository),
    Memory(MemoryItemStore),
}

impl ItemBackend {
    pub fn memory() -> Self {
        ItemBackend::Memory(MemoryItemStore::new())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemBackend::Postgres(_) => "postgres",
            ItemBackend::Memory(_) => "memory",
        }
    }
}

impl From<PgItemRepository> for ItemBackend {
    fn from(repo: PgItemRepository) -> Self {
        ItemBackend::Postgres(repo)
    }
}

impl From<MemoryItemStore> for ItemBackend {
    fn from(store: MemoryItemStore) -> Self {
        ItemBackend::Memory(store)
    }
}

impl ItemStore for ItemBackend {
    async fn get(&self, id: &str) -> Result<Option<Item>, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.get(id).await,
            ItemBackend::Memory(s) => s.get(id).await,
        }
    }

    async fn upsert(&self, item: &Item) -> Result<Item, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.upsert(item).await,
            ItemBackend::Memory(s) => s.upsert(item).await,
        }
    }

    async fn insert_new(&self, item: &Item) -> Result<bool, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.insert_new(item).await,
            ItemBackend::Memory(s) => s.insert_new(item).await,
        }
    }

    async fn cas_state(
        &self,
        id: &str,
        expected: ItemState,
        next: ItemState,
    ) -> Result<Item, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.cas_state(id, expected, next).await,
            ItemBackend::Memory(s) => s.cas_state(id, expected, next).await,
        }
    }

    async fn cas_update(&self, item: &Item, expected: ItemState) -> Result<Item, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.cas_update(item, expected).await,
            ItemBackend::Memory(s) => s.cas_update(item, expected).await,
        }
    }

    async fn remove(&self, id: &str) -> Result<Option<Item>, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.remove(id).await,
            ItemBackend::Memory(s) => s.remove(id).await,
        }
    }

    async fn list_page(
        &self,
        filter: &ItemFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Item>, AppError> {
        match self {
            ItemBackend::Postgres(s) => s.list_page(filter, after, limit).await,
            ItemBackend::Memory(s) => s.list_page(filter, after, limit).await,
        }
    }
}
