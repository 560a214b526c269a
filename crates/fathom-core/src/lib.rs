pub mod adapter;
pub mod circuit_breaker;
pub mod download;
pub mod error;
pub mod health;
pub mod item;
pub mod reconcile;
pub mod release;
pub mod retry;
pub mod scheduler;
pub mod scrape;
pub mod settings;
pub mod state;
pub mod store;
pub mod throttle;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use adapter::{
    AdapterFactory, AdapterKind, AdapterRegistry, AdapterSet, DebridAdapter, MediaServerAdapter,
    ProbeStatus, ScraperAdapter, ScraperEntry, ServiceAdapter,
};
pub use error::{AppError, ErrorKind};
pub use health::HealthGate;
pub use item::{Item, ItemFilter, ItemKind, ItemProjection, ItemState, MediaRequest};
pub use release::compute_hash;
pub use scheduler::{Pipeline, PipelineConfig, PipelineEvent, PipelineReporter, TracingReporter};
pub use settings::{ServiceName, Settings, SettingsManager};
pub use state::Stage;
pub use store::{EventedStore, ItemEvent, ItemStore, MemoryItemStore};
