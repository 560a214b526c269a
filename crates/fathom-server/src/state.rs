use std::sync::Arc;

use fathom_core::adapter::{AdapterFactory, AdapterRegistry};
use fathom_core::error::AppError;
use fathom_core::health::HealthGate;
use fathom_core::scheduler::{Pipeline, PipelineConfig};
use fathom_core::settings::{Settings, SettingsManager};
use fathom_core::store::EventedStore;
use fathom_db::ItemBackend;

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub pipeline: Pipeline<ItemBackend>,
    pub settings: SettingsManager,
    pub registry: AdapterRegistry,
    pub health: HealthGate,
    pub factory: Arc<dyn AdapterFactory>,
    /// Token guarding write endpoints. `None` leaves them open.
    pub admin_token: Option<String>,
}

impl AppState {
    /// Wires the pipeline and adapters from the active settings.
    pub fn new(
        backend: ItemBackend,
        settings: SettingsManager,
        factory: Arc<dyn AdapterFactory>,
        admin_token: Option<String>,
    ) -> Result<Self, AppError> {
        let active = settings.active();
        let registry = AdapterRegistry::new(factory.build_all(&active)?);
        let health = health_gate(&active);
        let pipeline = Pipeline::new(
            EventedStore::new(backend),
            registry.clone(),
            health.clone(),
            PipelineConfig::from_settings(&active),
        );
        Ok(Self {
            pipeline,
            settings,
            registry,
            health,
            factory,
            admin_token: admin_token.filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn store(&self) -> &EventedStore<ItemBackend> {
        self.pipeline.store()
    }

    pub fn backend_name(&self) -> &'static str {
        self.store().inner().name()
    }
}

fn health_gate(settings: &Settings) -> HealthGate {
    HealthGate::new(
        std::time::Duration::from_secs(settings.general.probe_ttl_secs.max(1)),
        settings.probe_timeout(),
    )
}
