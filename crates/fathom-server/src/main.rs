use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fathom_adapters::HttpAdapterFactory;
use fathom_core::settings::SettingsManager;
use fathom_db::{Database, DatabaseConfig, ItemBackend};
use fathom_server::routes;
use fathom_server::state::AppState;

const DEFAULT_SETTINGS_PATH: &str = "data/settings.json";
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fathom=info".parse()?))
        .with_target(false)
        .init();

    let settings_path = std::env::var("FATHOM_SETTINGS_PATH")
        .unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
    let port = std::env::var("FATHOM_SERVER_PORT").unwrap_or_else(|_| "8080".to_string());
    let admin_token = std::env::var("FATHOM_ADMIN_TOKEN").ok();
    let addr = format!("0.0.0.0:{port}");

    let settings = SettingsManager::load_or_init(&settings_path)
        .with_context(|| format!("Failed to load settings from {settings_path}"))?;
    let backend = connect_backend().await?;

    if admin_token.as_deref().is_none_or(|t| t.trim().is_empty()) {
        tracing::warn!("FATHOM_ADMIN_TOKEN not set, write endpoints are open");
    }

    let state = Arc::new(AppState::new(
        backend,
        settings,
        Arc::new(HttpAdapterFactory::new()),
        admin_token,
    )?);
    tracing::info!(store = state.backend_name(), "Item store ready");

    let shutdown = CancellationToken::new();
    let pipeline = state.pipeline.clone();
    let pipeline_shutdown = shutdown.clone();
    let pipeline_task = tokio::spawn(async move { pipeline.run(pipeline_shutdown).await });

    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    pipeline_task
        .await
        .context("Pipeline task panicked")?
        .context("Pipeline stopped with an error")?;

    Ok(())
}

/// PostgreSQL when `DATABASE_URL` is set, the in-memory store otherwise.
async fn connect_backend() -> anyhow::Result<ItemBackend> {
    let Some(config) = DatabaseConfig::from_env_optional()? else {
        tracing::warn!("DATABASE_URL not set, items are kept in memory only");
        return Ok(ItemBackend::memory());
    };
    let db = Database::connect(&config).await?;
    db.migrate().await?;
    Ok(db.item_repo().into())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for CTRL+C");
                return;
            }
        }
        () = shutdown.cancelled() => {}
    }
    tracing::info!("Shutdown signal received");
}
