use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures::StreamExt;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use fathom_core::adapter::{ProbeStatus, ServiceAdapter};
use fathom_core::circuit_breaker::{CircuitSnapshot, CircuitState};
use fathom_core::error::AppError;
use fathom_core::item::{ItemFilter, ItemKind, ItemState, MediaRequest};
use fathom_core::settings::SettingsKey;
use fathom_core::store::{DEFAULT_PAGE_SIZE, ItemStore, list_items};

use crate::auth::require_admin_token;
use crate::dto::{
    ErrorResponse, HealthResponse, IntakeRequest, IntakeResponse, ItemResponse, ItemSummary,
    ListItemsQuery, LoadSettingsResponse, RemoveQuery, RemoveResponse, ServiceHealth,
    SetSettingsResponse, SettingsSections, StatusResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const NDJSON: &str = "application/x-ndjson";

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let writes = Router::new()
        .route("/settings/set", post(set_settings))
        .route("/settings/save", post(save_settings))
        .route("/settings/load", post(load_settings))
        .route("/items", post(create_items))
        .route("/items/{id}/retry", post(retry_item))
        .route("/items/{id}", axum::routing::delete(remove_item))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let reads = Router::new()
        .route("/settings/get/{keys}", get(get_settings))
        .route("/items", get(list_items_ndjson))
        .route("/items/{id}", get(get_item))
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    reads.merge(writes).with_state(state)
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn parse_keys(raw: &str) -> Result<Vec<SettingsKey>, AppError> {
    let keys = raw
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| k.parse::<SettingsKey>().map_err(AppError::InvalidRequest))
        .collect::<Result<Vec<_>, _>>()?;
    if keys.is_empty() {
        return Err(AppError::InvalidRequest("no settings keys given".into()));
    }
    Ok(keys)
}

#[utoipa::path(
    get,
    path = "/settings/get/{keys}",
    params(
        ("keys" = String, Path, description = "Comma-separated keys, e.g. `scrapers,general`")
    ),
    responses(
        (status = 200, description = "Current values of the named sections", body = SettingsSections),
        (status = 400, description = "Unknown key", body = ErrorResponse),
    ),
    tag = "settings"
)]
pub async fn get_settings(
    State(state): State<Arc<AppState>>,
    Path(keys): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let keys = parse_keys(&keys)?;
    let values = state.settings.get(&keys)?;
    Ok(axum::Json(SettingsSections(values)))
}

#[utoipa::path(
    post,
    path = "/settings/set",
    request_body = SettingsSections,
    responses(
        (status = 200, description = "Per-service validation", body = SetSettingsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "settings"
)]
pub async fn set_settings(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SettingsSections>,
) -> impl IntoResponse {
    let validation = state.settings.set(body.0, state.factory.as_ref()).await;
    if !validation.all_services_true {
        tracing::warn!(
            failed = ?validation
                .services
                .iter()
                .filter(|(_, v)| !v.valid)
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>(),
            "Settings applied with failing services"
        );
    }
    axum::Json(SetSettingsResponse::from(validation))
}

#[utoipa::path(
    post,
    path = "/settings/save",
    responses(
        (status = 200, description = "Working settings persisted", body = StatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "settings"
)]
pub async fn save_settings(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    state.settings.save().await?;
    Ok(axum::Json(StatusResponse {
        status: "saved".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/settings/load",
    responses(
        (status = 200, description = "Adapters rebuilt from the settings file", body = LoadSettingsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "settings"
)]
pub async fn load_settings(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let settings = state.settings.reload().await?;
    let set = state.factory.build_all(&settings)?;

    let response = LoadSettingsResponse {
        status: "loaded".to_string(),
        scrapers: set.scrapers.iter().map(|s| s.name().to_string()).collect(),
        debrid: set.debrid.as_ref().map(|d| d.name().to_string()),
        media_server: set.media_server.as_ref().map(|m| m.name().to_string()),
    };

    state.registry.replace(set);
    state.health.invalidate_all();

    // Items parked on a missing adapter get another look with the new set.
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.sweep().await {
            tracing::warn!(error = %e, "Sweep after settings load failed");
        }
    });

    Ok(axum::Json(response))
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

fn item_filter(query: ListItemsQuery) -> Result<ItemFilter, AppError> {
    let mut filter = ItemFilter::all();
    if let Some(states) = query.state {
        let states = states
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<ItemState>().map_err(AppError::InvalidRequest))
            .collect::<Result<Vec<_>, _>>()?;
        filter = filter.with_states(states);
    }
    if let Some(kind) = query.kind {
        let kind: ItemKind = kind.parse().map_err(AppError::InvalidRequest)?;
        filter = filter.with_kind(kind);
    }
    filter.parent = query.parent;
    Ok(filter)
}

#[utoipa::path(
    get,
    path = "/items",
    params(ListItemsQuery),
    responses(
        (status = 200, description = "One JSON item summary per line", body = ItemSummary, content_type = "application/x-ndjson"),
        (status = 400, description = "Bad filter", body = ErrorResponse),
    ),
    tag = "items"
)]
pub async fn list_items_ndjson(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListItemsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let filter = item_filter(query)?;
    let lines = list_items(state.store().clone(), filter, DEFAULT_PAGE_SIZE).map(|item| {
        let item = item?;
        let mut line = serde_json::to_vec(&ItemSummary::from(&item))?;
        line.push(b'\n');
        Ok::<_, AppError>(line)
    });

    Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)))
}

#[utoipa::path(
    get,
    path = "/items/{id}",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 200, description = "Full item record", body = ItemResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
    ),
    tag = "items"
)]
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| AppError::ItemNotFound(id.clone()))?;
    Ok(axum::Json(ItemResponse::from(&item)))
}

#[utoipa::path(
    post,
    path = "/items",
    request_body = IntakeRequest,
    responses(
        (status = 202, description = "Items accepted", body = IntakeResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn create_items(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<IntakeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request = MediaRequest::try_from(body)?;
    let items = state.pipeline.intake(request).await?;

    let response = IntakeResponse {
        items: items.iter().map(ItemSummary::from).collect(),
    };
    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    post,
    path = "/items/{id}/retry",
    params(("id" = String, Path, description = "Item id")),
    responses(
        (status = 200, description = "Item sent back into the pipeline", body = ItemResponse),
        (status = 400, description = "Nothing to retry", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 409, description = "Item is not in a retryable state", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn retry_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.pipeline.retry(&id).await?;
    Ok(axum::Json(ItemResponse::from(&item)))
}

#[utoipa::path(
    delete,
    path = "/items/{id}",
    params(
        ("id" = String, Path, description = "Item id"),
        RemoveQuery,
    ),
    responses(
        (status = 200, description = "Removed ids, children first", body = RemoveResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .pipeline
        .remove(&id, query.cascade.unwrap_or(false))
        .await?;
    Ok(axum::Json(RemoveResponse { removed }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

fn probe_label(probe: Option<&ProbeStatus>) -> &'static str {
    match probe {
        Some(ProbeStatus::Ok) => "ok",
        Some(ProbeStatus::Unreachable(_)) => "unreachable",
        Some(ProbeStatus::Unauthorized(_)) => "unauthorized",
        None => "unknown",
    }
}

async fn service_health(
    state: &AppState,
    circuits: &[CircuitSnapshot],
    name: &str,
    role: &str,
) -> ServiceHealth {
    let probe = state.health.cached(name).await;
    let circuit = circuits.iter().find(|c| c.service == name);
    ServiceHealth {
        name: name.to_string(),
        role: role.to_string(),
        probe: probe_label(probe.as_ref()).to_string(),
        reason: probe.as_ref().and_then(|p| p.reason()).map(String::from),
        circuit: circuit
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
            .to_string(),
        failures: circuit.map(|c| c.failures).unwrap_or(0),
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Cached adapter health and circuit state", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let adapters = state.registry.snapshot();
    let circuits = state.health.circuits();

    let mut services = Vec::new();
    for scraper in &adapters.scrapers {
        services.push(service_health(&state, &circuits, scraper.name(), "scraper").await);
    }
    if let Some(debrid) = &adapters.debrid {
        services.push(service_health(&state, &circuits, debrid.name(), "debrid").await);
    }
    if let Some(media) = &adapters.media_server {
        services.push(service_health(&state, &circuits, media.name(), "media_server").await);
    }

    let healthy = services
        .iter()
        .all(|s| s.probe == "ok" && s.circuit != CircuitState::Open.to_string());

    axum::Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        store: state.backend_name().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keys() {
        let keys = parse_keys("scrapers, general,plex").unwrap();
        assert_eq!(keys.len(), 3);
        assert!(parse_keys("").is_err());
        assert!(parse_keys("scrapers,bogus").is_err());
    }

    #[test]
    fn test_item_filter_from_query() {
        let filter = item_filter(ListItemsQuery {
            state: Some("SCRAPED, downloading".into()),
            kind: Some("movie".into()),
            parent: None,
        })
        .unwrap();
        assert_eq!(
            filter.states,
            vec![ItemState::Scraped, ItemState::Downloading]
        );
        assert_eq!(filter.kind, Some(ItemKind::Movie));

        let bad = item_filter(ListItemsQuery {
            state: Some("NOPE".into()),
            kind: None,
            parent: None,
        });
        assert!(matches!(bad, Err(AppError::InvalidRequest(_))));
    }
}
