use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fathom API",
        version = "0.1.0",
        description = "Media acquisition pipeline: scraping, debrid downloads, and library reconciliation."
    ),
    paths(
        crate::routes::get_settings,
        crate::routes::set_settings,
        crate::routes::save_settings,
        crate::routes::load_settings,
        crate::routes::list_items_ndjson,
        crate::routes::get_item,
        crate::routes::create_items,
        crate::routes::retry_item,
        crate::routes::remove_item,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SettingsSections,
        crate::dto::SetSettingsResponse,
        crate::dto::ServiceValidationResponse,
        crate::dto::StatusResponse,
        crate::dto::LoadSettingsResponse,
        crate::dto::IntakeRequest,
        crate::dto::SeasonRequestBody,
        crate::dto::IntakeResponse,
        crate::dto::ItemSummary,
        crate::dto::ItemResponse,
        crate::dto::ReleaseResponse,
        crate::dto::DownloadResponse,
        crate::dto::LibraryResponse,
        crate::dto::ItemErrorResponse,
        crate::dto::RemoveResponse,
        crate::dto::ServiceHealth,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "settings", description = "Service configuration and validation"),
        (name = "items", description = "Requested media and pipeline state"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI document.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin token for write endpoints. Set via FATHOM_ADMIN_TOKEN.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
