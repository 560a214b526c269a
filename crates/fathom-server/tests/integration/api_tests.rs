use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::json;

use fathom_core::adapter::{AdapterKind, ProbeStatus};
use fathom_core::item::ItemState;
use fathom_core::settings::ServiceName;
use fathom_core::store::ItemStore;
use fathom_core::testutil::{MockScraper, make_movie};

use crate::integration::common::{
    authed, body_json, body_lines, default_factory, json_request, setup_test_app,
    setup_test_app_no_auth, setup_with,
};

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn matrix() -> serde_json::Value {
    json!({
        "imdb_id": "tt0133093",
        "kind": "movie",
        "title": "The Matrix",
        "year": 1999
    })
}

fn breaking_bad() -> serde_json::Value {
    json!({
        "imdb_id": "tt0903747",
        "kind": "show",
        "title": "Breaking Bad",
        "year": 2008,
        "seasons": [{ "number": 1, "episodes": [1, 2] }]
    })
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn write_without_token_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .send(
            Request::post("/items")
                .header("content-type", "application/json")
                .body(Body::from(matrix().to_string()))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_token_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .send(
            Request::post("/settings/save")
                .header("authorization", "Bearer wrong-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reads_need_no_token() {
    let app = setup_test_app().await;

    let response = app.send(get("/items")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn no_admin_token_leaves_writes_open() {
    let app = setup_test_app_no_auth().await;

    let response = app
        .send(
            Request::post("/items")
                .header("content-type", "application/json")
                .body(Body::from(matrix().to_string()))
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_and_get_movie() {
    let app = setup_test_app().await;

    let response = app.send(json_request("POST", "/items", matrix())).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["items"].as_array().unwrap().len(), 1);
    assert_eq!(json["items"][0]["id"], "tt0133093");
    assert_eq!(json["items"][0]["state"], "CONTENT");

    let response = app.send(get("/items/tt0133093")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "movie");
    assert_eq!(json["year"], 1999);
    assert_eq!(json["state"], "CONTENT");
    assert_eq!(json["candidates"], 0);
    assert!(json["chosen_release"].is_null());
}

#[tokio::test]
async fn repeated_intake_keeps_existing_item() {
    let app = setup_test_app().await;

    app.send(json_request("POST", "/items", matrix())).await;
    let response = app.send(json_request("POST", "/items", matrix())).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let lines = body_lines(app.send(get("/items")).await).await;
    assert_eq!(lines.len(), 1);
}

#[tokio::test]
async fn intake_rejects_bad_requests() {
    let app = setup_test_app().await;

    let mut episode = matrix();
    episode["kind"] = json!("episode");
    let response = app.send(json_request("POST", "/items", episode)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "validation_error");

    let mut untitled = matrix();
    untitled["title"] = json!("  ");
    let response = app.send(json_request("POST", "/items", untitled)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_items_streams_ndjson() {
    let app = setup_test_app().await;

    app.send(json_request("POST", "/items", matrix())).await;
    let response = app.send(json_request("POST", "/items", breaking_bad())).await;
    let json = body_json(response).await;
    // show, season, two episodes
    assert_eq!(json["items"].as_array().unwrap().len(), 4);

    let response = app.send(get("/items")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );
    let lines = body_lines(response).await;
    assert_eq!(lines.len(), 5);
    for line in &lines {
        for field in ["id", "kind", "state", "title", "updated_at"] {
            assert!(line.get(field).is_some(), "missing {field} in {line}");
        }
    }

    let episodes = body_lines(app.send(get("/items?kind=episode")).await).await;
    let ids: Vec<&str> = episodes.iter().map(|l| l["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["tt0903747:s1e1", "tt0903747:s1e2"]);

    let children = body_lines(app.send(get("/items?parent=tt0903747")).await).await;
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["kind"], "season");
}

#[tokio::test]
async fn list_items_filters_by_state() {
    let app = setup_test_app().await;
    app.send(json_request("POST", "/items", matrix())).await;

    let content = body_lines(app.send(get("/items?state=CONTENT")).await).await;
    assert_eq!(content.len(), 1);

    let none = body_lines(app.send(get("/items?state=LIBRARY,ERROR")).await).await;
    assert!(none.is_empty());

    let response = app.send(get("/items?state=DONE")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_unknown_item_returns_404() {
    let app = setup_test_app().await;

    let response = app.send(get("/items/tt0000000")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}

#[tokio::test]
async fn retry_moves_error_back_into_the_pipeline() {
    let app = setup_test_app().await;

    let mut failed = make_movie("tt0133093");
    failed.state = ItemState::Error;
    app.state.store().upsert(&failed).await.unwrap();

    let response = app
        .send(
            authed(Request::post("/items/tt0133093/retry"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["state"], "CONTENT");
    assert!(json["last_error"].is_null());
}

#[tokio::test]
async fn retry_of_healthy_item_is_rejected() {
    let app = setup_test_app().await;
    app.send(json_request("POST", "/items", matrix())).await;

    let response = app
        .send(
            authed(Request::post("/items/tt0133093/retry"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(
            authed(Request::post("/items/tt0000000/retry"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn remove_with_and_without_cascade() {
    let app = setup_test_app().await;
    app.send(json_request("POST", "/items", breaking_bad())).await;

    let response = app
        .send(
            authed(Request::delete("/items/tt0903747:s1e2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], json!(["tt0903747:s1e2"]));

    let response = app
        .send(
            authed(Request::delete("/items/tt0903747?cascade=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let removed = body_json(response).await["removed"].clone();
    assert_eq!(removed.as_array().unwrap().len(), 3);

    assert!(body_lines(app.send(get("/items")).await).await.is_empty());

    let response = app
        .send(
            authed(Request::delete("/items/tt0903747"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_settings_returns_named_sections() {
    let app = setup_test_app().await;

    let response = app.send(get("/settings/get/scrapers,general")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["scrapers"]["torrentio"].is_object());
    assert!(json["general"]["probe_ttl_secs"].is_number());
    assert!(json.get("debrid").is_none());

    let response = app.send(get("/settings/get/scrapers,bogus")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn set_settings_validates_each_service() {
    let app = setup_test_app().await;

    let response = app
        .send(json_request(
            "POST",
            "/settings/set",
            json!({
                "torrentio": { "filter": "qualityfilter=480p" },
                "general": { "probe_ttl_secs": 60 },
                "nonsense": {}
            }),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["allServicesTrue"], false);
    assert_eq!(json["services"]["torrentio"]["valid"], true);
    assert_eq!(json["services"]["general"]["valid"], true);
    assert_eq!(json["services"]["nonsense"]["valid"], false);

    // The working copy reflects the accepted values before any save.
    let json = body_json(app.send(get("/settings/get/torrentio")).await).await;
    assert_eq!(json["torrentio"]["filter"], "qualityfilter=480p");
}

#[tokio::test]
async fn set_settings_reports_unreachable_service() {
    let factory = default_factory().with_adapter(
        ServiceName::Torrentio,
        AdapterKind::Scraper(Arc::new(MockScraper::unreachable("torrentio"))),
    );
    let app = setup_with(factory, None).await;

    let response = app
        .send(json_request(
            "POST",
            "/settings/set",
            json!({ "torrentio": { "enabled": true } }),
        ))
        .await;
    let json = body_json(response).await;
    assert_eq!(json["allServicesTrue"], false);
    assert_eq!(json["services"]["torrentio"]["valid"], false);
    assert!(
        json["services"]["torrentio"]["error"]
            .as_str()
            .unwrap()
            .contains("unreachable")
    );
}

#[tokio::test]
async fn save_then_load_rebuilds_adapters() {
    let app = setup_test_app().await;
    let builds_before = app.factory.build_count();

    app.send(json_request(
        "POST",
        "/settings/set",
        json!({ "general": { "probe_ttl_secs": 42 } }),
    ))
    .await;

    let response = app
        .send(
            authed(Request::post("/settings/save"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "saved");

    let response = app
        .send(
            authed(Request::post("/settings/load"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "loaded");
    assert_eq!(json["scrapers"], json!(["torrentio"]));
    assert_eq!(json["debrid"], "real_debrid");
    assert!(app.factory.build_count() > builds_before);

    assert_eq!(app.state.settings.active().general.probe_ttl_secs, 42);
}

// ---------------------------------------------------------------------------
// Health & docs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_cached_probes_only() {
    let app = setup_test_app().await;

    let response = app.send(get("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["store"], "memory");
    assert_eq!(json["status"], "degraded");
    let services = json["services"].as_array().unwrap();
    assert_eq!(services.len(), 3);
    assert!(services.iter().all(|s| s["probe"] == "unknown"));

    for name in ["torrentio", "real_debrid", "plex"] {
        app.state.health.record_probe(name, ProbeStatus::Ok).await;
    }
    let json = body_json(app.send(get("/health")).await).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["services"][0]["role"], "scraper");
    assert_eq!(json["services"][0]["circuit"], "closed");
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = setup_test_app().await;

    let response = app.send(get("/api-docs/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["info"]["title"], "Fathom API");
    assert!(json["paths"]["/items/{id}/retry"].is_object());
}
