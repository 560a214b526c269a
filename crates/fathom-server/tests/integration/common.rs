use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use fathom_core::adapter::AdapterKind;
use fathom_core::settings::{ServiceName, SettingsManager};
use fathom_core::testutil::{MockAdapterFactory, MockDebrid, MockMediaServer, MockScraper};
use fathom_db::ItemBackend;
use fathom_server::routes;
use fathom_server::state::AppState;

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub factory: MockAdapterFactory,
    _dir: TempDir,
}

impl TestApp {
    /// Sends one request through a clone of the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub fn default_factory() -> MockAdapterFactory {
    MockAdapterFactory::default()
        .with_adapter(
            ServiceName::Torrentio,
            AdapterKind::Scraper(Arc::new(MockScraper::new("torrentio", vec![]))),
        )
        .with_adapter(
            ServiceName::RealDebrid,
            AdapterKind::Debrid(Arc::new(MockDebrid::new())),
        )
        .with_adapter(
            ServiceName::Plex,
            AdapterKind::MediaServer(Arc::new(MockMediaServer::new())),
        )
}

pub async fn setup_with(factory: MockAdapterFactory, admin_token: Option<&str>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let settings = SettingsManager::load_or_init(dir.path().join("settings.json")).unwrap();
    let state = Arc::new(
        AppState::new(
            ItemBackend::memory(),
            settings,
            Arc::new(factory.clone()),
            admin_token.map(String::from),
        )
        .unwrap(),
    );

    TestApp {
        router: routes::router(state.clone()),
        state,
        factory,
        _dir: dir,
    }
}

/// App guarded by [`TEST_ADMIN_TOKEN`].
pub async fn setup_test_app() -> TestApp {
    setup_with(default_factory(), Some(TEST_ADMIN_TOKEN)).await
}

/// App without an admin token: write endpoints are open.
pub async fn setup_test_app_no_auth() -> TestApp {
    setup_with(default_factory(), None).await
}

pub fn authed(builder: axum::http::request::Builder) -> axum::http::request::Builder {
    builder.header("authorization", format!("Bearer {TEST_ADMIN_TOKEN}"))
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    authed(Request::builder().method(method).uri(uri))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

pub async fn body_lines(response: Response<Body>) -> Vec<serde_json::Value> {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec())
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}
