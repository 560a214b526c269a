use std::time::Duration;

use fathom_core::adapter::ProbeStatus;
use fathom_core::error::AppError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

const USER_AGENT: &str = "Fathom/0.1";

/// Longest slice of an error body worth putting in a message.
const MAX_ERROR_BODY: usize = 200;

/// A reqwest client bound to one service's base URL.
///
/// Every adapter talks HTTP through this, so transport failures and status
/// codes are classified the same way everywhere.
#[derive(Clone)]
pub struct HttpService {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let base_url = base_url.trim().trim_end_matches('/');
        let parsed = Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid URL '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "URL scheme '{}' is not allowed (only http/https)",
                parsed.scheme()
            )));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.client.post(self.url(path))
    }

    /// Sends the request and maps failures. Non-2xx statuses are errors.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let response = self.send_raw(request).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body))
    }

    /// Sends the request and maps transport failures only.
    pub async fn send_raw(&self, request: RequestBuilder) -> Result<Response, AppError> {
        request.send().await.map_err(|e| self.transport_error(e))
    }

    pub async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, AppError> {
        let response = self.send(request).await?;
        read_json(response).await
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {e}"))
        } else {
            AppError::HttpError(e.to_string())
        }
    }
}

pub async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, AppError> {
    response
        .json()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to parse response: {e}")))
}

/// Classifies a non-success status.
///
/// 401/403 are credential problems, 429 and 5xx are worth retrying, and
/// anything else is a request the service will keep refusing.
pub fn status_error(status: StatusCode, body: &str) -> AppError {
    let code = status.as_u16();
    let detail = excerpt(body);
    match code {
        401 | 403 => AppError::Unauthorized(format!("HTTP {code}")),
        429 => AppError::RateLimitExceeded,
        500..=599 => AppError::ServiceUnavailable(format!("HTTP {code}: {detail}")),
        _ => AppError::HttpError(format!("HTTP {code}: {detail}")),
    }
}

/// Folds the outcome of a probe request into a [`ProbeStatus`].
pub fn probe_status<T>(result: Result<T, AppError>) -> ProbeStatus {
    match result {
        Ok(_) => ProbeStatus::Ok,
        Err(e) => ProbeStatus::from_error(&e),
    }
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}
