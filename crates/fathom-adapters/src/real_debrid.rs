//! Real-Debrid torrent API.

use std::time::Duration;

use async_trait::async_trait;
use fathom_core::adapter::{
    DebridAdapter, DownloadPhase, DownloadStatus, FailureReason, ProbeStatus, ServiceAdapter,
};
use fathom_core::error::AppError;
use fathom_core::item::Candidate;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::http::{HttpService, probe_status, read_json, status_error};

pub struct RealDebrid {
    http: HttpService,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(default)]
    username: String,
    #[serde(rename = "type", default)]
    account_type: String,
}

#[derive(Debug, Deserialize)]
struct AddedTorrent {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error: String,
    error_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TorrentInfo {
    status: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    bytes: u64,
    #[serde(default)]
    original_bytes: u64,
    #[serde(default)]
    files: Vec<TorrentFile>,
    #[serde(default)]
    links: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TorrentFile {
    #[serde(default)]
    path: String,
    #[serde(default)]
    selected: u8,
}

const VIDEO_EXTENSIONS: [&str; 6] = ["mkv", "mp4", "avi", "m4v", "ts", "wmv"];

/// Selected files the media server will list as playable parts.
///
/// Falls back to every selected file when the listing carries no paths.
fn media_files(files: &[TorrentFile]) -> usize {
    let selected = files.iter().filter(|f| f.selected == 1);
    if files.iter().all(|f| f.path.is_empty()) {
        return selected.count();
    }
    selected.filter(|f| is_video(&f.path)).count()
}

fn is_video(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
    let is_video_ext = name
        .rsplit_once('.')
        .is_some_and(|(_, ext)| VIDEO_EXTENSIONS.contains(&ext));
    is_video_ext && !name.contains("sample")
}

impl RealDebrid {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            http: HttpService::new(url, timeout)?,
            api_key: api_key.to_string(),
        })
    }

    async fn call(&self, request: RequestBuilder) -> Result<Response, AppError> {
        let response = self
            .http
            .send_raw(request.bearer_auth(&self.api_key))
            .await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

/// Maps a Real-Debrid error response.
///
/// The JSON `error_code` separates releases the service will never serve
/// from account problems, which the HTTP status alone does not.
fn classify(status: StatusCode, body: &str) -> AppError {
    let api: Option<ApiError> = serde_json::from_str(body).ok();
    let code = api.as_ref().and_then(|e| e.error_code);
    let message = api
        .as_ref()
        .map(|e| e.error.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match (status.as_u16(), code) {
        (451, _) | (_, Some(30 | 35 | 29)) => AppError::ReleaseUnavailable(message),
        (_, Some(8 | 9 | 14 | 22)) => AppError::Unauthorized(message),
        (_, Some(21 | 23 | 26)) => AppError::Rejected(message),
        (_, Some(34)) => AppError::RateLimitExceeded,
        (404, _) => AppError::ReleaseUnavailable(message),
        _ => status_error(status, body),
    }
}

fn magnet(release: &Candidate) -> String {
    format!("magnet:?xt=urn:btih:{}", release.release_id)
}

fn phase(status: &str) -> DownloadPhase {
    match status {
        "downloaded" => DownloadPhase::Completed,
        "downloading" | "compressing" | "uploading" => DownloadPhase::Downloading,
        "magnet_error" | "error" | "virus" | "dead" => {
            DownloadPhase::Failed(FailureReason::ReleaseUnavailable(format!("torrent {status}")))
        }
        _ => DownloadPhase::Queued,
    }
}

#[async_trait]
impl ServiceAdapter for RealDebrid {
    fn name(&self) -> &str {
        "real_debrid"
    }

    async fn probe(&self) -> ProbeStatus {
        let result = match self.call(self.http.get("user")).await {
            Ok(response) => read_json::<User>(response).await,
            Err(e) => Err(e),
        }
        .and_then(|user| {
            if user.account_type == "premium" {
                Ok(())
            } else {
                Err(AppError::Unauthorized(format!(
                    "{} is not a premium account",
                    user.username
                )))
            }
        });
        probe_status(result)
    }
}

#[async_trait]
impl DebridAdapter for RealDebrid {
    async fn submit_download(&self, release: &Candidate) -> Result<String, AppError> {
        let magnet = magnet(release);
        let response = self
            .call(
                self.http
                    .post("torrents/addMagnet")
                    .form(&[("magnet", magnet.as_str())]),
            )
            .await?;
        let added: AddedTorrent = read_json(response).await?;

        self.call(
            self.http
                .post(&format!("torrents/selectFiles/{}", added.id))
                .form(&[("files", "all")]),
        )
        .await?;

        tracing::info!(token = %added.id, release = %release.title, "Submitted to Real-Debrid");
        Ok(added.id)
    }

    async fn poll_download(&self, token: &str) -> Result<DownloadStatus, AppError> {
        let response = self
            .call(self.http.get(&format!("torrents/info/{token}")))
            .await?;
        let info: TorrentInfo = read_json(response).await?;

        let selected = media_files(&info.files);
        let files = if info.files.is_empty() {
            info.links.len()
        } else {
            selected
        };
        let bytes_total = if info.bytes > 0 {
            info.bytes
        } else {
            info.original_bytes
        };
        let progress = (info.progress / 100.0).clamp(0.0, 1.0);
        let phase = phase(&info.status);
        let bytes_done = if phase == DownloadPhase::Completed {
            bytes_total
        } else {
            (bytes_total as f64 * progress) as u64
        };

        Ok(DownloadStatus {
            phase,
            progress,
            bytes_done,
            bytes_total,
            files: files as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use fathom_core::testutil::make_candidate;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn debrid(server: &MockServer) -> RealDebrid {
        RealDebrid::new(&server.uri(), "rd-key", Duration::from_secs(5)).unwrap()
    }

    fn candidate() -> Candidate {
        make_candidate("abcdef0123456789abcdef0123456789abcdef01", 100)
    }

    #[tokio::test]
    async fn test_submit_adds_magnet_and_selects_files() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/torrents/addMagnet"))
            .and(header("authorization", "Bearer rd-key"))
            .and(body_string_contains("abcdef0123456789abcdef0123456789abcdef01"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "id": "TORRENT1",
                "uri": "https://api.real-debrid.com/rest/1.0/torrents/info/TORRENT1"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/torrents/selectFiles/TORRENT1"))
            .and(body_string_contains("files=all"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let token = debrid(&server).submit_download(&candidate()).await.unwrap();
        assert_eq!(token, "TORRENT1");
    }

    #[tokio::test]
    async fn test_infringing_file_is_release_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/torrents/addMagnet"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "error": "infringing_file",
                "error_code": 35
            })))
            .mount(&server)
            .await;

        let err = debrid(&server).submit_download(&candidate()).await.unwrap_err();
        assert!(matches!(err, AppError::ReleaseUnavailable(_)));
    }

    #[tokio::test]
    async fn test_traffic_exhausted_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "error": "traffic_exhausted",
                "error_code": 23
            })))
            .mount(&server)
            .await;

        let err = debrid(&server).submit_download(&candidate()).await.unwrap_err();
        assert!(matches!(err, AppError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_poll_reports_progress() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/TORRENT1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "TORRENT1",
                "status": "downloading",
                "progress": 40,
                "bytes": 1000,
                "files": [{ "id": 1, "selected": 1 }, { "id": 2, "selected": 0 }],
                "links": []
            })))
            .mount(&server)
            .await;

        let status = debrid(&server).poll_download("TORRENT1").await.unwrap();
        assert_eq!(status.phase, DownloadPhase::Downloading);
        assert!((status.progress - 0.4).abs() < f64::EPSILON);
        assert_eq!(status.bytes_done, 400);
        assert_eq!(status.files, 1);
    }

    #[tokio::test]
    async fn test_poll_counts_only_video_files() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/PACK"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "downloaded",
                "progress": 100,
                "bytes": 3000,
                "files": [
                    { "id": 1, "path": "/Show.S01/Show.S01E01.mkv", "selected": 1 },
                    { "id": 2, "path": "/Show.S01/Show.S01E02.MKV", "selected": 1 },
                    { "id": 3, "path": "/Show.S01/Sample/show.sample.mkv", "selected": 1 },
                    { "id": 4, "path": "/Show.S01/Show.S01.nfo", "selected": 1 },
                    { "id": 5, "path": "/Show.S01/Show.S01E03.mp4", "selected": 0 }
                ],
                "links": ["a", "b", "c", "d"]
            })))
            .mount(&server)
            .await;

        let status = debrid(&server).poll_download("PACK").await.unwrap();
        assert_eq!(status.files, 2);
    }

    #[tokio::test]
    async fn test_poll_maps_terminal_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/DONE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "downloaded", "progress": 100, "bytes": 10, "links": ["a", "b"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/DEAD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "dead", "progress": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/torrents/info/GONE"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": "unknown_ressource", "error_code": 7
            })))
            .mount(&server)
            .await;

        let rd = debrid(&server);
        let done = rd.poll_download("DONE").await.unwrap();
        assert_eq!(done.phase, DownloadPhase::Completed);
        assert_eq!(done.files, 2);
        assert_eq!(done.bytes_done, 10);

        let dead = rd.poll_download("DEAD").await.unwrap();
        assert!(matches!(
            dead.phase,
            DownloadPhase::Failed(FailureReason::ReleaseUnavailable(_))
        ));

        let gone = rd.poll_download("GONE").await.unwrap_err();
        assert!(matches!(gone, AppError::ReleaseUnavailable(_)));
    }

    #[tokio::test]
    async fn test_probe_requires_premium() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "username": "neo", "type": "free"
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            debrid(&server).probe().await,
            ProbeStatus::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_bad_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "bad_token", "error_code": 8
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            debrid(&server).probe().await,
            ProbeStatus::Unauthorized(_)
        ));
    }

    #[test]
    fn test_unknown_status_is_queued() {
        assert_eq!(phase("magnet_conversion"), DownloadPhase::Queued);
        assert_eq!(phase("waiting_files_selection"), DownloadPhase::Queued);
        assert_eq!(phase("compressing"), DownloadPhase::Downloading);
    }
}
