use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fathom_core::error::AppError;
use fathom_core::item::{
    Availability, Candidate, DownloadHandle, Item, ItemError, ItemKind, ItemProjection,
    LibraryRef, MediaRequest, SeasonRequest,
};
use fathom_core::settings::SettingsValidation;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Settings sections keyed by name.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(transparent)]
#[schema(value_type = Object)]
pub struct SettingsSections(pub serde_json::Map<String, serde_json::Value>);

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ServiceValidationResponse {
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetSettingsResponse {
    pub all_services_true: bool,
    pub services: BTreeMap<String, ServiceValidationResponse>,
}

impl From<SettingsValidation> for SetSettingsResponse {
    fn from(validation: SettingsValidation) -> Self {
        Self {
            all_services_true: validation.all_services_true,
            services: validation
                .services
                .into_iter()
                .map(|(name, v)| {
                    (
                        name,
                        ServiceValidationResponse {
                            valid: v.valid,
                            error: v.error,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LoadSettingsResponse {
    pub status: String,
    pub scrapers: Vec<String>,
    pub debrid: Option<String>,
    pub media_server: Option<String>,
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SeasonRequestBody {
    pub number: u32,
    #[serde(default)]
    pub episodes: Vec<u32>,
}

/// A movie, or a show with the seasons and episodes wanted.
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct IntakeRequest {
    pub imdb_id: String,
    /// `movie` or `show`.
    pub kind: String,
    pub title: String,
    pub year: Option<i32>,
    #[serde(default)]
    pub seasons: Vec<SeasonRequestBody>,
}

impl TryFrom<IntakeRequest> for MediaRequest {
    type Error = AppError;

    fn try_from(body: IntakeRequest) -> Result<Self, Self::Error> {
        let kind: ItemKind = body.kind.parse().map_err(AppError::InvalidRequest)?;
        if !matches!(kind, ItemKind::Movie | ItemKind::Show) {
            return Err(AppError::InvalidRequest(format!(
                "only movies and shows can be requested, got {kind}"
            )));
        }
        Ok(MediaRequest {
            imdb_id: body.imdb_id,
            kind,
            title: body.title,
            year: body.year,
            seasons: body
                .seasons
                .into_iter()
                .map(|s| SeasonRequest {
                    number: s.number,
                    episodes: s.episodes,
                })
                .collect(),
        })
    }
}

/// One line of the item listing.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemSummary {
    pub id: String,
    pub kind: String,
    pub state: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

impl From<ItemProjection> for ItemSummary {
    fn from(p: ItemProjection) -> Self {
        Self {
            id: p.id,
            kind: p.kind.to_string(),
            state: p.state.to_string(),
            title: p.title,
            updated_at: p.updated_at,
        }
    }
}

impl From<&Item> for ItemSummary {
    fn from(item: &Item) -> Self {
        ItemProjection::from(item).into()
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IntakeResponse {
    pub items: Vec<ItemSummary>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReleaseResponse {
    pub release_id: String,
    pub title: String,
    pub resolution: String,
    pub score: u32,
    pub adapter: String,
    pub seeders: Option<u32>,
    pub size_bytes: Option<u64>,
}

impl From<&Candidate> for ReleaseResponse {
    fn from(c: &Candidate) -> Self {
        Self {
            release_id: c.release_id.clone(),
            title: c.title.clone(),
            resolution: c.resolution.to_string(),
            score: c.score,
            adapter: c.adapter.clone(),
            seeders: c.seeders,
            size_bytes: c.size_bytes,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DownloadResponse {
    pub token: String,
    pub release_id: String,
    pub progress: f64,
    pub files: u32,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DownloadHandle> for DownloadResponse {
    fn from(d: &DownloadHandle) -> Self {
        Self {
            token: d.token.clone(),
            release_id: d.release.release_id.clone(),
            progress: d.progress,
            files: d.files,
            submitted_at: d.submitted_at,
            completed_at: d.completed_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LibraryResponse {
    pub key: String,
    pub availability: String,
    pub file_count: u32,
    pub checked_at: DateTime<Utc>,
}

impl From<&LibraryRef> for LibraryResponse {
    fn from(l: &LibraryRef) -> Self {
        let availability = match l.availability {
            Availability::Playable => "playable",
            Availability::Ongoing => "ongoing",
            Availability::MetadataOnly => "metadata_only",
        };
        Self {
            key: l.key.clone(),
            availability: availability.to_string(),
            file_count: l.file_count,
            checked_at: l.checked_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemErrorResponse {
    pub kind: String,
    pub stage: String,
    /// e.g. "transient failure while scraping".
    pub summary: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl From<&ItemError> for ItemErrorResponse {
    fn from(e: &ItemError) -> Self {
        Self {
            kind: e.kind.to_string(),
            stage: e.stage.to_string(),
            summary: e.classification(),
            message: e.message.clone(),
            at: e.at,
        }
    }
}

/// Full item record.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ItemResponse {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub parent: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub state: String,
    pub candidates: usize,
    pub chosen_release: Option<ReleaseResponse>,
    pub excluded_releases: Vec<String>,
    pub download: Option<DownloadResponse>,
    pub library: Option<LibraryResponse>,
    pub last_error: Option<ItemErrorResponse>,
    pub attempts: u32,
    pub scrape_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub revision: u64,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Item> for ItemResponse {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind.to_string(),
            title: item.display_title(),
            year: item.year,
            imdb_id: item.imdb_id.clone(),
            parent: item.parent.clone(),
            season_number: item.season_number,
            episode_number: item.episode_number,
            state: item.state.to_string(),
            candidates: item.candidates.len(),
            chosen_release: item.chosen_release.as_ref().map(Into::into),
            excluded_releases: item.excluded_releases.clone(),
            download: item.download.as_ref().map(Into::into),
            library: item.library.as_ref().map(Into::into),
            last_error: item.last_error.as_ref().map(Into::into),
            attempts: item.attempts,
            scrape_attempts: item.scrape_attempts,
            next_attempt_at: item.next_attempt_at,
            revision: item.revision,
            requested_at: item.requested_at,
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListItemsQuery {
    /// Comma-separated states, e.g. `SCRAPED,DOWNLOADING`.
    pub state: Option<String>,
    pub kind: Option<String>,
    pub parent: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct RemoveQuery {
    /// Also remove every descendant.
    pub cascade: Option<bool>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RemoveResponse {
    pub removed: Vec<String>,
}

// ---------------------------------------------------------------------------
// Health & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ServiceHealth {
    pub name: String,
    /// `scraper`, `debrid`, or `media_server`.
    pub role: String,
    /// Last cached probe: `ok`, `unreachable`, `unauthorized`, or `unknown`.
    pub probe: String,
    pub reason: Option<String>,
    pub circuit: String,
    pub failures: u32,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// `healthy` when every cached probe is ok and no circuit is open.
    pub status: String,
    pub store: String,
    pub version: String,
    pub services: Vec<ServiceHealth>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intake(kind: &str) -> IntakeRequest {
        IntakeRequest {
            imdb_id: "tt0903747".into(),
            kind: kind.into(),
            title: "Breaking Bad".into(),
            year: Some(2008),
            seasons: vec![SeasonRequestBody {
                number: 1,
                episodes: vec![1, 2],
            }],
        }
    }

    #[test]
    fn test_intake_converts_show() {
        let request = MediaRequest::try_from(intake("show")).unwrap();
        assert_eq!(request.kind, ItemKind::Show);
        assert_eq!(request.seasons[0].episodes, vec![1, 2]);
    }

    #[test]
    fn test_intake_rejects_other_kinds() {
        assert!(MediaRequest::try_from(intake("episode")).is_err());
        assert!(MediaRequest::try_from(intake("podcast")).is_err());
    }

    #[test]
    fn test_validation_serializes_camel_case() {
        let mut services = BTreeMap::new();
        services.insert(
            "plex".to_string(),
            ServiceValidationResponse {
                valid: false,
                error: Some("unauthorized: HTTP 401".into()),
            },
        );
        let json = serde_json::to_value(SetSettingsResponse {
            all_services_true: false,
            services,
        })
        .unwrap();
        assert_eq!(json["allServicesTrue"], false);
        assert_eq!(json["services"]["plex"]["valid"], false);
    }
}
