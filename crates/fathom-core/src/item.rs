use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorKind};
use crate::release::Resolution;
use crate::state::Stage;

/// Kind of media an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Movie,
    Show,
    Season,
    Episode,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Movie => "movie",
            ItemKind::Show => "show",
            ItemKind::Season => "season",
            ItemKind::Episode => "episode",
        }
    }

    /// Shows and seasons derive their state from their children.
    pub fn is_composite(&self) -> bool {
        matches!(self, ItemKind::Show | ItemKind::Season)
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "movie" => Ok(ItemKind::Movie),
            "show" => Ok(ItemKind::Show),
            "season" => Ok(ItemKind::Season),
            "episode" => Ok(ItemKind::Episode),
            _ => Err(format!("Unknown item kind: {s}")),
        }
    }
}

/// Pipeline state of an item. Serialized with the exact surfaced names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemState {
    Unknown,
    /// Requested, waiting for a scrape.
    Content,
    Scraped,
    ScrapedNotFound,
    PartiallyScraped,
    Downloading,
    PartiallyDownloading,
    Library,
    LibraryOngoing,
    LibraryMetadata,
    Error,
}

impl ItemState {
    pub const ALL: [ItemState; 11] = [
        ItemState::Unknown,
        ItemState::Content,
        ItemState::Scraped,
        ItemState::ScrapedNotFound,
        ItemState::PartiallyScraped,
        ItemState::Downloading,
        ItemState::PartiallyDownloading,
        ItemState::Library,
        ItemState::LibraryOngoing,
        ItemState::LibraryMetadata,
        ItemState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Unknown => "UNKNOWN",
            ItemState::Content => "CONTENT",
            ItemState::Scraped => "SCRAPED",
            ItemState::ScrapedNotFound => "SCRAPED_NOT_FOUND",
            ItemState::PartiallyScraped => "PARTIALLY_SCRAPED",
            ItemState::Downloading => "DOWNLOADING",
            ItemState::PartiallyDownloading => "PARTIALLY_DOWNLOADING",
            ItemState::Library => "LIBRARY",
            ItemState::LibraryOngoing => "LIBRARY_ONGOING",
            ItemState::LibraryMetadata => "LIBRARY_METADATA",
            ItemState::Error => "ERROR",
        }
    }

    pub fn is_library(&self) -> bool {
        matches!(
            self,
            ItemState::Library | ItemState::LibraryOngoing | ItemState::LibraryMetadata
        )
    }

    /// Download submitted or further along.
    pub fn is_download_or_later(&self) -> bool {
        matches!(
            self,
            ItemState::Downloading | ItemState::PartiallyDownloading
        ) || self.is_library()
    }

    /// States the scheduler never picks up on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Library | ItemState::Error)
    }

    /// Whether `chosen_release` may be populated in this state.
    pub fn allows_chosen_release(&self) -> bool {
        matches!(
            self,
            ItemState::Scraped | ItemState::Downloading | ItemState::PartiallyDownloading
        ) || self.is_library()
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase().replace('-', "_");
        ItemState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("Unknown item state: {s}"))
    }
}

/// One ranked release discovered for an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Infohash (lowercase hex), the identity debrid services key on.
    pub release_id: String,
    /// Raw release name as reported by the scraper.
    pub title: String,
    /// Normalized title+year+resolution+group, used for deduplication.
    pub signature: String,
    pub score: u32,
    /// Adapter that produced the winning copy of this release.
    pub adapter: String,
    pub trust: u32,
    /// Every adapter that reported the release.
    pub sources: Vec<String>,
    pub resolution: Resolution,
    pub seeders: Option<u32>,
    pub size_bytes: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    /// Arrival order across the whole fan-out; final tie-break.
    pub seen_order: u32,
}

/// Debrid-side download, kept after completion for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadHandle {
    /// Opaque token issued by the debrid service.
    pub token: String,
    pub release: Candidate,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub files: u32,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadHandle {
    pub fn new(token: impl Into<String>, release: Candidate) -> Self {
        Self {
            token: token.into(),
            release,
            progress: 0.0,
            bytes_done: 0,
            bytes_total: 0,
            files: 0,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// How the media server currently exposes an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Playable,
    /// Present but still being ingested or analysed.
    Ongoing,
    /// A stub with metadata and no playable media.
    MetadataOnly,
}

impl Availability {
    pub fn as_state(&self) -> ItemState {
        match self {
            Availability::Playable => ItemState::Library,
            Availability::Ongoing => ItemState::LibraryOngoing,
            Availability::MetadataOnly => ItemState::LibraryMetadata,
        }
    }
}

/// Media-server identity of an item plus last observed availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryRef {
    pub key: String,
    pub availability: Availability,
    pub file_count: u32,
    pub checked_at: DateTime<Utc>,
}

/// Last failure recorded on an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl ItemError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn from_app_error(stage: Stage, error: &AppError) -> Self {
        Self::new(error.kind(), stage, error.to_string())
    }

    /// Human-readable classification, e.g. "transient failure while scraping".
    pub fn classification(&self) -> String {
        let what = match self.kind {
            ErrorKind::Transient => "transient failure",
            ErrorKind::NotFound => "nothing found",
            ErrorKind::Rejected => "rejected by service",
            ErrorKind::Conflict => "concurrent update",
            ErrorKind::Exhausted => "retries exhausted",
        };
        format!("{what} while {}", self.stage.gerund())
    }
}

/// The unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub kind: ItemKind,
    /// Search title. Seasons and episodes carry their show's title.
    pub title: String,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    /// Non-owning reference to the season or show.
    pub parent: Option<String>,
    pub season_number: Option<u32>,
    pub episode_number: Option<u32>,
    pub state: ItemState,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub chosen_release: Option<Candidate>,
    #[serde(default)]
    pub excluded_releases: Vec<String>,
    pub download: Option<DownloadHandle>,
    pub library: Option<LibraryRef>,
    pub last_error: Option<ItemError>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub release_retries: u32,
    #[serde(default)]
    pub scrape_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revision: u64,
    pub requested_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    fn blank(id: String, kind: ItemKind, title: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            title,
            year: None,
            imdb_id: None,
            parent: None,
            season_number: None,
            episode_number: None,
            state: ItemState::Content,
            candidates: Vec::new(),
            chosen_release: None,
            excluded_releases: Vec::new(),
            download: None,
            library: None,
            last_error: None,
            attempts: 0,
            release_retries: 0,
            scrape_attempts: 0,
            next_attempt_at: None,
            revision: 0,
            requested_at: now,
            updated_at: now,
        }
    }

    pub fn movie(imdb_id: impl Into<String>, title: impl Into<String>, year: Option<i32>) -> Self {
        let imdb_id = imdb_id.into();
        let mut item = Self::blank(imdb_id.clone(), ItemKind::Movie, title.into());
        item.imdb_id = Some(imdb_id);
        item.year = year;
        item
    }

    pub fn show(imdb_id: impl Into<String>, title: impl Into<String>, year: Option<i32>) -> Self {
        let imdb_id = imdb_id.into();
        let mut item = Self::blank(imdb_id.clone(), ItemKind::Show, title.into());
        item.imdb_id = Some(imdb_id);
        item.year = year;
        item
    }

    pub fn season(show: &Item, number: u32) -> Self {
        let mut item = Self::blank(
            format!("{}:s{number}", show.id),
            ItemKind::Season,
            show.title.clone(),
        );
        item.imdb_id = show.imdb_id.clone();
        item.year = show.year;
        item.parent = Some(show.id.clone());
        item.season_number = Some(number);
        item
    }

    pub fn episode(season: &Item, number: u32) -> Self {
        let mut item = Self::blank(
            format!("{}e{number}", season.id),
            ItemKind::Episode,
            season.title.clone(),
        );
        item.imdb_id = season.imdb_id.clone();
        item.year = season.year;
        item.parent = Some(season.id.clone());
        item.season_number = season.season_number;
        item.episode_number = Some(number);
        item
    }

    pub fn is_composite(&self) -> bool {
        self.kind.is_composite()
    }

    /// Title as shown to users, e.g. "Breaking Bad S01E02".
    pub fn display_title(&self) -> String {
        match (self.kind, self.season_number, self.episode_number) {
            (ItemKind::Episode, Some(s), Some(e)) => format!("{} S{s:02}E{e:02}", self.title),
            (ItemKind::Season, Some(s), _) => format!("{} S{s:02}", self.title),
            (ItemKind::Movie, _, _) => match self.year {
                Some(year) => format!("{} ({year})", self.title),
                None => self.title.clone(),
            },
            _ => self.title.clone(),
        }
    }

    /// Whether the item is waiting for a timer before it may be picked up again.
    pub fn is_deferred(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn projection(&self) -> ItemProjection {
        ItemProjection::from(self)
    }
}

/// Compact view of an item for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemProjection {
    pub id: String,
    pub kind: ItemKind,
    pub state: ItemState,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&Item> for ItemProjection {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind,
            state: item.state,
            title: item.display_title(),
            updated_at: item.updated_at,
        }
    }
}

/// Selection criteria for listing items. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemFilter {
    #[serde(default)]
    pub states: Vec<ItemState>,
    pub kind: Option<ItemKind>,
    pub parent: Option<String>,
}

impl ItemFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn children_of(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    pub fn with_states(mut self, states: impl IntoIterator<Item = ItemState>) -> Self {
        self.states = states.into_iter().collect();
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, item: &Item) -> bool {
        (self.states.is_empty() || self.states.contains(&item.state))
            && self.kind.is_none_or(|k| k == item.kind)
            && self
                .parent
                .as_deref()
                .is_none_or(|p| item.parent.as_deref() == Some(p))
    }
}

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// A user request for a movie or a show with the seasons/episodes wanted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRequest {
    pub imdb_id: String,
    pub kind: ItemKind,
    pub title: String,
    pub year: Option<i32>,
    #[serde(default)]
    pub seasons: Vec<SeasonRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonRequest {
    pub number: u32,
    pub episodes: Vec<u32>,
}

impl MediaRequest {
    pub fn movie(imdb_id: impl Into<String>, title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            imdb_id: imdb_id.into(),
            kind: ItemKind::Movie,
            title: title.into(),
            year,
            seasons: Vec::new(),
        }
    }

    pub fn show(imdb_id: impl Into<String>, title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            imdb_id: imdb_id.into(),
            kind: ItemKind::Show,
            title: title.into(),
            year,
            seasons: Vec::new(),
        }
    }

    pub fn with_season(mut self, number: u32, episodes: impl IntoIterator<Item = u32>) -> Self {
        self.seasons.push(SeasonRequest {
            number,
            episodes: episodes.into_iter().collect(),
        });
        self
    }

    /// Expands the request into items, parents before children.
    pub fn into_items(self) -> Result<Vec<Item>, AppError> {
        if self.imdb_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("imdb_id must not be empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(AppError::InvalidRequest("title must not be empty".into()));
        }

        match self.kind {
            ItemKind::Movie => {
                if !self.seasons.is_empty() {
                    return Err(AppError::InvalidRequest(
                        "a movie request cannot list seasons".into(),
                    ));
                }
                Ok(vec![Item::movie(self.imdb_id, self.title, self.year)])
            }
            ItemKind::Show => {
                if self.seasons.iter().all(|s| s.episodes.is_empty()) {
                    return Err(AppError::InvalidRequest(
                        "a show request needs at least one episode".into(),
                    ));
                }
                let show = Item::show(self.imdb_id, self.title, self.year);
                let mut items = vec![show.clone()];
                for season_req in self.seasons.iter().filter(|s| !s.episodes.is_empty()) {
                    let season = Item::season(&show, season_req.number);
                    let episodes: Vec<Item> = season_req
                        .episodes
                        .iter()
                        .map(|&n| Item::episode(&season, n))
                        .collect();
                    items.push(season);
                    items.extend(episodes);
                }
                Ok(items)
            }
            other => Err(AppError::InvalidRequest(format!(
                "cannot request a {other} directly; request its show"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_roundtrip_through_serde() {
        let json = serde_json::to_string(&ItemState::ScrapedNotFound).unwrap();
        assert_eq!(json, "\"SCRAPED_NOT_FOUND\"");
        for state in ItemState::ALL {
            let parsed: ItemState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert_eq!(
            "library-ongoing".parse::<ItemState>().unwrap(),
            ItemState::LibraryOngoing
        );
        assert!("DONE".parse::<ItemState>().is_err());
    }

    #[test]
    fn test_child_ids_and_titles() {
        let show = Item::show("tt0903747", "Breaking Bad", Some(2008));
        let season = Item::season(&show, 1);
        let episode = Item::episode(&season, 2);

        assert_eq!(season.id, "tt0903747:s1");
        assert_eq!(episode.id, "tt0903747:s1e2");
        assert_eq!(episode.parent.as_deref(), Some("tt0903747:s1"));
        assert_eq!(episode.imdb_id.as_deref(), Some("tt0903747"));
        assert_eq!(episode.display_title(), "Breaking Bad S01E02");
        assert_eq!(season.display_title(), "Breaking Bad S01");
    }

    #[test]
    fn test_movie_request_expands_to_single_item() {
        let items = MediaRequest::movie("tt0111161", "The Shawshank Redemption", Some(1994))
            .into_items()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].state, ItemState::Content);
        assert_eq!(items[0].display_title(), "The Shawshank Redemption (1994)");
    }

    #[test]
    fn test_show_request_expands_parents_first() {
        let items = MediaRequest::show("tt0903747", "Breaking Bad", Some(2008))
            .with_season(1, [1, 2])
            .with_season(2, [])
            .into_items()
            .unwrap();
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["tt0903747", "tt0903747:s1", "tt0903747:s1e1", "tt0903747:s1e2"]
        );
    }

    #[test]
    fn test_invalid_requests_are_rejected() {
        assert!(
            MediaRequest::show("tt1", "Empty", None)
                .into_items()
                .is_err()
        );
        assert!(
            MediaRequest::movie("tt1", "Movie", None)
                .with_season(1, [1])
                .into_items()
                .is_err()
        );
        assert!(MediaRequest::movie(" ", "Movie", None).into_items().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let show = Item::show("tt1", "Show", None);
        let season = Item::season(&show, 1);
        let filter = ItemFilter::children_of("tt1").with_states([ItemState::Content]);
        assert!(filter.matches(&season));
        assert!(!filter.matches(&show));
        assert!(ItemFilter::all().with_kind(ItemKind::Show).matches(&show));
    }

    #[test]
    fn test_error_classification_text() {
        let err = ItemError::new(ErrorKind::Exhausted, Stage::Download, "quota");
        assert_eq!(err.classification(), "retries exhausted while downloading");
    }
}
