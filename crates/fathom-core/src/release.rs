//! Release-name parsing, filtering, and quality scoring.
//!
//! Release names are free text ("Dune.Part.Two.2024.2160p.WEB-DL.x265-FLUX").
//! The parser extracts only what ranking and filtering need.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::{RawRelease, SearchQuery};
use crate::item::ItemKind;

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "sd")]
    Sd,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "2160p")]
    P2160,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Unknown => "unknown",
            Resolution::Sd => "sd",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P2160 => "2160p",
        }
    }

    fn tier(&self, highest_quality: bool) -> u32 {
        match (self, highest_quality) {
            (Resolution::P2160, true) => 5,
            (Resolution::P1080, true) => 4,
            // 1080p is the default sweet spot; 4K only wins when asked for.
            (Resolution::P1080, false) => 5,
            (Resolution::P2160, false) => 4,
            (Resolution::P720, _) => 3,
            (Resolution::Sd, _) => 2,
            (Resolution::Unknown, _) => 1,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Origin of the encode, best last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Cam,
    Telesync,
    Screener,
    Unknown,
    Hdtv,
    WebRip,
    WebDl,
    BluRay,
    Remux,
}

impl Source {
    /// Theatre recordings and pre-release copies nobody wants.
    pub fn is_unwanted(&self) -> bool {
        matches!(self, Source::Cam | Source::Telesync | Source::Screener)
    }

    fn tier(&self) -> u32 {
        match self {
            Source::Cam | Source::Telesync | Source::Screener => 0,
            Source::Unknown => 1,
            Source::Hdtv => 2,
            Source::WebRip => 3,
            Source::WebDl => 4,
            Source::BluRay => 5,
            Source::Remux => 6,
        }
    }
}

/// User preferences that shape filtering and scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    pub include_4k: bool,
    pub highest_quality: bool,
    pub repack_proper: bool,
    /// Accepted audio languages; empty accepts everything.
    pub languages: Vec<String>,
    /// Minimum token overlap between requested and parsed titles.
    pub title_match_ratio: f64,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            include_4k: false,
            highest_quality: false,
            repack_proper: true,
            languages: vec!["english".to_string()],
            title_match_ratio: 0.75,
        }
    }
}

/// Structured view of a release name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRelease {
    pub title: String,
    pub year: Option<i32>,
    pub resolution: Resolution,
    pub source: Source,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub group: Option<String>,
    pub proper: bool,
    pub language: Option<String>,
}

static YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid regex"));
static RESOLUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(2160p|4k|uhd|1080p|1080i|720p|576p|480p|sd)\b").expect("valid regex")
});
static SEASON_EPISODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bS(\d{1,2})(?:\s?E(\d{1,3}))?\b|\bSeason\s?(\d{1,2})\b").expect("valid regex")
});
static GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-([A-Za-z0-9]+)(?:\.(?:mkv|mp4|avi))?\s*(?:\[[^\]]*\])?\s*$").expect("valid regex")
});
static PROPER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(proper|repack)\b").expect("valid regex"));
static LANGUAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(multi|truefrench|french|german|ita|italian|spanish|latino|russian|hindi|japanese|korean)\b")
        .expect("valid regex")
});
static SOURCES: LazyLock<Vec<(Source, Regex)>> = LazyLock::new(|| {
    [
        (Source::Remux, r"(?i)\bremux\b"),
        (Source::BluRay, r"(?i)\b(blu-?ray|bdrip|brrip|bdremux)\b"),
        (Source::WebDl, r"(?i)\bweb-?dl\b"),
        (Source::WebRip, r"(?i)\b(web-?rip|web)\b"),
        (Source::Hdtv, r"(?i)\b(hdtv|pdtv)\b"),
        (Source::Screener, r"(?i)\b(screener|dvdscr|bdscr|scr)\b"),
        (Source::Telesync, r"(?i)\b(ts|hdts|telesync|tc|telecine)\b"),
        (Source::Cam, r"(?i)\b(cam|hdcam|camrip)\b"),
    ]
    .into_iter()
    .map(|(source, pattern)| (source, Regex::new(pattern).expect("valid regex")))
    .collect()
});

impl ParsedRelease {
    pub fn parse(name: &str) -> Self {
        let spaced: String = name
            .chars()
            .map(|c| if c == '.' || c == '_' { ' ' } else { c })
            .collect();

        let resolution_match = RESOLUTION.find(&spaced);
        let resolution = match resolution_match.map(|m| m.as_str().to_lowercase()) {
            Some(r) if r == "2160p" || r == "4k" || r == "uhd" => Resolution::P2160,
            Some(r) if r.starts_with("1080") => Resolution::P1080,
            Some(r) if r == "720p" => Resolution::P720,
            Some(_) => Resolution::Sd,
            None => Resolution::Unknown,
        };

        let (season, episode, se_start) = match SEASON_EPISODE.captures(&spaced) {
            Some(caps) => {
                let season = caps
                    .get(1)
                    .or_else(|| caps.get(3))
                    .and_then(|m| m.as_str().parse().ok());
                let episode = caps.get(2).and_then(|m| m.as_str().parse().ok());
                (season, episode, caps.get(0).map(|m| m.start()))
            }
            None => (None, None, None),
        };

        // A year at the very start is part of the title ("2001 A Space Odyssey").
        let year_match = YEAR.find_iter(&spaced).find(|m| m.start() > 0);
        let year = year_match.and_then(|m| m.as_str().parse().ok());

        let cut = [
            year_match.map(|m| m.start()),
            se_start,
            resolution_match.map(|m| m.start()),
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(spaced.len());
        let title = normalize_title(&spaced[..cut]);

        let source = SOURCES
            .iter()
            .find(|(_, re)| re.is_match(&spaced))
            .map(|(source, _)| *source)
            .unwrap_or(Source::Unknown);

        let group = GROUP
            .captures(name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string());

        Self {
            title,
            year,
            resolution,
            source,
            season,
            episode,
            group,
            proper: PROPER.is_match(&spaced),
            language: LANGUAGE
                .find(&spaced)
                .map(|m| m.as_str().to_lowercase()),
        }
    }

    /// Normalized identity used to collapse the same release seen by several
    /// scrapers under different hashes or cosmetic name variations.
    pub fn signature(&self) -> String {
        let key = format!(
            "{}|{}|{}|{}|{}|{}",
            self.title,
            self.year.map(|y| y.to_string()).unwrap_or_default(),
            self.resolution,
            self.season.map(|s| s.to_string()).unwrap_or_default(),
            self.episode.map(|e| e.to_string()).unwrap_or_default(),
            self.group.as_deref().unwrap_or("").to_lowercase(),
        );
        compute_hash(&key)[..16].to_string()
    }
}

/// Lowercase alphanumeric words separated by single spaces.
pub fn normalize_title(raw: &str) -> String {
    raw.to_lowercase()
        .replace('&', " and ")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Token overlap between two titles in `[0, 1]`.
pub fn title_similarity(requested: &str, parsed: &str) -> f64 {
    let a: Vec<String> = normalize_title(requested)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let b: Vec<String> = normalize_title(parsed)
        .split(' ')
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let common = a.iter().filter(|w| b.contains(w)).count();
    common as f64 / a.len().max(b.len()) as f64
}

/// Why a release was dropped before ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    UnwantedQuality,
    FourK,
    TitleMismatch,
    WrongYear,
    WrongEpisode,
    Language,
    MissingHash,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::UnwantedQuality => "unwanted quality",
            Rejection::FourK => "4k disabled",
            Rejection::TitleMismatch => "title mismatch",
            Rejection::WrongYear => "wrong year",
            Rejection::WrongEpisode => "wrong season or episode",
            Rejection::Language => "unwanted language",
            Rejection::MissingHash => "missing infohash",
        };
        write!(f, "{reason}")
    }
}

/// Parses a raw release and checks it against the query and preferences.
pub fn evaluate(
    raw: &RawRelease,
    query: &SearchQuery,
    settings: &ParserSettings,
) -> Result<ParsedRelease, Rejection> {
    if raw.info_hash.trim().is_empty() {
        return Err(Rejection::MissingHash);
    }
    let parsed = ParsedRelease::parse(&raw.title);

    if parsed.source.is_unwanted() {
        return Err(Rejection::UnwantedQuality);
    }
    if parsed.resolution == Resolution::P2160 && !settings.include_4k {
        return Err(Rejection::FourK);
    }
    if title_similarity(&query.title, &parsed.title) < settings.title_match_ratio {
        return Err(Rejection::TitleMismatch);
    }
    if let Some(lang) = &parsed.language
        && lang != "multi"
        && !settings.languages.is_empty()
        && !settings.languages.iter().any(|l| l.eq_ignore_ascii_case(lang))
    {
        return Err(Rejection::Language);
    }

    match query.kind {
        ItemKind::Movie => {
            if parsed.season.is_some() {
                return Err(Rejection::WrongEpisode);
            }
            if let (Some(want), Some(got)) = (query.year, parsed.year)
                && (want - got).abs() > 1
            {
                return Err(Rejection::WrongYear);
            }
        }
        ItemKind::Season => {
            if parsed.season != query.season || parsed.episode.is_some() {
                return Err(Rejection::WrongEpisode);
            }
        }
        ItemKind::Episode => {
            let season_ok = parsed.season.is_none_or(|s| Some(s) == query.season);
            let episode_ok = parsed.episode.is_none_or(|e| Some(e) == query.episode);
            if !season_ok || !episode_ok {
                return Err(Rejection::WrongEpisode);
            }
        }
        ItemKind::Show => {}
    }

    Ok(parsed)
}

/// Bucket seeders into `0..=9` so health nudges but never overrides quality.
pub fn health_bucket(seeders: Option<u32>) -> u32 {
    match seeders.unwrap_or(0) {
        0 => 0,
        1..=4 => 2,
        5..=19 => 4,
        20..=99 => 6,
        100..=499 => 8,
        _ => 9,
    }
}

/// Quality score: resolution dominates, then source, then seed health.
pub fn quality_score(parsed: &ParsedRelease, seeders: Option<u32>, settings: &ParserSettings) -> u32 {
    let proper = u32::from(parsed.proper && settings.repack_proper);
    parsed.resolution.tier(settings.highest_quality) * 1000
        + parsed.source.tier() * 100
        + health_bucket(seeders) * 10
        + proper
}
