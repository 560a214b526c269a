//! Scraper orchestration: fan-out, aggregation, and ranking.
//!
//! A search goes to every healthy scraper at once. Each call is throttled,
//! bounded by the adapter timeout, and guarded by the service's circuit
//! breaker; a scraper that fails is recorded and left out, and only when
//! every scraper failed does the search itself fail.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterKind, RawRelease, ScraperEntry, SearchQuery, bounded};
use crate::error::AppError;
use crate::health::HealthGate;
use crate::item::{Candidate, Item, ItemState};
use crate::release::{ParserSettings, evaluate, quality_score};
use crate::retry::RescrapePolicy;
use crate::throttle::Throttle;

/// What a fan-out produced, including who failed to answer.
#[derive(Debug, Clone, Default)]
pub struct ScrapeReport {
    /// Ranked, deduplicated candidates.
    pub candidates: Vec<Candidate>,
    /// Scrapers that answered, even with nothing.
    pub answered: Vec<String>,
    /// Scrapers skipped as unhealthy or whose call failed, with the reason.
    pub unreachable: Vec<(String, String)>,
    /// Releases dropped by the parser or the exclusion list.
    pub rejected: usize,
}

impl ScrapeReport {
    pub fn unreachable_names(&self) -> Vec<String> {
        self.unreachable.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Searches every configured scraper and ranks what comes back.
#[derive(Clone)]
pub struct ScrapeOrchestrator {
    health: HealthGate,
    throttle: Throttle,
    timeout: Duration,
    parser: ParserSettings,
    rescrape: RescrapePolicy,
}

impl ScrapeOrchestrator {
    pub fn new(
        health: HealthGate,
        throttle: Throttle,
        timeout: Duration,
        parser: ParserSettings,
        rescrape: RescrapePolicy,
    ) -> Self {
        Self {
            health,
            throttle,
            timeout,
            parser,
            rescrape,
        }
    }

    /// Fans `query` out and returns ranked candidates.
    ///
    /// Fails with [`AppError::NoScraperReachable`] only when no scraper
    /// answered at all; an empty answer is a valid result.
    pub async fn search(
        &self,
        scrapers: &[ScraperEntry],
        query: &SearchQuery,
        excluded: &[String],
        cancel: &CancellationToken,
    ) -> Result<ScrapeReport, AppError> {
        if scrapers.is_empty() {
            return Err(AppError::NotConfigured("scraper"));
        }

        let calls = scrapers.iter().map(|entry| self.call_scraper(entry, query, cancel));
        let results = join_all(calls).await;

        let mut report = ScrapeReport::default();
        let mut found: Vec<Candidate> = Vec::new();
        let mut seen_order = 0u32;

        // Configuration order, then release order: a stable notion of "seen first".
        for (entry, result) in scrapers.iter().zip(results) {
            let releases = match result {
                Ok(releases) => releases,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    tracing::warn!(service = entry.name(), error = %e, "Scraper failed");
                    report.unreachable.push((entry.name().to_string(), e.to_string()));
                    continue;
                }
            };
            report.answered.push(entry.name().to_string());
            tracing::debug!(
                service = entry.name(),
                releases = releases.len(),
                "Scraper answered"
            );

            for raw in releases {
                seen_order += 1;
                match self.to_candidate(entry, &raw, query, excluded, seen_order) {
                    Some(candidate) => found.push(candidate),
                    None => report.rejected += 1,
                }
            }
        }

        if report.answered.is_empty() {
            return Err(AppError::NoScraperReachable(report.unreachable_names()));
        }

        let mut candidates = merge_candidates(found);
        rank(&mut candidates);
        report.candidates = candidates;
        Ok(report)
    }

    async fn call_scraper(
        &self,
        entry: &ScraperEntry,
        query: &SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRelease>, AppError> {
        let adapter = AdapterKind::Scraper(entry.adapter.clone());
        if !self.health.is_healthy(&adapter).await {
            let reason = match self.health.cached(entry.name()).await {
                Some(status) if !status.is_ok() => status.to_string(),
                _ => "circuit open".to_string(),
            };
            return Err(AppError::ServiceUnavailable(reason));
        }

        if let Some(interval) = entry.min_interval {
            tokio::select! {
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                () = self.throttle.wait(entry.name(), interval) => {}
            }
        }

        self.health
            .breaker(entry.name())
            .call(|| bounded(self.timeout, cancel, entry.adapter.search(query)))
            .await
            .map_err(|e| e.into_app_error())
    }

    fn to_candidate(
        &self,
        entry: &ScraperEntry,
        raw: &RawRelease,
        query: &SearchQuery,
        excluded: &[String],
        seen_order: u32,
    ) -> Option<Candidate> {
        if excluded.contains(&raw.info_hash) {
            return None;
        }
        let parsed = match evaluate(raw, query, &self.parser) {
            Ok(parsed) => parsed,
            Err(reason) => {
                tracing::trace!(release = %raw.title, %reason, "Release rejected");
                return None;
            }
        };
        Some(Candidate {
            release_id: raw.info_hash.clone(),
            title: raw.title.clone(),
            signature: parsed.signature(),
            score: quality_score(&parsed, raw.seeders, &self.parser),
            adapter: entry.name().to_string(),
            trust: entry.trust,
            sources: vec![entry.name().to_string()],
            resolution: parsed.resolution,
            seeders: raw.seeders,
            size_bytes: raw.size_bytes,
            published_at: raw.published_at,
            seen_order,
        })
    }

    /// Scrapes `item` and returns the updated record (not yet persisted).
    ///
    /// Leaves move to SCRAPED with the best candidate chosen, or to
    /// SCRAPED_NOT_FOUND with a rescrape scheduled. Composites only collect
    /// candidates; their state follows from their children.
    pub async fn scrape(
        &self,
        item: &Item,
        scrapers: &[ScraperEntry],
        cancel: &CancellationToken,
    ) -> Result<(Item, ScrapeReport), AppError> {
        let query = SearchQuery::for_item(item);
        let report = self
            .search(scrapers, &query, &item.excluded_releases, cancel)
            .await?;

        let mut next = item.clone();
        next.scrape_attempts += 1;
        next.candidates = report.candidates.clone();

        if next.is_composite() {
            next.clear_failure();
            next.touch();
            return Ok((next, report));
        }

        match next.candidates.first().cloned() {
            Some(best) => {
                next.transition(ItemState::Scraped)?;
                next.choose(best)?;
            }
            None => {
                next.transition(ItemState::ScrapedNotFound)?;
                let delay = self.rescrape.delay_for(next.scrape_attempts);
                next.next_attempt_at = Some(Utc::now() + delay);
            }
        }
        Ok((next, report))
    }

    /// Delay before the next automatic rescrape after `attempts` empty scrapes.
    pub fn rescrape_delay(&self, attempts: u32) -> Duration {
        self.rescrape.delay_for(attempts)
    }
}

/// Gives an unresolved episode the season pack found for its season.
///
/// Returns `Ok(false)` when the episode has already moved past scraping or
/// every pack candidate is excluded for it.
pub fn apply_pack(episode: &mut Item, pack: &[Candidate]) -> Result<bool, AppError> {
    if !matches!(
        episode.state,
        ItemState::Content | ItemState::ScrapedNotFound
    ) {
        return Ok(false);
    }
    let usable: Vec<Candidate> = pack
        .iter()
        .filter(|c| !episode.excluded_releases.contains(&c.release_id))
        .cloned()
        .collect();
    let Some(best) = usable.first().cloned() else {
        return Ok(false);
    };
    episode.candidates = usable;
    episode.transition(ItemState::Scraped)?;
    episode.choose(best)?;
    Ok(true)
}

/// Collapses duplicates by signature or release id.
///
/// The higher-scoring copy wins (then higher trust, then earlier seen); the
/// survivor records every adapter that reported it and the earliest sighting.
pub fn merge_candidates(found: Vec<Candidate>) -> Vec<Candidate> {
    let mut merged: Vec<Candidate> = Vec::with_capacity(found.len());
    let mut by_signature: HashMap<String, usize> = HashMap::new();
    let mut by_release: HashMap<String, usize> = HashMap::new();

    for candidate in found {
        let existing = by_signature
            .get(&candidate.signature)
            .or_else(|| by_release.get(&candidate.release_id))
            .copied();

        let Some(idx) = existing else {
            by_signature.insert(candidate.signature.clone(), merged.len());
            by_release.insert(candidate.release_id.clone(), merged.len());
            merged.push(candidate);
            continue;
        };

        let current = &mut merged[idx];
        let mut sources = current.sources.clone();
        for source in &candidate.sources {
            if !sources.contains(source) {
                sources.push(source.clone());
            }
        }
        let earliest = current.seen_order.min(candidate.seen_order);
        by_signature.insert(candidate.signature.clone(), idx);
        by_release.insert(candidate.release_id.clone(), idx);
        let replaces = (candidate.score, candidate.trust) > (current.score, current.trust);
        if replaces {
            *current = candidate;
        }
        current.sources = sources;
        current.seen_order = earliest;
    }
    merged
}

/// Orders candidates best first: score, trust, recency, then first seen.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(compare_candidates);
}

fn compare_candidates(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| b.trust.cmp(&a.trust))
        .then_with(|| match (a.published_at, b.published_at) {
            (Some(x), Some(y)) => y.cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.seen_order.cmp(&b.seen_order))
}
