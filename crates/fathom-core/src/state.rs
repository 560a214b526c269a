//! Item state machine: legal edges, field invariants tied to state, retry
//! re-entry, and the rollup fold that derives composite states.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorKind};
use crate::item::{Item, ItemError, ItemState};

/// Processing stage an item can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scrape,
    Download,
    Reconcile,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Scrape, Stage::Download, Stage::Reconcile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Download => "download",
            Stage::Reconcile => "reconcile",
        }
    }

    pub(crate) fn gerund(&self) -> &'static str {
        match self {
            Stage::Scrape => "scraping",
            Stage::Download => "downloading",
            Stage::Reconcile => "reconciling",
        }
    }

    /// State an item occupies while waiting for this stage.
    pub fn entry_state(&self) -> ItemState {
        match self {
            Stage::Scrape => ItemState::Content,
            Stage::Download => ItemState::Scraped,
            Stage::Reconcile => ItemState::Downloading,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ItemState {
    /// Legal edges for movies and episodes. Self-edges are always allowed.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;

        if self == next || next == Error {
            return true;
        }
        match self {
            Unknown => next == Content,
            Content => matches!(next, Scraped | ScrapedNotFound),
            Scraped => matches!(next, ScrapedNotFound | Downloading | Content),
            ScrapedNotFound => matches!(next, Scraped | Content),
            Downloading => matches!(next, Library | LibraryOngoing | LibraryMetadata | Content),
            LibraryOngoing => matches!(next, Library | LibraryMetadata),
            LibraryMetadata => matches!(next, Library | LibraryOngoing),
            Library => false,
            Error => matches!(next, Content | Scraped | Downloading),
            PartiallyScraped | PartiallyDownloading => false,
        }
    }
}

impl Item {
    /// Moves the item to `next` after a successful stage.
    ///
    /// Enforces the leaf transition table, drops `chosen_release` outside the
    /// states that may carry it, and clears failure bookkeeping.
    pub fn transition(&mut self, next: ItemState) -> Result<(), AppError> {
        if next == ItemState::Error {
            return Err(AppError::InvalidRequest(
                "use Item::fail to park an item in ERROR".into(),
            ));
        }
        if !self.is_composite() && !self.state.can_transition_to(next) {
            return Err(AppError::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        if matches!(
            next,
            ItemState::PartiallyScraped | ItemState::PartiallyDownloading
        ) && !self.is_composite()
        {
            return Err(AppError::IllegalTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        if !next.allows_chosen_release() {
            self.chosen_release = None;
        }
        self.clear_failure();
        self.touch();
        Ok(())
    }

    /// Resets failure bookkeeping after a stage succeeded without changing state.
    pub fn clear_failure(&mut self) {
        self.last_error = None;
        self.attempts = 0;
        self.next_attempt_at = None;
    }

    /// Parks the item in ERROR with the given classification.
    pub fn fail(&mut self, error: ItemError) {
        self.state = ItemState::Error;
        self.chosen_release = None;
        self.next_attempt_at = None;
        self.last_error = Some(error);
        self.touch();
    }

    /// Pre-selects a candidate. Only legal in states that may carry one.
    pub fn choose(&mut self, candidate: crate::item::Candidate) -> Result<(), AppError> {
        if !self.state.allows_chosen_release() {
            return Err(AppError::InvalidRequest(format!(
                "cannot choose a release for {} in {}",
                self.id, self.state
            )));
        }
        self.chosen_release = Some(candidate);
        self.touch();
        Ok(())
    }

    /// State this item counts as for rollup purposes.
    ///
    /// ERROR children count as the state they failed from.
    pub fn effective_state(&self) -> ItemState {
        match (self.state, &self.last_error) {
            (ItemState::Error, Some(err)) => err.stage.entry_state(),
            (ItemState::Error, None) => ItemState::Content,
            (state, _) => state,
        }
    }

    /// Re-enters the stage that failed, or rescrapes a not-found item.
    ///
    /// Returns the state the item was moved to.
    pub fn prepare_retry(&mut self) -> Result<ItemState, AppError> {
        let stage = match self.state {
            ItemState::Error => self
                .last_error
                .as_ref()
                .map(|e| e.stage)
                .unwrap_or(Stage::Scrape),
            ItemState::ScrapedNotFound => Stage::Scrape,
            other => {
                return Err(AppError::InvalidRequest(format!(
                    "only ERROR or SCRAPED_NOT_FOUND items can be retried (item is {other})"
                )));
            }
        };
        if self.is_composite() {
            return Err(AppError::InvalidRequest(format!(
                "{} is a {}; retry its episodes instead",
                self.id, self.kind
            )));
        }

        let target = match stage {
            Stage::Download if self.candidates.is_empty() => ItemState::Content,
            Stage::Reconcile if self.download.is_none() => ItemState::Content,
            stage => stage.entry_state(),
        };

        self.state = target;
        self.clear_failure();
        self.release_retries = 0;
        match target {
            ItemState::Scraped => {
                let excluded = &self.excluded_releases;
                self.chosen_release = self
                    .candidates
                    .iter()
                    .find(|c| !excluded.contains(&c.release_id))
                    .cloned();
                if self.chosen_release.is_none() {
                    self.state = ItemState::Content;
                }
            }
            ItemState::Downloading => {
                self.chosen_release = self.download.as_ref().map(|d| d.release.clone());
            }
            _ => {
                self.chosen_release = None;
                self.download = None;
            }
        }
        self.updated_at = Utc::now();
        Ok(self.state)
    }
}

/// Derives a composite's state from its children.
///
/// ERROR children count as the state they failed from and UNKNOWN children
/// are ignored. Identical children yield their shared state; an all-library
/// mix yields LIBRARY_ONGOING if any child is ongoing, else
/// LIBRARY_METADATA. Otherwise the furthest progress wins:
/// PARTIALLY_DOWNLOADING, then PARTIALLY_SCRAPED, then CONTENT.
pub fn rollup<'a>(children: impl IntoIterator<Item = &'a Item>) -> ItemState {
    let states: Vec<ItemState> = children
        .into_iter()
        .map(Item::effective_state)
        .filter(|s| *s != ItemState::Unknown)
        .collect();

    let Some(&first) = states.first() else {
        return ItemState::Unknown;
    };
    if states.iter().all(|s| *s == first) {
        return first;
    }
    if states.iter().all(ItemState::is_library) {
        return if states.contains(&ItemState::LibraryOngoing) {
            ItemState::LibraryOngoing
        } else {
            ItemState::LibraryMetadata
        };
    }
    if states.iter().any(ItemState::is_download_or_later) {
        return ItemState::PartiallyDownloading;
    }
    if states
        .iter()
        .any(|s| matches!(s, ItemState::Scraped | ItemState::PartiallyScraped))
    {
        return ItemState::PartiallyScraped;
    }
    ItemState::Content
}

/// Marks an item as exhausted for `stage` after its retry budget ran out.
pub fn exhausted(stage: Stage, last: &AppError, attempts: u32) -> ItemError {
    ItemError::new(
        ErrorKind::Exhausted,
        stage,
        format!("gave up after {attempts} attempts: {last}"),
    )
}
