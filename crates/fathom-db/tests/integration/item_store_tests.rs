use fathom_core::error::AppError;
use fathom_core::item::{Item, ItemFilter, ItemKind, ItemState, MediaRequest};
use fathom_core::store::{ItemStore, collect_items};
use fathom_core::testutil::{make_candidate, make_movie};

use crate::integration::common::setup_test_db;

#[tokio::test]
#[ignore = "requires Docker"]
async fn insert_and_get_round_trips_the_record() {
    let (repo, _container) = setup_test_db().await;

    let mut movie = make_movie("tt0133093");
    movie.candidates = vec![make_candidate("aaa", 10)];
    assert!(repo.insert_new(&movie).await.unwrap());
    assert!(!repo.insert_new(&movie).await.unwrap());

    let stored = repo.get("tt0133093").await.unwrap().unwrap();
    assert_eq!(stored.title, "The Matrix");
    assert_eq!(stored.kind, ItemKind::Movie);
    assert_eq!(stored.state, ItemState::Content);
    assert_eq!(stored.candidates.len(), 1);
    assert_eq!(stored.revision, 0);

    assert!(repo.get("tt-missing").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn upsert_bumps_revision_of_existing_rows() {
    let (repo, _container) = setup_test_db().await;

    let movie = make_movie("tt1");
    let first = repo.upsert(&movie).await.unwrap();
    assert_eq!(first.revision, 0);

    let second = repo.upsert(&first).await.unwrap();
    assert_eq!(second.revision, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cas_state_moves_only_from_expected_state() {
    let (repo, _container) = setup_test_db().await;
    repo.insert_new(&make_movie("tt1")).await.unwrap();

    let moved = repo
        .cas_state("tt1", ItemState::Content, ItemState::ScrapedNotFound)
        .await
        .unwrap();
    assert_eq!(moved.state, ItemState::ScrapedNotFound);
    assert_eq!(moved.revision, 1);

    let err = repo
        .cas_state("tt1", ItemState::Content, ItemState::Scraped)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::Conflict { actual: ItemState::ScrapedNotFound, .. }
    ));

    let reloaded = repo.get("tt1").await.unwrap().unwrap();
    assert_eq!(reloaded.state, ItemState::ScrapedNotFound);

    let missing = repo
        .cas_state("tt-missing", ItemState::Content, ItemState::Scraped)
        .await
        .unwrap_err();
    assert!(matches!(missing, AppError::ItemNotFound(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn cas_update_rejects_stale_revisions() {
    let (repo, _container) = setup_test_db().await;
    repo.insert_new(&make_movie("tt1")).await.unwrap();

    let read = repo.get("tt1").await.unwrap().unwrap();
    let mut winner = read.clone();
    winner.state = ItemState::Scraped;
    winner.chosen_release = Some(make_candidate("aaa", 10));
    let committed = repo.cas_update(&winner, ItemState::Content).await.unwrap();
    assert_eq!(committed.revision, 1);

    // Same state, stale revision.
    let mut loser = read.clone();
    loser.attempts = 3;
    let err = repo
        .cas_update(&loser, ItemState::Content)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict { .. }));

    let stored = repo.get("tt1").await.unwrap().unwrap();
    assert_eq!(stored.state, ItemState::Scraped);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.chosen_release.unwrap().release_id, "aaa");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_cas_has_exactly_one_winner() {
    let (repo, _container) = setup_test_db().await;
    repo.insert_new(&make_movie("tt1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.cas_state("tt1", ItemState::Content, ItemState::Scraped)
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn listing_pages_filters_and_sees_new_writes() {
    let (repo, _container) = setup_test_db().await;

    let items: Vec<Item> = MediaRequest::show("tt0903747", "Breaking Bad", Some(2008))
        .with_season(1, 1..=3)
        .into_items()
        .unwrap();
    for item in &items {
        repo.insert_new(item).await.unwrap();
    }
    repo.insert_new(&make_movie("tt0133093")).await.unwrap();

    let all = collect_items(&repo, ItemFilter::all()).await.unwrap();
    assert_eq!(all.len(), items.len() + 1);
    let ids: Vec<&str> = all.iter().map(|i| i.id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let page = repo.list_page(&ItemFilter::all(), None, 2).await.unwrap();
    assert_eq!(page.len(), 2);
    let next = repo
        .list_page(&ItemFilter::all(), Some(&page[1].id), 100)
        .await
        .unwrap();
    assert_eq!(next.len(), all.len() - 2);

    let season_id = items
        .iter()
        .find(|i| i.kind == ItemKind::Season)
        .map(|i| i.id.clone())
        .unwrap();
    let episodes = collect_items(&repo, ItemFilter::children_of(&season_id))
        .await
        .unwrap();
    assert_eq!(episodes.len(), 3);

    repo.cas_state("tt0133093", ItemState::Content, ItemState::ScrapedNotFound)
        .await
        .unwrap();
    let not_found = collect_items(
        &repo,
        ItemFilter::all().with_states([ItemState::ScrapedNotFound]),
    )
    .await
    .unwrap();
    assert_eq!(not_found.len(), 1);
    assert_eq!(not_found[0].id, "tt0133093");
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn remove_returns_the_deleted_record() {
    let (repo, _container) = setup_test_db().await;
    repo.insert_new(&make_movie("tt1")).await.unwrap();

    let removed = repo.remove("tt1").await.unwrap().unwrap();
    assert_eq!(removed.id, "tt1");
    assert!(repo.remove("tt1").await.unwrap().is_none());
}
