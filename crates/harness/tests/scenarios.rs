use std::time::Duration;

use marksync_core::{SubjectIdentity, feed::FeedEvent};
use marksync_engine::{EmptyReason, SyncError, annotate};
use marksync_harness::{TestBackend, TestClient, eventually, init_tracing};

type TestResult = Result<(), Box<dyn std::error::Error>>;

// ============================================================================
// Create, search, delete, stale fetch
// ============================================================================

#[tokio::test]
async fn add_to_empty_store_then_feed_insert() -> TestResult {
    init_tracing();
    let backend = TestBackend::new()?;
    let client = TestClient::start(&backend, SubjectIdentity::generate());
    let initial = client.sign_in_and_wait().await?;
    assert_eq!(initial.total_count, 0);
    assert_eq!(initial.empty, Some(EmptyReason::NoBookmarks));

    let record = client
        .handle
        .add_bookmark("Example", "https://example.com")
        .await?;

    // Optimistic insert is visible as soon as the dispatch resolves
    let view = client.view();
    assert_eq!(view.ids(), vec![record.id]);

    // The feed Insert for the same id lands before this command is served
    let snapshot = client.handle.snapshot().await?;
    assert_eq!(snapshot, vec![record.clone()]);

    let view = client.view();
    assert_eq!(view.bookmarks.len(), 1);
    assert_eq!(view.total_count, 1);
    assert_eq!(view.empty, None);
    let shown = &view.bookmarks[0];
    assert_eq!(shown.record.title, "Example");
    assert_eq!((shown.icon, shown.color), annotate("https://example.com"));

    client.stop().await
}

#[tokio::test]
async fn search_filters_case_insensitively() -> TestResult {
    init_tracing();
    let backend = TestBackend::new()?;
    let identity = SubjectIdentity::generate();
    backend.insert_as(&identity, "GitHub", "https://github.com").await?;
    backend.insert_as(&identity, "Example", "https://example.com").await?;

    let client = TestClient::start(&backend, identity);
    let view = client.sign_in_and_wait().await?;
    assert_eq!(view.bookmarks.len(), 2);
    assert_eq!(view.bookmarks[0].record.title, "Example");

    client.handle.set_search_query("git").await?;
    let view = client.view();
    assert_eq!(view.search_query, "git");
    assert_eq!(view.bookmarks.len(), 1);
    assert_eq!(view.bookmarks[0].record.title, "GitHub");
    assert_eq!(view.total_count, 2);

    client.handle.set_search_query("NOPE").await?;
    assert_eq!(client.view().empty, Some(EmptyReason::NoMatches));

    client.handle.set_search_query("").await?;
    assert_eq!(client.view().bookmarks.len(), 2);

    client.stop().await
}

#[tokio::test]
async fn delete_confirms_by_reload_and_ignores_late_events() -> TestResult {
    init_tracing();
    let backend = TestBackend::new()?;
    let identity = SubjectIdentity::generate();
    let first = backend.insert_as(&identity, "One", "https://one.example").await?;
    let second = backend.insert_as(&identity, "Two", "https://two.example").await?;

    let client = TestClient::start(&backend, identity);
    let view = client.sign_in_and_wait().await?;
    assert_eq!(view.ids(), vec![second.id, first.id]);
    let queries_before = backend.remote().query_count();

    client.handle.delete_bookmark(first.id).await?;
    assert_eq!(client.view().ids(), vec![second.id]);
    assert_eq!(backend.remote().query_count(), queries_before + 1);

    // Late or replayed events for the deleted id change nothing
    let owner = client.subject_id();
    backend.push(owner, &FeedEvent::Delete { id: first.id })?;
    backend.push(owner, &FeedEvent::Insert(first.clone()))?;
    let snapshot = client.handle.snapshot().await?;
    assert_eq!(snapshot, vec![second.clone()]);
    assert_eq!(client.view().ids(), vec![second.id]);

    client.stop().await
}

#[tokio::test]
async fn fetch_resolving_after_sign_out_is_discarded() -> TestResult {
    init_tracing();
    let backend = TestBackend::new()?;
    let identity = SubjectIdentity::generate();
    backend.insert_as(&identity, "Kept remote", "https://remote.example").await?;

    let client = TestClient::start(&backend, identity);
    backend.remote().hold_queries();
    client.sign_in()?;
    eventually(|| backend.remote().held() == 1).await?;

    let reload = {
        let handle = client.handle.clone();
        tokio::spawn(async move { handle.reload().await })
    };
    eventually(|| backend.remote().held() == 2).await?;

    client.session.sign_out();
    client.wait_for(|state| state.subject.is_none()).await?;
    backend.remote().release_queries();

    assert_eq!(reload.await?, Err(SyncError::SessionEnded));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.handle.snapshot().await?.is_empty());
    let view = client.view();
    assert_eq!(view.total_count, 0);
    assert!(view.bookmarks.is_empty());
    assert!(!view.loading);

    client.stop().await
}

#[tokio::test]
async fn on_disk_backend_serves_clients() -> TestResult {
    init_tracing();
    let backend = TestBackend::on_disk()?;
    let client = TestClient::start(&backend, SubjectIdentity::generate());
    client.sign_in_and_wait().await?;
    let record = client.handle.add_bookmark("Docs", "https://docs.rs").await?;
    assert_eq!(backend.store().count(&backend.config().collection)?, 1);
    assert_eq!(client.view().ids(), vec![record.id]);
    client.stop().await
}
