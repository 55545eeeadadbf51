//! End-to-end crawls against a scripted catalog

use crate::common::{credentials, fast_config, item, stored_files, FakeAssetFetcher, FakeCatalog};
use catalog_crawler::crawler::{CrawlEnd, Orchestrator, ResumeMode};
use catalog_crawler::record::RecordStatus;
use catalog_crawler::resume::ProgressStore;
use catalog_crawler::shutdown::ShutdownCoordinator;
use tempfile::TempDir;

fn three_page_catalog() -> (FakeCatalog, FakeAssetFetcher) {
    let catalog = FakeCatalog::new(vec![
        vec![
            item("SD-1", "Opening shot", "https://cdn.test/1.jpg"),
            item("SD-2", "Wide exterior", "https://cdn.test/2.jpg"),
        ],
        vec![
            item("SD-3", "Close-up", "https://cdn.test/3.png"),
            item("SD-4", "Night street", "https://cdn.test/4.jpg"),
        ],
        vec![item("SD-5", "Final frame", "https://cdn.test/5.jpg")],
    ]);
    let fetcher = FakeAssetFetcher::new();
    fetcher
        .serve("https://cdn.test/1.jpg", b"frame-one")
        .serve("https://cdn.test/2.jpg", b"frame-two")
        .serve("https://cdn.test/3.png", b"frame-three")
        .serve("https://cdn.test/4.jpg", b"frame-four")
        .serve("https://cdn.test/5.jpg", b"frame-five");
    (catalog, fetcher)
}

#[tokio::test]
async fn test_crawl_stops_at_end_of_catalog() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let (catalog, fetcher) = three_page_catalog();
    let store = ProgressStore::open(&config.database_path).unwrap();

    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    );
    let summary = orchestrator.run(ResumeMode::On).await.unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(catalog.requested_pages(), vec![1, 2, 3]);
    assert!(summary.cursor.finished);
    assert_eq!(summary.cursor.total_pages, Some(3));
    assert_eq!(summary.stats.pages_committed, 3);
    assert_eq!(summary.stats.records_new, 5);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.downloaded, 5);
    assert_eq!(stats.assets, 5);
    assert_eq!(stored_files(&config.assets_dir).len(), 5);

    let record = store.get("SD-3").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Stored);
    let path = record.local_path.unwrap();
    assert_eq!(path.extension().unwrap(), "png");
    assert_eq!(std::fs::read(path).unwrap(), b"frame-three");
}

#[tokio::test]
async fn test_known_total_dispatches_ahead() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.concurrent_sessions = 2;
    let pages = (1..=6)
        .map(|page| vec![item(&format!("SD-{page}"), "Shot", "")])
        .collect();
    let catalog = FakeCatalog::with_total(pages);
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        FakeAssetFetcher::new().shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    let mut requested = catalog.requested_pages();
    requested.sort_unstable();
    assert_eq!(requested, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(summary.cursor.next_page, 7);
    assert_eq!(store.stats().await.unwrap().committed_pages, 6);
    assert_eq!(catalog.logins(), 2);
}

#[tokio::test]
async fn test_identical_assets_share_one_file() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = FakeCatalog::new(vec![
        vec![
            item("SD-10", "Poster A", "https://cdn.test/a.jpg"),
            item("SD-11", "Poster A (mirror)", "https://mirror.test/a.jpg"),
        ],
        vec![item("SD-12", "Poster B", "https://cdn.test/b.jpg")],
    ]);
    let fetcher = FakeAssetFetcher::new();
    fetcher
        .serve("https://cdn.test/a.jpg", b"same poster bytes")
        .serve("https://mirror.test/a.jpg", b"same poster bytes")
        .serve("https://cdn.test/b.jpg", b"another poster");
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config.clone(),
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.stats.assets_stored, 3);
    assert_eq!(summary.stats.assets_deduplicated, 1);
    assert_eq!(stored_files(&config.assets_dir).len(), 2);

    let first = store.get("SD-10").await.unwrap().unwrap();
    let mirror = store.get("SD-11").await.unwrap().unwrap();
    assert!(first.downloaded && mirror.downloaded);
    assert_eq!(first.content_hash, mirror.content_hash);
    assert_eq!(first.local_path, mirror.local_path);
}

#[tokio::test]
async fn test_repeated_identifier_keeps_latest_metadata_and_downloads_once() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = FakeCatalog::new(vec![vec![
        item("SD-1001", "Working title", "https://cdn.test/1001.jpg"),
        item("SD-1002", "Another shot", "https://cdn.test/1002.jpg"),
        item("SD-1001", "Final title", "https://cdn.test/1001.jpg"),
    ]]);
    let fetcher = FakeAssetFetcher::new();
    fetcher
        .serve("https://cdn.test/1001.jpg", b"frame 1001")
        .serve("https://cdn.test/1002.jpg", b"frame 1002");
    let store = ProgressStore::open(&config.database_path).unwrap();

    Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 2);
    let record = store.get("SD-1001").await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Final title"));
    assert!(record.downloaded);
    assert_eq!(fetcher.fetch_count("https://cdn.test/1001.jpg"), 1);
}

#[tokio::test]
async fn test_metadata_only_skips_downloads() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.download_assets = false;
    let (catalog, fetcher) = three_page_catalog();
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config.clone(),
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert!(fetcher.fetches().is_empty());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.pending, 5);
    assert_eq!(stats.downloaded, 0);
    assert!(stored_files(&config.assets_dir).is_empty());
}

#[tokio::test]
async fn test_missing_asset_fails_record_without_stopping_crawl() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = FakeCatalog::new(vec![vec![
        item("SD-20", "Served", "https://cdn.test/20.jpg"),
        item("SD-21", "Gone", "https://cdn.test/missing.jpg"),
    ]]);
    let fetcher = FakeAssetFetcher::new();
    fetcher.serve("https://cdn.test/20.jpg", b"frame 20");
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(summary.stats.downloads_failed, 1);
    let failed = store.get("SD-21").await.unwrap().unwrap();
    assert_eq!(failed.status, RecordStatus::FailedPermanent);
    assert!(!failed.downloaded);
    assert!(failed.last_error.is_some());
    assert_eq!(store.stats().await.unwrap().failed, 1);
}

#[tokio::test]
async fn test_unreadable_page_is_skipped_and_crawl_continues() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = FakeCatalog::new(vec![
        vec![item("SD-1", "One", "")],
        vec![item("SD-2", "Two", "")],
        vec![item("SD-3", "Three", "")],
    ]);
    catalog.break_page(2);
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        FakeAssetFetcher::new().shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(summary.stats.pages_failed, 0);
    assert!(summary.cursor.finished);
    assert_eq!(store.stats().await.unwrap().total, 2);
    assert!(store.get("SD-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_page_limit_stops_before_end() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.max_pages = Some(2);
    let (catalog, fetcher) = three_page_catalog();
    let store = ProgressStore::open(&config.database_path).unwrap();

    let summary = Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::PageLimit);
    assert_eq!(catalog.requested_pages(), vec![1, 2]);
    assert_eq!(summary.cursor.next_page, 3);
    assert!(!summary.cursor.finished);
    assert_eq!(store.stats().await.unwrap().total, 4);
}
