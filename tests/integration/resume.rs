//! Resumption, idempotent re-runs and store reconciliation

use crate::common::{credentials, fast_config, item, stored_files, FakeAssetFetcher, FakeCatalog};
use catalog_crawler::config::CrawlConfig;
use catalog_crawler::crawler::{CrawlEnd, CrawlError, Orchestrator, ResumeMode};
use catalog_crawler::record::RecordStatus;
use catalog_crawler::resume::{CrawlLock, ProgressStore};
use catalog_crawler::shutdown::ShutdownCoordinator;
use tempfile::TempDir;

fn catalog() -> (FakeCatalog, FakeAssetFetcher) {
    let catalog = FakeCatalog::new(vec![
        vec![
            item("SD-1", "One", "https://cdn.test/1.jpg"),
            item("SD-2", "Two", "https://cdn.test/2.jpg"),
        ],
        vec![item("SD-3", "Three", "https://cdn.test/3.jpg")],
        vec![item("SD-4", "Four", "https://cdn.test/4.jpg")],
    ]);
    let fetcher = FakeAssetFetcher::new();
    fetcher
        .serve("https://cdn.test/1.jpg", b"one")
        .serve("https://cdn.test/2.jpg", b"two")
        .serve("https://cdn.test/3.jpg", b"three")
        .serve("https://cdn.test/4.jpg", b"four");
    (catalog, fetcher)
}

async fn crawl(
    config: &CrawlConfig,
    catalog: &FakeCatalog,
    fetcher: &FakeAssetFetcher,
    mode: ResumeMode,
) -> Result<catalog_crawler::CrawlSummary, CrawlError> {
    let store = ProgressStore::open(&config.database_path)?;
    Orchestrator::new(
        config.clone(),
        store,
        catalog.browser(),
        fetcher.shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(mode)
    .await
}

#[tokio::test]
async fn test_rerun_over_finished_catalog_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let (catalog, fetcher) = catalog();

    crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();
    let store = ProgressStore::open(&config.database_path).unwrap();
    let records_before = store.all_records().await.unwrap();
    let stats_before = store.stats().await.unwrap();
    let files_before = stored_files(&config.assets_dir);
    let fetches_before = fetcher.fetches().len();
    let requests_before = catalog.requested_pages().len();
    drop(store);

    let summary = crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(summary.stats.pages_committed, 0);
    assert_eq!(fetcher.fetches().len(), fetches_before);
    assert_eq!(catalog.requested_pages().len(), requests_before);
    assert_eq!(catalog.logins(), 1);

    let store = ProgressStore::open(&config.database_path).unwrap();
    assert_eq!(store.all_records().await.unwrap(), records_before);
    assert_eq!(store.stats().await.unwrap(), stats_before);
    assert_eq!(stored_files(&config.assets_dir), files_before);
}

#[tokio::test]
async fn test_interrupted_crawl_resumes_at_cursor() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.max_pages = Some(1);
    let (catalog, fetcher) = catalog();

    let first = crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();
    assert_eq!(first.end, CrawlEnd::PageLimit);
    assert_eq!(first.cursor.next_page, 2);

    config.max_pages = None;
    let second = crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();

    assert_eq!(second.end, CrawlEnd::Completed);
    assert_eq!(catalog.requested_pages(), vec![1, 2, 3]);
    assert_eq!(second.stats.records_new, 2);
    for url in ["https://cdn.test/1.jpg", "https://cdn.test/3.jpg"] {
        assert_eq!(fetcher.fetch_count(url), 1, "{url} fetched more than once");
    }

    let store = ProgressStore::open(&config.database_path).unwrap();
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.total, 4);
    assert_eq!(stats.downloaded, 4);
}

#[tokio::test]
async fn test_reset_mode_recrawls_without_redownloading() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let (catalog, fetcher) = catalog();

    crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();
    let fetches_before = fetcher.fetches().len();

    let summary = crawl(&config, &catalog, &fetcher, ResumeMode::Reset).await.unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(catalog.requested_pages(), vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(summary.stats.records_new, 0);
    assert_eq!(summary.stats.duplicates_skipped, 4);
    assert_eq!(fetcher.fetches().len(), fetches_before);
}

#[tokio::test]
async fn test_missing_asset_file_is_downloaded_again() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let (catalog, fetcher) = catalog();

    crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();
    let store = ProgressStore::open(&config.database_path).unwrap();
    let record = store.get("SD-3").await.unwrap().unwrap();
    std::fs::remove_file(record.local_path.unwrap()).unwrap();
    drop(store);

    let summary = crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(fetcher.fetch_count("https://cdn.test/3.jpg"), 2);
    let store = ProgressStore::open(&config.database_path).unwrap();
    let record = store.get("SD-3").await.unwrap().unwrap();
    assert!(record.downloaded);
    assert_eq!(record.status, RecordStatus::Stored);
    assert!(record.local_path.unwrap().exists());
}

#[tokio::test]
async fn test_leftover_staging_files_are_removed() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let staging = config.assets_dir.join(".staging");
    std::fs::create_dir_all(&staging).unwrap();
    std::fs::write(staging.join(".tmpabc123"), b"half written").unwrap();
    let (catalog, fetcher) = catalog();

    crawl(&config, &catalog, &fetcher, ResumeMode::On).await.unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&staging).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_second_crawler_on_same_store_is_refused() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let (catalog, fetcher) = catalog();
    let _held = CrawlLock::try_acquire(&config.database_path).unwrap();

    let result = crawl(&config, &catalog, &fetcher, ResumeMode::On).await;

    assert!(matches!(result, Err(CrawlError::Lock(_))));
    assert!(catalog.requested_pages().is_empty());
}
