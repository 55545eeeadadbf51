//! Graceful shutdown of a running crawl

use crate::common::{credentials, fast_config, item, FakeAssetFetcher, FakeCatalog};
use catalog_crawler::crawler::{CrawlEnd, Orchestrator, ResumeMode};
use catalog_crawler::resume::ProgressStore;
use catalog_crawler::shutdown::ShutdownCoordinator;
use std::time::Duration;
use tempfile::TempDir;

fn slow_catalog(pages: u32) -> FakeCatalog {
    let catalog = FakeCatalog::new(
        (1..=pages)
            .map(|page| vec![item(&format!("SD-{page}"), "Shot", "")])
            .collect(),
    );
    catalog.set_load_delay(Duration::from_millis(100));
    catalog
}

#[tokio::test]
async fn test_shutdown_mid_crawl_keeps_committed_progress() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = slow_catalog(10);
    let store = ProgressStore::open(&config.database_path).unwrap();
    let shutdown = ShutdownCoordinator::shared();

    let orchestrator = Orchestrator::new(
        config.clone(),
        store.clone(),
        catalog.browser(),
        FakeAssetFetcher::new().shared(),
        credentials(),
        shutdown.clone(),
    );
    let crawl = tokio::spawn(async move { orchestrator.run(ResumeMode::On).await });

    tokio::time::sleep(Duration::from_millis(350)).await;
    shutdown.request_shutdown();

    let summary = tokio::time::timeout(Duration::from_secs(5), crawl)
        .await
        .expect("crawl did not stop after shutdown")
        .unwrap()
        .unwrap();

    assert_eq!(summary.end, CrawlEnd::Interrupted);
    assert!(!summary.cursor.finished);
    assert!(summary.stats.pages_committed < 10);
    assert_eq!(summary.stats.pages_failed, 0);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.committed_pages, summary.stats.pages_committed);
    assert_eq!(stats.total, summary.stats.pages_committed);
    assert_eq!(
        summary.cursor.next_page as u64,
        summary.stats.pages_committed + 1
    );

    // The lock is released, so the crawl can pick up where it stopped.
    let resumed = Orchestrator::new(
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
    assert_eq!(resumed.end, CrawlEnd::Completed);
    assert_eq!(store.stats().await.unwrap().total, 10);
}

#[tokio::test]
async fn test_shutdown_before_start_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let catalog = slow_catalog(3);
    let store = ProgressStore::open(&config.database_path).unwrap();
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let summary = Orchestrator::new(
        config,
        store.clone(),
        catalog.browser(),
        FakeAssetFetcher::new().shared(),
        credentials(),
        shutdown,
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Interrupted);
    assert!(catalog.requested_pages().is_empty());
    assert_eq!(summary.cursor.next_page, 1);
    assert_eq!(store.stats().await.unwrap().committed_pages, 0);
}

#[tokio::test]
async fn test_every_waiter_is_woken() {
    let shutdown = ShutdownCoordinator::shared();

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let handle = shutdown.clone();
        waiters.push(tokio::spawn(async move { handle.wait_for_shutdown().await }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.request_shutdown();

    for waiter in waiters {
        let woken = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(woken.is_ok(), "a waiter missed the shutdown notification");
    }
}

#[tokio::test]
async fn test_wait_after_request_returns_immediately() {
    let shutdown = ShutdownCoordinator::shared();
    shutdown.request_shutdown();

    let waited = tokio::time::timeout(Duration::from_millis(50), shutdown.wait_for_shutdown()).await;
    assert!(waited.is_ok());
    assert!(shutdown.check().is_err());
}
