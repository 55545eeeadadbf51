//! Request pacing across the whole session pool

use crate::common::{credentials, item, FakeAssetFetcher, FakeCatalog};
use catalog_crawler::config::CrawlConfig;
use catalog_crawler::crawler::{CrawlEnd, Orchestrator, ResumeMode};
use catalog_crawler::rate_limit::RateController;
use catalog_crawler::resume::ProgressStore;
use catalog_crawler::session::{SessionManager, SessionPool};
use catalog_crawler::shutdown::ShutdownCoordinator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

fn paced_config(root: &Path, sessions: usize, pages_per_session: usize) -> CrawlConfig {
    CrawlConfig {
        concurrent_sessions: sessions,
        pages_per_session,
        requests_per_minute: 60,
        backoff_floor: Duration::from_secs(1),
        backoff_ceiling: Duration::from_secs(30),
        download_assets: false,
        assets_dir: root.join("assets"),
        ..CrawlConfig::default()
    }
}

fn assert_spaced(times: &[Instant], at_least: Duration) {
    let mut sorted = times.to_vec();
    sorted.sort();
    for pair in sorted.windows(2) {
        assert!(
            pair[1] - pair[0] >= at_least,
            "requests {:?} apart, expected at least {:?}",
            pair[1] - pair[0],
            at_least
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_from_many_callers_is_spaced() {
    let controller = Arc::new(RateController::new(
        Duration::from_millis(500),
        Duration::from_secs(10),
        2.0,
    ));
    let shutdown = ShutdownCoordinator::shared();
    let started = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            controller.acquire(&shutdown).await.unwrap();
            Instant::now()
        }));
    }
    let mut sent = Vec::new();
    for handle in handles {
        sent.push(handle.await.unwrap());
    }

    assert_spaced(&sent, Duration::from_millis(500));
    assert!(started.elapsed() >= Duration::from_millis(4500));
    assert_eq!(controller.snapshot().granted, 10);
}

#[tokio::test(start_paused = true)]
async fn test_pool_requests_share_one_rate() {
    let dir = TempDir::new().unwrap();
    let config = paced_config(dir.path(), 2, 2);
    let pages = (1..=8)
        .map(|page| vec![item(&format!("SD-{page}"), "Shot", "")])
        .collect();
    let catalog = FakeCatalog::with_total(pages);

    let summary = Orchestrator::new(
        config,
        ProgressStore::open_in_memory().unwrap(),
        catalog.browser(),
        FakeAssetFetcher::new().shared(),
        credentials(),
        ShutdownCoordinator::shared(),
    )
    .run(ResumeMode::On)
    .await
    .unwrap();

    assert_eq!(summary.end, CrawlEnd::Completed);
    assert_eq!(catalog.requested_pages().len(), 8);
    assert_spaced(&catalog.request_times(), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_throttling_slows_following_requests() {
    let dir = TempDir::new().unwrap();
    let config = paced_config(dir.path(), 1, 1);
    let catalog = FakeCatalog::new(vec![
        vec![item("SD-1", "One", "")],
        vec![item("SD-2", "Two", "")],
        vec![item("SD-3", "Three", "")],
    ]);
    catalog.throttle_page(2, 1);

    let summary = Orchestrator::new(
        config,
        ProgressStore::open_in_memory().unwrap(),
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
    assert_eq!(catalog.requested_pages(), vec![1, 2, 2, 3]);

    let times = catalog.request_times();
    assert!(times[1] - times[0] >= Duration::from_secs(1));
    assert!(times[2] - times[1] >= Duration::from_secs(2));
    assert!(times[3] - times[2] >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_throttling_does_not_use_up_page_attempts() {
    let dir = TempDir::new().unwrap();
    let config = paced_config(dir.path(), 1, 1);
    let max_attempts = config.max_page_attempts;
    let catalog = FakeCatalog::new(vec![
        vec![item("SD-1", "One", "")],
        vec![item("SD-2", "Two", "")],
        vec![item("SD-3", "Three", "")],
    ]);
    catalog.throttle_page(2, max_attempts);
    let store = ProgressStore::open_in_memory().unwrap();

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
    let page_two = catalog.requested_pages().iter().filter(|p| **p == 2).count();
    assert_eq!(page_two as u32, max_attempts + 1);
    assert!(store.get("SD-2").await.unwrap().is_some());
    assert!(summary.cursor.finished);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_is_honoured() {
    let controller = Arc::new(RateController::new(
        Duration::from_millis(100),
        Duration::from_secs(30),
        2.0,
    ));
    let catalog = FakeCatalog::new(vec![vec![item("SD-1", "One", "")]]);
    catalog.throttle_page_for(1, Duration::from_secs(10));
    let shutdown = ShutdownCoordinator::shared();
    let config = CrawlConfig {
        concurrent_sessions: 1,
        pages_per_session: 1,
        ..CrawlConfig::default()
    };
    let manager = Arc::new(SessionManager::new(
        catalog.browser(),
        credentials(),
        controller.clone(),
        shutdown.clone(),
        config.session_max_failures,
    ));
    let pool = SessionPool::new(manager, controller, shutdown, &config);
    pool.start().await.unwrap();

    let content = pool
        .with_page(|page| page.load_catalog_page(1))
        .await
        .unwrap();

    assert_eq!(content.items.len(), 1);
    let times = catalog.request_times();
    assert_eq!(times.len(), 2);
    assert!(times[1] - times[0] >= Duration::from_secs(10));
}
