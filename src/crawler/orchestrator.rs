//! Crawl lifecycle.
//!
//! [`Orchestrator::run`] prepares the store and asset directory, logs the
//! session pool in, then walks the catalog: the pagination driver hands out
//! pages, each page becomes a task that fetches through the pool, classifies
//! the page, reports acceptance back to the driver and commits the page's
//! records in one transaction. Committed records feed the download manager.
//!
//! On shutdown (or a fatal error) no new page is dispatched, in-flight pages
//! either commit fully or stay uncommitted, queued downloads finish or abort
//! before anything is moved into place, and the sessions are released.

use super::extract::{ExtractionPipeline, PipelineError, ProcessedPage};
use super::pagination::{DriverState, PageClass, PaginationDriver};
use super::progress::{CrawlStats, StatsSnapshot};
use crate::browser::{Browser, BrowserError};
use crate::config::{ConfigError, Credentials, CrawlConfig};
use crate::downloader::config::calculate_backoff;
use crate::downloader::{AssetFetcher, DownloadError, DownloadManager};
use crate::metrics;
use crate::rate_limit::RateController;
use crate::record::PageCursor;
use crate::resume::{CrawlLock, LockError, ProgressStore, StoreError};
use crate::session::{PoolError, SessionManager, SessionPool};
use crate::shutdown::SharedShutdown;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

/// How a crawl treats existing progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Continue from the stored cursor
    #[default]
    On,
    /// Rewind the cursor to page 1; records are kept
    Reset,
    /// Re-hash stored assets before continuing
    Verify,
}

impl FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" => Ok(ResumeMode::On),
            "reset" => Ok(ResumeMode::Reset),
            "verify" => Ok(ResumeMode::Verify),
            _ => Err(format!(
                "Invalid resume mode: {s}. Valid options: on, reset, verify"
            )),
        }
    }
}

impl fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResumeMode::On => "on",
            ResumeMode::Reset => "reset",
            ResumeMode::Verify => "verify",
        })
    }
}

/// Crawl errors
#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Another crawler holds the store
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Progress store failure
    #[error("progress store error: {0}")]
    Store(#[from] StoreError),

    /// Session pool could not serve pages (bad credentials, no sessions)
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Asset directory maintenance failed
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The pagination driver gave up
    #[error("crawl stopped: {0}")]
    TooManyFailures(String),

    /// A background task hit an unrecoverable error
    #[error("crawl aborted: {0}")]
    Fatal(String),
}

impl From<PipelineError> for CrawlError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Store(e) => Self::Store(e),
        }
    }
}

/// Why the crawl stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlEnd {
    /// End of catalog reached (now or in an earlier run)
    Completed,
    /// Configured page ceiling reached
    PageLimit,
    /// Shutdown requested before the end
    Interrupted,
    /// Dispatch ran out with pages still uncommitted; the next run retries them
    Incomplete,
}

/// What a finished crawl reports.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    /// Why the crawl stopped
    pub end: CrawlEnd,
    /// Counters for this run
    pub stats: StatsSnapshot,
    /// Cursor as stored at exit
    pub cursor: PageCursor,
    /// Session re-authentications this run
    pub reauthentications: u64,
    /// Most recent non-fatal error
    pub last_error: Option<String>,
}

struct Accepted {
    page: u32,
    class: PageClass,
    total_pages: Option<u32>,
}

enum PageResult {
    Committed(u32, PageClass, ProcessedPage),
    Failed(u32, String),
    Fatal(u32, CrawlError),
    Cancelled(u32),
}

struct PageWorker {
    pool: Arc<SessionPool>,
    pipeline: ExtractionPipeline,
    shutdown: SharedShutdown,
    max_attempts: u32,
}

impl PageWorker {
    async fn run(&self, page: u32, accepted: mpsc::UnboundedSender<Accepted>) -> PageResult {
        let mut last_error = String::from("no attempts made");
        for attempt in 0..self.max_attempts {
            if attempt > 0 && self.shutdown.sleep(calculate_backoff(attempt - 1)).await.is_err() {
                return PageResult::Cancelled(page);
            }

            let fetched = self
                .pool
                .with_page(move |handle| handle.load_catalog_page(page))
                .await;
            let (class, committed) = match fetched {
                Ok(content) => {
                    let class = PageClass::of(&content, page);
                    let _ = accepted.send(Accepted {
                        page,
                        class,
                        total_pages: content.total_pages,
                    });
                    (class, self.pipeline.process(page, class, &content).await)
                }
                Err(PoolError::Browser(BrowserError::Extraction(reason))) => {
                    let _ = accepted.send(Accepted {
                        page,
                        class: PageClass::Empty,
                        total_pages: None,
                    });
                    (PageClass::Empty, self.pipeline.skip(page, &reason).await)
                }
                Err(PoolError::Cancelled | PoolError::Closed) => return PageResult::Cancelled(page),
                Err(e) if e.is_fatal() => return PageResult::Fatal(page, e.into()),
                Err(e) => {
                    warn!(
                        page,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Page attempt failed"
                    );
                    last_error = e.to_string();
                    continue;
                }
            };

            return match committed {
                Ok(processed) => PageResult::Committed(page, class, processed),
                Err(e) => PageResult::Fatal(page, e.into()),
            };
        }
        PageResult::Failed(page, last_error)
    }
}

/// Runs one crawl against a browsing surface and an asset fetcher.
pub struct Orchestrator {
    config: CrawlConfig,
    store: ProgressStore,
    browser: Arc<dyn Browser>,
    fetcher: Arc<dyn AssetFetcher>,
    credentials: Credentials,
    shutdown: SharedShutdown,
    stats: Arc<CrawlStats>,
}

impl Orchestrator {
    /// Wire the crawl components together.
    pub fn new(
        config: CrawlConfig,
        store: ProgressStore,
        browser: Arc<dyn Browser>,
        fetcher: Arc<dyn AssetFetcher>,
        credentials: Credentials,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            config,
            store,
            browser,
            fetcher,
            credentials,
            shutdown,
            stats: Arc::new(CrawlStats::new()),
        }
    }

    /// Live counters for this crawl.
    pub fn stats(&self) -> Arc<CrawlStats> {
        self.stats.clone()
    }

    /// Crawl until the end of the catalog, the page ceiling, a fatal error
    /// or shutdown.
    pub async fn run(&self, mode: ResumeMode) -> Result<CrawlSummary, CrawlError> {
        self.config.validate()?;
        let _lock = match self.store.path() {
            Some(path) => Some(CrawlLock::try_acquire(path)?),
            None => None,
        };

        let downloads = DownloadManager::new(
            self.store.clone(),
            self.fetcher.clone(),
            &self.config,
            self.shutdown.clone(),
            self.stats.clone(),
        );
        self.prepare(mode, &downloads).await?;

        let cursor = self.store.load_cursor().await?;
        info!(
            next_page = cursor.next_page,
            total_pages = ?cursor.total_pages,
            finished = cursor.finished,
            resume = %mode,
            "Loaded page cursor"
        );

        let rate = Arc::new(RateController::from_config(&self.config));
        let manager = Arc::new(SessionManager::new(
            self.browser.clone(),
            self.credentials.clone(),
            rate.clone(),
            self.shutdown.clone(),
            self.config.session_max_failures,
        ));
        let pool = Arc::new(SessionPool::new(
            manager.clone(),
            rate,
            self.shutdown.clone(),
            &self.config,
        ));

        let mut driver = PaginationDriver::new(
            &cursor,
            self.config.max_pages,
            self.config.max_consecutive_page_failures,
        );
        let mut last_error = None;
        let mut fatal = None;

        if driver.is_done() {
            info!("Catalog already fully crawled; finishing pending downloads");
        } else if let Err(e) = pool.start().await {
            if !matches!(e, PoolError::Cancelled) {
                pool.close().await;
                return Err(e.into());
            }
            info!("Shutdown requested while logging in");
        }

        if self.config.download_assets {
            let mut queued = 0;
            for record in self.store.pending_downloads().await? {
                if downloads.enqueue(&record) {
                    queued += 1;
                }
            }
            if queued > 0 {
                info!(queued, "Re-queued pending downloads");
            }
        }

        let worker = Arc::new(PageWorker {
            pool: pool.clone(),
            pipeline: ExtractionPipeline::new(self.store.clone()),
            shutdown: self.shutdown.clone(),
            max_attempts: self.config.max_page_attempts,
        });
        self.drive(&mut driver, &worker, &downloads, &mut last_error, &mut fatal)
            .await;

        if self.shutdown.is_shutdown_requested() {
            info!(in_flight = downloads.in_flight(), "Stopping downloads");
        } else {
            info!(in_flight = downloads.in_flight(), "Waiting for downloads to finish");
        }
        downloads.drain().await;
        if let Some(message) = downloads.fatal_error() {
            fatal.get_or_insert(CrawlError::Fatal(message));
        }
        pool.close().await;

        let cursor = self.store.load_cursor().await?;
        info!(
            "{}",
            self.stats
                .format_progress(cursor.total_pages, last_error.as_deref())
        );

        if let Some(e) = fatal {
            error!(error = %e, "Crawl aborted");
            return Err(e);
        }
        if let DriverState::Error(reason) = driver.state() {
            if !self.shutdown.is_shutdown_requested() {
                return Err(CrawlError::TooManyFailures(reason.clone()));
            }
        }

        let end = if cursor.finished {
            CrawlEnd::Completed
        } else if matches!(driver.state(), DriverState::PageLimit(_)) {
            CrawlEnd::PageLimit
        } else if self.shutdown.is_shutdown_requested() {
            CrawlEnd::Interrupted
        } else {
            warn!(next_page = cursor.next_page, "Pages left uncommitted; rerun to retry them");
            CrawlEnd::Incomplete
        };
        let summary = CrawlSummary {
            end,
            stats: self.stats.snapshot(),
            cursor,
            reauthentications: manager.reauthentications(),
            last_error,
        };
        info!(
            end = ?summary.end,
            next_page = summary.cursor.next_page,
            reauthentications = summary.reauthentications,
            "Crawl finished"
        );
        Ok(summary)
    }

    async fn prepare(&self, mode: ResumeMode, downloads: &DownloadManager) -> Result<(), CrawlError> {
        if mode == ResumeMode::Reset {
            info!("Reset mode: rewinding page cursor to page 1");
            self.store.reset_cursor().await?;
        }
        downloads.cleanup_staging().await?;
        downloads.reconcile(mode == ResumeMode::Verify).await?;
        Ok(())
    }

    async fn drive(
        &self,
        driver: &mut PaginationDriver,
        worker: &Arc<PageWorker>,
        downloads: &DownloadManager,
        last_error: &mut Option<String>,
        fatal: &mut Option<CrawlError>,
    ) {
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<PageResult> = JoinSet::new();
        let capacity = self.config.pool_capacity();
        let mut halted = self.shutdown.is_shutdown_requested();
        if halted {
            driver.halt();
        }

        loop {
            while !halted && tasks.len() < capacity {
                let Some(page) = driver.next_page() else {
                    break;
                };
                let worker = worker.clone();
                let accepted = accepted_tx.clone();
                tasks.spawn(
                    async move { worker.run(page, accepted).await }
                        .instrument(info_span!("page", page)),
                );
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                Some(accepted) = accepted_rx.recv() => {
                    driver.accept(accepted.page, accepted.class, accepted.total_pages);
                }
                Some(joined) = tasks.join_next() => {
                    while let Ok(accepted) = accepted_rx.try_recv() {
                        driver.accept(accepted.page, accepted.class, accepted.total_pages);
                    }
                    let settled = match joined {
                        Ok(result) => self.settle(driver, downloads, result, last_error),
                        Err(e) => Err(CrawlError::Fatal(format!("page task aborted: {e}"))),
                    };
                    if let Err(e) = settled {
                        error!(error = %e, "Fatal error; stopping crawl");
                        fatal.get_or_insert(e);
                        driver.halt();
                        halted = true;
                        self.shutdown.request_shutdown();
                    }
                }
                _ = self.shutdown.wait_for_shutdown(), if !halted => {
                    info!(in_flight = tasks.len(), "Shutdown requested; no new pages will be dispatched");
                    driver.halt();
                    halted = true;
                }
            }
        }
    }

    fn settle(
        &self,
        driver: &mut PaginationDriver,
        downloads: &DownloadManager,
        result: PageResult,
        last_error: &mut Option<String>,
    ) -> Result<(), CrawlError> {
        match result {
            PageResult::Committed(page, class, processed) => {
                let summary = &processed.summary;
                metrics::record_page(match class {
                    PageClass::Items => "items",
                    PageClass::Empty => "empty",
                    PageClass::EndOfCatalog => "end_of_catalog",
                });
                metrics::record_upserts(summary.inserted, summary.merged, summary.skipped_downloaded);
                if let Some(e) = &processed.extraction_error {
                    *last_error = Some(e.to_string());
                }

                if self.config.download_assets {
                    for record in &summary.to_download {
                        downloads.enqueue(record);
                    }
                }

                let committed = self.stats.page_committed(
                    processed.found,
                    summary.inserted,
                    summary.merged,
                    summary.skipped_downloaded,
                    processed.rejected,
                );
                info!(
                    page,
                    found = processed.found,
                    new = summary.inserted,
                    queued = summary.to_download.len(),
                    next_page = summary.cursor.next_page,
                    "Page complete"
                );
                if committed % self.config.progress_every_pages == 0 {
                    info!(
                        "{}",
                        self.stats
                            .format_progress(driver.total_pages(), last_error.as_deref())
                    );
                }
                Ok(())
            }
            PageResult::Failed(page, reason) => {
                self.stats.page_failed();
                metrics::record_page_failed();
                driver.fail(page, &reason);
                *last_error = Some(format!("page {page}: {reason}"));
                if let DriverState::Error(reason) = driver.state() {
                    error!(reason = %reason, "Too many consecutive page failures");
                }
                Ok(())
            }
            PageResult::Cancelled(page) => {
                driver.release(page);
                Ok(())
            }
            PageResult::Fatal(page, e) => {
                driver.release(page);
                *last_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}
