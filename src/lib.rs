//! # Catalog Crawler Library
//!
//! A resumable crawl engine for paginated catalogs behind a login. It walks
//! the catalog through a pool of authenticated sessions under a shared,
//! adaptive request rate, extracts item metadata into a durable progress
//! store and downloads each item's asset exactly once.
//!
//! ## Features
//!
//! - **Session Pool**: `N` authenticated sessions, `M` concurrent pages each, with
//!   transparent re-authentication when a session expires
//! - **Adaptive Rate Control**: one global request spacing that backs off on
//!   throttling and decays back after sustained success
//! - **Resumability**: every page commits its records and the cursor advance in one
//!   transaction; re-running over a crawled catalog is a no-op
//! - **Asset Deduplication**: assets are stored by content hash, written to a
//!   staging area and moved into place atomically
//! - **Graceful Shutdown**: Ctrl+C stops dispatch, lets in-flight work settle and
//!   releases every session
//!
//! ## Quick Start
//!
//! ```no_run
//! use catalog_crawler::browser::HttpBrowser;
//! use catalog_crawler::config::{Credentials, CrawlConfig, SiteConfig};
//! use catalog_crawler::crawler::{Orchestrator, ResumeMode};
//! use catalog_crawler::downloader::HttpAssetFetcher;
//! use catalog_crawler::resume::ProgressStore;
//! use catalog_crawler::shutdown::ShutdownCoordinator;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CrawlConfig::default();
//! let site = SiteConfig::default();
//! let store = ProgressStore::open(&config.database_path)?;
//!
//! let orchestrator = Orchestrator::new(
//!     config,
//!     store,
//!     Arc::new(HttpBrowser::new(site.clone())?),
//!     Arc::new(HttpAssetFetcher::new(&site.user_agent)?),
//!     Credentials::new("me@example.com", "secret"),
//!     ShutdownCoordinator::shared(),
//! );
//! let summary = orchestrator.run(ResumeMode::On).await?;
//! println!("{} pages committed", summary.stats.pages_committed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`browser`] - the browsing surface seam and its HTTP implementation
//! - [`session`] - login, re-authentication and the session pool
//! - [`rate_limit`] - the adaptive rate controller
//! - [`crawler`] - pagination, extraction and the orchestrator
//! - [`downloader`] - asset fetching, deduplication and atomic placement
//! - [`resume`] - the SQLite progress store, process lock and CSV export
//! - [`record`] - catalog records and the page cursor

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Browsing surface abstraction
pub mod browser;

/// CLI command implementations
pub mod cli;

/// Crawl configuration and tuning constants
pub mod config;

/// Pagination, extraction and orchestration
pub mod crawler;

/// Asset download pipeline
pub mod downloader;

/// Prometheus metrics and request instrumentation
pub mod metrics;

/// Adaptive request-rate controller
pub mod rate_limit;

/// Catalog records and crawl cursor
pub mod record;

/// Durable crawl progress
pub mod resume;

/// Authenticated sessions
pub mod session;

/// Graceful shutdown coordination shared across modules
pub mod shutdown;

pub use config::{Credentials, CrawlConfig, SiteConfig};
pub use crawler::{CrawlError, CrawlSummary, Orchestrator, ResumeMode};
pub use record::{CatalogRecord, PageCursor, RecordStatus};
