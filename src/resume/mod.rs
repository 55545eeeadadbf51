//! Durable crawl progress.
//!
//! The SQLite-backed [`ProgressStore`] owns records, the page cursor and the
//! content-hash asset index. [`CrawlLock`] keeps two crawler processes off the
//! same store, and [`export`] dumps records to CSV.

pub mod export;
pub mod lock;
mod migrations;
pub mod store;

pub use export::{export_csv, ExportError};
pub use lock::{CrawlLock, LockError};
pub use store::{CommitSummary, PageCommit, PageOutcome, ProgressStore, StoreError, StoreStats};
