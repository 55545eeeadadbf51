//! Asset download pipeline
//!
//! Records committed by the crawl are handed to the [`DownloadManager`],
//! which fetches each record's asset with bounded concurrency, stores it
//! under its content hash and marks the record downloaded only once the file
//! is in place.
//!
//! # Components
//!
//! - [`executor`] - download manager: retries, staging, placement, reconciliation
//! - [`fetch`] - the [`AssetFetcher`] seam and its HTTP implementation
//! - [`config`] - constants and backoff calculation
//!
//! # Error Handling
//!
//! Errors are split by whether another attempt can help:
//! - network failures, timeouts, 408/429/5xx are retried with backoff
//! - other HTTP errors, empty or oversized bodies fail the record permanently
//! - store failures stop the crawl

pub mod config;
pub mod executor;
pub mod fetch;

pub use executor::{DownloadManager, DownloadTask};
pub use fetch::{AssetFetcher, HttpAssetFetcher};

use crate::resume::StoreError;
use crate::shutdown::Cancelled;

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Worth retrying
    #[error("transient download error: {0}")]
    Transient(String),

    /// Retrying will not help
    #[error("download failed: {0}")]
    Permanent(String),

    /// Body exceeds the size limit
    #[error("asset too large: {size} bytes")]
    TooLarge {
        /// Announced size
        size: u64,
    },

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Progress store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Shutdown requested
    #[error("download cancelled")]
    Cancelled,
}

impl From<Cancelled> for DownloadError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl DownloadError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Io(_))
    }
}
