//! CLI error types and conversions

use crate::browser::BrowserError;
use crate::config::ConfigError;
use crate::crawler::CrawlError;
use crate::downloader::DownloadError;
use crate::metrics::MetricsError;
use crate::resume::{ExportError, StoreError};

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Crawl error
    #[error("crawl error: {0}")]
    CrawlError(#[from] CrawlError),

    /// Progress store error
    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    /// Export error
    #[error("export error: {0}")]
    ExportError(#[from] ExportError),

    /// Browsing surface could not be set up
    #[error("browser error: {0}")]
    BrowserError(#[from] BrowserError),

    /// Asset fetcher could not be set up
    #[error("download error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Metrics exporter error
    #[error("metrics error: {0}")]
    MetricsError(#[from] MetricsError),

    /// Invalid configuration values
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Output serialization failed
    #[error("output error: {0}")]
    OutputError(#[from] serde_json::Error),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
