//! Asset retrieval.
//!
//! [`AssetFetcher`] is the seam between the download manager and the network;
//! [`HttpAssetFetcher`] is the production implementation on a pooled
//! reqwest client.

use super::config::MAX_ASSET_BYTES;
use super::DownloadError;
use crate::metrics::RequestMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// HTTP connect timeout (seconds)
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds); assets can be large
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Fetches asset bytes by URL.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Full body of `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// Asset fetcher over plain HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: Client,
}

impl HttpAssetFetcher {
    /// Build a fetcher sending `user_agent`.
    pub fn new(user_agent: &str) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| DownloadError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let metrics = RequestMetrics::start("asset");
        let response = self.client.get(url).send().await.map_err(|e| {
            metrics.record_network_error(&e.to_string());
            DownloadError::Transient(format!("request to {url} failed: {e}"))
        })?;

        let status = response.status();
        metrics.record_status(status.as_u16());
        classify_status(status, url)?;

        let expected = response.content_length();
        if let Some(length) = expected {
            if length > MAX_ASSET_BYTES {
                return Err(DownloadError::TooLarge { size: length });
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DownloadError::Transient(format!("reading body of {url} failed: {e}")))?;
        check_complete(expected, body.len(), url)?;
        debug!(
            url,
            bytes = body.len(),
            correlation_id = metrics.correlation_id(),
            "Asset fetched"
        );
        Ok(body)
    }
}

/// Map an HTTP status to success, a retryable error, or a permanent one.
pub(crate) fn classify_status(status: StatusCode, url: &str) -> Result<(), DownloadError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("{url} returned HTTP {}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Err(DownloadError::Transient(message))
    } else {
        Err(DownloadError::Permanent(message))
    }
}

/// A body shorter or longer than the advertised length is a truncated transfer.
pub(crate) fn check_complete(
    expected: Option<u64>,
    received: usize,
    url: &str,
) -> Result<(), DownloadError> {
    match expected {
        Some(length) if length != received as u64 => Err(DownloadError::Transient(format!(
            "{url}: received {received} of {length} bytes"
        ))),
        _ => Ok(()),
    }
}
