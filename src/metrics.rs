//! Crawl metrics.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the Prometheus exporter, so library code records
//! unconditionally.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

static METRICS_INITIALIZED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Metrics exporter errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be installed (address in use, recorder already set)
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Install the Prometheus exporter on `addr`. Idempotent.
pub async fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    let mut initialized = METRICS_INITIALIZED.write().await;
    if *initialized {
        debug!("Metrics already initialized, skipping");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_counter!(
        "catalog_requests_total",
        Unit::Count,
        "Catalog requests by endpoint and status"
    );
    describe_histogram!(
        "catalog_request_duration_seconds",
        Unit::Seconds,
        "Catalog request latency"
    );
    describe_counter!(
        "pages_processed_total",
        Unit::Count,
        "Pages committed, by classification"
    );
    describe_counter!(
        "pages_failed_total",
        Unit::Count,
        "Page tasks that exhausted their attempts"
    );
    describe_counter!(
        "records_upserted_total",
        Unit::Count,
        "Records written to the progress store, by kind"
    );
    describe_counter!(
        "assets_stored_total",
        Unit::Count,
        "Assets stored, labelled written or deduplicated"
    );
    describe_counter!(
        "asset_bytes_total",
        Unit::Bytes,
        "Bytes fetched for assets"
    );
    describe_counter!(
        "downloads_failed_total",
        Unit::Count,
        "Asset downloads that failed permanently"
    );
    describe_counter!(
        "download_retries_total",
        Unit::Count,
        "Asset download retry attempts"
    );
    describe_counter!(
        "session_reauthentications_total",
        Unit::Count,
        "Session re-authentications"
    );
    describe_gauge!(
        "rate_controller_delay_seconds",
        Unit::Seconds,
        "Current inter-request delay"
    );
    describe_histogram!(
        "rate_controller_wait_seconds",
        Unit::Seconds,
        "Time spent waiting for a rate permit"
    );

    *initialized = true;
    info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Generate a correlation id for request tracing.
pub fn generate_correlation_id() -> String {
    let id = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("req-{id:08x}")
}

/// Times one outbound request and records its outcome.
pub struct RequestMetrics {
    endpoint: &'static str,
    start_time: Instant,
    correlation_id: String,
}

impl RequestMetrics {
    /// Start timing a request against `endpoint` ("login", "page", "asset", ...).
    pub fn start(endpoint: &'static str) -> Self {
        let correlation_id = generate_correlation_id();
        debug!(correlation_id = %correlation_id, endpoint, "Request started");
        Self {
            endpoint,
            start_time: Instant::now(),
            correlation_id,
        }
    }

    /// Record a completed response.
    pub fn record_status(&self, status: u16) {
        let elapsed = self.start_time.elapsed();
        counter!(
            "catalog_requests_total",
            "endpoint" => self.endpoint,
            "status" => status.to_string(),
        )
        .increment(1);
        histogram!("catalog_request_duration_seconds", "endpoint" => self.endpoint)
            .record(elapsed.as_secs_f64());

        if status == 429 {
            warn!(
                correlation_id = %self.correlation_id,
                endpoint = self.endpoint,
                "Throttled by server (429)"
            );
        }
        debug!(
            correlation_id = %self.correlation_id,
            endpoint = self.endpoint,
            status,
            duration_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
    }

    /// Record a transport failure (no status).
    pub fn record_network_error(&self, error: &str) {
        counter!(
            "catalog_requests_total",
            "endpoint" => self.endpoint,
            "status" => "network_error",
        )
        .increment(1);
        debug!(
            correlation_id = %self.correlation_id,
            endpoint = self.endpoint,
            error,
            "Request failed"
        );
    }

    /// Correlation id attached to this request's log lines.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

/// Record a committed page.
pub fn record_page(class: &'static str) {
    counter!("pages_processed_total", "class" => class).increment(1);
}

/// Record a page task that gave up.
pub fn record_page_failed() {
    counter!("pages_failed_total").increment(1);
}

/// Record the outcome of a page commit.
pub fn record_upserts(inserted: u64, merged: u64, skipped: u64) {
    counter!("records_upserted_total", "kind" => "inserted").increment(inserted);
    counter!("records_upserted_total", "kind" => "merged").increment(merged);
    counter!("records_upserted_total", "kind" => "skipped").increment(skipped);
}

/// Record a stored asset.
pub fn record_asset_stored(deduplicated: bool, bytes: u64) {
    let kind = if deduplicated { "deduplicated" } else { "written" };
    counter!("assets_stored_total", "kind" => kind).increment(1);
    counter!("asset_bytes_total").increment(bytes);
}

/// Record a download retry.
pub fn record_download_retry(attempt: u32, backoff: Duration) {
    counter!("download_retries_total").increment(1);
    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Download retry scheduled");
}

/// Record a permanent download failure.
pub fn record_download_failed() {
    counter!("downloads_failed_total").increment(1);
}

/// Record a session re-authentication.
pub fn record_reauthentication() {
    counter!("session_reauthentications_total").increment(1);
}

/// Publish the rate controller's current delay.
pub fn set_rate_delay(delay: Duration) {
    gauge!("rate_controller_delay_seconds").set(delay.as_secs_f64());
}

/// Record time spent waiting for a rate permit.
pub fn record_rate_wait(wait: Duration) {
    histogram!("rate_controller_wait_seconds").record(wait.as_secs_f64());
}
