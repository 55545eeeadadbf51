//! Crawl-wide counters and the periodic progress line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters shared by page tasks and download tasks.
#[derive(Debug)]
pub struct CrawlStats {
    started: Instant,
    pages_committed: AtomicU64,
    pages_failed: AtomicU64,
    records_found: AtomicU64,
    records_new: AtomicU64,
    records_merged: AtomicU64,
    duplicates_skipped: AtomicU64,
    items_rejected: AtomicU64,
    assets_stored: AtomicU64,
    assets_deduplicated: AtomicU64,
    bytes_stored: AtomicU64,
    downloads_failed: AtomicU64,
    download_retries: AtomicU64,
}

/// Point-in-time copy of [`CrawlStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Pages committed this run
    pub pages_committed: u64,
    /// Pages that exhausted their attempts
    pub pages_failed: u64,
    /// Records extracted from pages
    pub records_found: u64,
    /// First-seen identifiers
    pub records_new: u64,
    /// Known identifiers whose metadata was refreshed
    pub records_merged: u64,
    /// Candidates skipped because their asset is already stored
    pub duplicates_skipped: u64,
    /// Items without an identifier
    pub items_rejected: u64,
    /// Records whose asset was stored
    pub assets_stored: u64,
    /// Stored assets that reused an existing file
    pub assets_deduplicated: u64,
    /// Bytes written to new asset files
    pub bytes_stored: u64,
    /// Downloads that failed permanently
    pub downloads_failed: u64,
    /// Download retries
    pub download_retries: u64,
    /// Seconds since the crawl started
    pub elapsed_secs: u64,
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlStats {
    /// Counters starting now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            pages_committed: AtomicU64::new(0),
            pages_failed: AtomicU64::new(0),
            records_found: AtomicU64::new(0),
            records_new: AtomicU64::new(0),
            records_merged: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            items_rejected: AtomicU64::new(0),
            assets_stored: AtomicU64::new(0),
            assets_deduplicated: AtomicU64::new(0),
            bytes_stored: AtomicU64::new(0),
            downloads_failed: AtomicU64::new(0),
            download_retries: AtomicU64::new(0),
        }
    }

    /// A page was committed; returns the number committed so far.
    pub fn page_committed(&self, found: u64, new: u64, merged: u64, skipped: u64, rejected: u64) -> u64 {
        self.records_found.fetch_add(found, Ordering::Relaxed);
        self.records_new.fetch_add(new, Ordering::Relaxed);
        self.records_merged.fetch_add(merged, Ordering::Relaxed);
        self.duplicates_skipped.fetch_add(skipped, Ordering::Relaxed);
        self.items_rejected.fetch_add(rejected, Ordering::Relaxed);
        self.pages_committed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A page exhausted its attempts.
    pub fn page_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An asset was stored for a record.
    pub fn asset_stored(&self, deduplicated: bool, bytes: u64) {
        self.assets_stored.fetch_add(1, Ordering::Relaxed);
        if deduplicated {
            self.assets_deduplicated.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_stored.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// A download failed permanently.
    pub fn download_failed(&self) {
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A download is being retried.
    pub fn download_retried(&self) {
        self.download_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the crawl started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            pages_committed: self.pages_committed.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            records_found: self.records_found.load(Ordering::Relaxed),
            records_new: self.records_new.load(Ordering::Relaxed),
            records_merged: self.records_merged.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            items_rejected: self.items_rejected.load(Ordering::Relaxed),
            assets_stored: self.assets_stored.load(Ordering::Relaxed),
            assets_deduplicated: self.assets_deduplicated.load(Ordering::Relaxed),
            bytes_stored: self.bytes_stored.load(Ordering::Relaxed),
            downloads_failed: self.downloads_failed.load(Ordering::Relaxed),
            download_retries: self.download_retries.load(Ordering::Relaxed),
            elapsed_secs: self.elapsed().as_secs(),
        }
    }

    /// Human-readable progress string for logging.
    pub fn format_progress(&self, total_pages: Option<u32>, last_error: Option<&str>) -> String {
        let snapshot = self.snapshot();
        let mut parts = vec![format!("[PROGRESS] {} pages", snapshot.pages_committed)];

        if let Some(total) = total_pages.filter(|total| *total > 0) {
            let pct = snapshot.pages_committed as f64 / f64::from(total) * 100.0;
            parts.push(format!("of {total} ({:.1}%)", pct.min(100.0)));
        }

        parts.push(format!(
            "- {} records ({} new, {} duplicate), {} assets stored ({} deduplicated, {})",
            snapshot.records_found,
            snapshot.records_new,
            snapshot.duplicates_skipped,
            snapshot.assets_stored,
            snapshot.assets_deduplicated,
            format_bytes(snapshot.bytes_stored)
        ));

        if snapshot.downloads_failed > 0 || snapshot.pages_failed > 0 {
            parts.push(format!(
                "- {} pages failed, {} downloads failed",
                snapshot.pages_failed, snapshot.downloads_failed
            ));
        }

        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 && snapshot.records_found > 0 {
            parts.push(format!(
                "at {:.0} records/min",
                snapshot.records_found as f64 / elapsed * 60.0
            ));
        }

        parts.push(format!("- elapsed {}", format_duration(self.elapsed())));
        if let Some(error) = last_error {
            parts.push(format!("- last error: {error}"));
        }
        parts.join(" ")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}h", secs as f64 / 3600.0)
    }
}
