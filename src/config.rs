//! Crawl configuration and tuning constants.
//!
//! [`CrawlConfig`] carries every operator knob. The constants below are the
//! fixed tuning points of the adaptive algorithms; they are not exposed on the
//! command line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Consecutive successes required before the rate controller decays its delay.
pub const SUCCESS_RUN_FOR_DECAY: u32 = 10;

/// Multiplicative decay applied after a clean success run.
pub const DECAY_FACTOR: f64 = 0.9;

/// Number of recent outcomes kept in the rate controller's sliding window.
pub const OUTCOME_WINDOW: usize = 20;

/// Failure ratio over the window that triggers a backoff step.
pub const FAILURE_RATIO_THRESHOLD: f64 = 0.5;

/// Minimum samples in the window before the failure ratio is trusted.
pub const MIN_WINDOW_SAMPLES: usize = 4;

/// Smallest backoff step when the current delay is zero.
pub const MIN_BACKOFF_STEP: Duration = Duration::from_millis(250);

/// Idle time after which a session is probed remotely before reuse.
pub const SESSION_PROBE_AFTER: Duration = Duration::from_secs(300);

/// Errors raised by [`CrawlConfig::validate`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// A capacity or count that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// Backoff floor exceeds the ceiling.
    #[error("backoff floor ({floor:?}) exceeds ceiling ({ceiling:?})")]
    FloorAboveCeiling {
        /// Configured floor
        floor: Duration,
        /// Configured ceiling
        ceiling: Duration,
    },

    /// The requests-per-minute ceiling needs a longer delay than the backoff ceiling.
    #[error("requests per minute implies a {base:?} delay, above the backoff ceiling ({ceiling:?})")]
    RateAboveCeiling {
        /// Delay implied by requests per minute
        base: Duration,
        /// Configured ceiling
        ceiling: Duration,
    },

    /// Backoff factor would not grow the delay.
    #[error("backoff factor must be greater than 1.0, got {0}")]
    Factor(f64),
}

/// Login credentials. The password never appears in `Debug` output.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    /// Account email or user name
    pub email: String,
    /// Account password
    pub password: String,
}

impl Credentials {
    /// Build credentials from owned strings.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Endpoints of the bundled HTTP browsing surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteConfig {
    /// Catalog origin, e.g. `https://catalog.example.com`
    pub base_url: String,
    /// Form login endpoint
    pub login_path: String,
    /// JSON listing endpoint; the page number is passed as `?page=N`
    pub catalog_path: String,
    /// Cheap authenticated endpoint used to probe session health
    pub probe_path: String,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://catalog.example.com".to_string(),
            login_path: "/login".to_string(),
            catalog_path: "/browse".to_string(),
            probe_path: "/account".to_string(),
            user_agent: concat!("catalog-crawler/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Every operator-facing crawl knob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawlConfig {
    /// Number of authenticated sessions in the pool
    pub concurrent_sessions: usize,
    /// Page handles multiplexed on each session
    pub pages_per_session: usize,
    /// Requests-per-minute ceiling for catalog traffic
    pub requests_per_minute: u32,
    /// Lowest inter-request delay the controller may decay to
    pub backoff_floor: Duration,
    /// Highest inter-request delay the controller may back off to
    pub backoff_ceiling: Duration,
    /// Multiplicative backoff factor
    pub backoff_factor: f64,
    /// Attempts per asset before it is marked permanently failed
    pub max_download_attempts: u32,
    /// Attempts per page before the page is left for the next run
    pub max_page_attempts: u32,
    /// Last page number to visit (absolute, 1-based)
    pub max_pages: Option<u32>,
    /// Download assets; `false` is metadata-only mode
    pub download_assets: bool,
    /// Download concurrency, independent of the session pool
    pub concurrent_downloads: usize,
    /// Root directory for stored assets
    pub assets_dir: PathBuf,
    /// SQLite progress store location
    pub database_path: PathBuf,
    /// Consecutive page failures after which the crawl stops
    pub max_consecutive_page_failures: u32,
    /// How long a slot stays out of rotation after re-authentication fails
    pub session_cooldown: Duration,
    /// Consecutive transport failures before a session is treated as dead
    pub session_max_failures: u32,
    /// Emit a progress line every N committed pages
    pub progress_every_pages: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            concurrent_sessions: 3,
            pages_per_session: 2,
            requests_per_minute: 60,
            backoff_floor: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_download_attempts: 3,
            max_page_attempts: 3,
            max_pages: None,
            download_assets: true,
            concurrent_downloads: 10,
            assets_dir: PathBuf::from("./downloaded_images"),
            database_path: PathBuf::from("./catalog_progress.db"),
            max_consecutive_page_failures: 5,
            session_cooldown: Duration::from_secs(60),
            session_max_failures: 3,
            progress_every_pages: 10,
        }
    }
}

impl CrawlConfig {
    /// Check invariants the runtime components rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("concurrent_sessions", self.concurrent_sessions),
            ("pages_per_session", self.pages_per_session),
            ("concurrent_downloads", self.concurrent_downloads),
            ("requests_per_minute", self.requests_per_minute as usize),
            ("max_download_attempts", self.max_download_attempts as usize),
            ("max_page_attempts", self.max_page_attempts as usize),
            ("max_consecutive_page_failures", self.max_consecutive_page_failures as usize),
            ("session_max_failures", self.session_max_failures as usize),
            ("progress_every_pages", self.progress_every_pages as usize),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.max_pages == Some(0) {
            return Err(ConfigError::Zero("max_pages"));
        }
        if self.backoff_floor > self.backoff_ceiling {
            return Err(ConfigError::FloorAboveCeiling {
                floor: self.backoff_floor,
                ceiling: self.backoff_ceiling,
            });
        }
        if self.base_delay() > self.backoff_ceiling {
            return Err(ConfigError::RateAboveCeiling {
                base: self.base_delay(),
                ceiling: self.backoff_ceiling,
            });
        }
        if !(self.backoff_factor > 1.0) {
            return Err(ConfigError::Factor(self.backoff_factor));
        }
        Ok(())
    }

    /// Delay implied by the requests-per-minute ceiling.
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(60) / self.requests_per_minute.max(1)
    }

    /// Effective floor: never faster than the requests-per-minute ceiling allows.
    pub fn effective_floor(&self) -> Duration {
        self.backoff_floor.max(self.base_delay())
    }

    /// Total page handles across the pool.
    pub fn pool_capacity(&self) -> usize {
        self.concurrent_sessions * self.pages_per_session
    }
}
