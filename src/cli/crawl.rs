//! Crawl command implementation

use super::{parse_positive, Cli, CliError, OutputFormat};
use crate::browser::HttpBrowser;
use crate::config::{Credentials, CrawlConfig, SiteConfig};
use crate::crawler::{CrawlSummary, Orchestrator, ResumeMode};
use crate::downloader::HttpAssetFetcher;
use crate::metrics::init_metrics;
use crate::shutdown::SharedShutdown;
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Arguments for `crawl`
#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Account email (or set CATALOG_EMAIL)
    #[arg(long, env = "CATALOG_EMAIL")]
    pub email: Option<String>,

    /// Account password (or set CATALOG_PASSWORD)
    #[arg(long, env = "CATALOG_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Catalog origin
    #[arg(long, env = "CATALOG_BASE_URL", default_value = "https://catalog.example.com")]
    pub base_url: String,

    /// Form login path
    #[arg(long, default_value = "/login")]
    pub login_path: String,

    /// JSON listing path (page number is sent as ?page=N)
    #[arg(long, default_value = "/browse")]
    pub catalog_path: String,

    /// Authenticated path used to probe session health
    #[arg(long, default_value = "/account")]
    pub probe_path: String,

    /// User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Resume mode: on, reset, or verify
    #[arg(long, default_value = "on")]
    pub resume: ResumeMode,

    /// Number of authenticated sessions
    #[arg(long, default_value = "3", value_parser = parse_positive::<usize>)]
    pub sessions: usize,

    /// Pages multiplexed on each session
    #[arg(long, default_value = "2", value_parser = parse_positive::<usize>)]
    pub pages_per_session: usize,

    /// Requests-per-minute ceiling for catalog traffic
    #[arg(long, default_value = "60", value_parser = parse_positive::<u32>)]
    pub requests_per_minute: u32,

    /// Lowest inter-request delay in milliseconds (default: 60000 / requests-per-minute)
    #[arg(long)]
    pub backoff_floor_ms: Option<u64>,

    /// Highest inter-request delay in seconds
    #[arg(long, default_value = "30")]
    pub backoff_ceiling_secs: u64,

    /// Multiplicative backoff factor
    #[arg(long, default_value = "2.0")]
    pub backoff_factor: f64,

    /// Attempts per asset before it is marked permanently failed
    #[arg(long, default_value = "3", value_parser = parse_positive::<u32>)]
    pub max_download_attempts: u32,

    /// Attempts per page before it is left for the next run
    #[arg(long, default_value = "3", value_parser = parse_positive::<u32>)]
    pub max_page_attempts: u32,

    /// Last page number to visit
    #[arg(long, value_parser = parse_positive::<u32>)]
    pub max_pages: Option<u32>,

    /// Store metadata only; do not download assets
    #[arg(long)]
    pub metadata_only: bool,

    /// Concurrent asset downloads
    #[arg(long, default_value = "10", value_parser = parse_positive::<usize>)]
    pub concurrent_downloads: usize,

    /// Directory for stored assets
    #[arg(long, default_value = "./downloaded_images")]
    pub assets_dir: PathBuf,

    /// Consecutive page failures after which the crawl stops
    #[arg(long, default_value = "5", value_parser = parse_positive::<u32>)]
    pub max_consecutive_failures: u32,

    /// Seconds a session stays out of rotation after re-authentication fails
    #[arg(long, default_value = "60")]
    pub session_cooldown_secs: u64,

    /// Consecutive transport failures after which a session is re-authenticated
    #[arg(long, default_value = "3", value_parser = parse_positive::<u32>)]
    pub session_max_failures: u32,

    /// Log a progress line every N committed pages
    #[arg(long, default_value = "10", value_parser = parse_positive::<u64>)]
    pub progress_every: u64,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000)
    #[arg(long)]
    pub metrics_addr: Option<SocketAddr>,
}

impl CrawlArgs {
    /// Crawl configuration from the arguments.
    pub fn config(&self, database_path: PathBuf) -> CrawlConfig {
        let mut config = CrawlConfig {
            concurrent_sessions: self.sessions,
            pages_per_session: self.pages_per_session,
            requests_per_minute: self.requests_per_minute,
            backoff_ceiling: Duration::from_secs(self.backoff_ceiling_secs),
            backoff_factor: self.backoff_factor,
            max_download_attempts: self.max_download_attempts,
            max_page_attempts: self.max_page_attempts,
            max_pages: self.max_pages,
            download_assets: !self.metadata_only,
            concurrent_downloads: self.concurrent_downloads,
            assets_dir: self.assets_dir.clone(),
            database_path,
            max_consecutive_page_failures: self.max_consecutive_failures,
            session_cooldown: Duration::from_secs(self.session_cooldown_secs),
            session_max_failures: self.session_max_failures,
            progress_every_pages: self.progress_every,
            ..CrawlConfig::default()
        };
        config.backoff_floor = match self.backoff_floor_ms {
            Some(ms) => Duration::from_millis(ms),
            None => config.base_delay(),
        };
        config
    }

    /// Site endpoints from the arguments.
    pub fn site(&self) -> SiteConfig {
        let defaults = SiteConfig::default();
        SiteConfig {
            base_url: self.base_url.trim_end_matches('/').to_string(),
            login_path: self.login_path.clone(),
            catalog_path: self.catalog_path.clone(),
            probe_path: self.probe_path.clone(),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }

    fn credentials(&self) -> Result<Credentials, CliError> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) if !email.is_empty() && !password.is_empty() => {
                Ok(Credentials::new(email.clone(), password.clone()))
            }
            _ => Err(CliError::ConfigurationError(
                "credentials required: pass --email/--password or set CATALOG_EMAIL/CATALOG_PASSWORD"
                    .to_string(),
            )),
        }
    }

    /// Execute the crawl command
    pub async fn execute(&self, cli: &Cli, shutdown: SharedShutdown) -> Result<(), CliError> {
        let config = self.config(cli.database.clone());
        config.validate()?;
        let credentials = self.credentials()?;
        let site = self.site();

        if let Some(addr) = self.metrics_addr {
            init_metrics(addr).await?;
        }

        info!(
            base_url = %site.base_url,
            sessions = config.concurrent_sessions,
            pages_per_session = config.pages_per_session,
            requests_per_minute = config.requests_per_minute,
            download_assets = config.download_assets,
            database = %config.database_path.display(),
            "Starting crawl"
        );

        let store = cli.open_store()?;
        let browser = Arc::new(HttpBrowser::new(site.clone())?);
        let fetcher = Arc::new(HttpAssetFetcher::new(&site.user_agent)?);
        let orchestrator =
            Orchestrator::new(config, store, browser, fetcher, credentials, shutdown);
        let summary = orchestrator.run(self.resume).await?;

        print_summary(&summary, cli.output_format)
    }
}

fn print_summary(summary: &CrawlSummary, format: OutputFormat) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(summary)?);
        }
        OutputFormat::Human => {
            let stats = &summary.stats;
            println!("Crawl finished: {:?}", summary.end);
            println!("  Pages committed:     {}", stats.pages_committed);
            println!("  Pages failed:        {}", stats.pages_failed);
            println!(
                "  Records:             {} found, {} new, {} merged, {} already stored",
                stats.records_found, stats.records_new, stats.records_merged, stats.duplicates_skipped
            );
            println!(
                "  Assets:              {} stored ({} deduplicated), {} bytes",
                stats.assets_stored, stats.assets_deduplicated, stats.bytes_stored
            );
            println!("  Downloads failed:    {}", stats.downloads_failed);
            println!("  Re-authentications:  {}", summary.reauthentications);
            println!(
                "  Next page:           {}{}",
                summary.cursor.next_page,
                summary
                    .cursor
                    .total_pages
                    .map(|total| format!(" of {total}"))
                    .unwrap_or_default()
            );
            if let Some(error) = &summary.last_error {
                println!("  Last error:          {error}");
            }
        }
    }
    Ok(())
}
