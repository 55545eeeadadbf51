//! CLI command implementations

pub mod crawl;
pub mod error;
pub mod export;
pub mod reset;
pub mod status;

pub use crawl::CrawlArgs;
pub use error::CliError;
pub use export::ExportArgs;
pub use reset::ResetArgs;
pub use status::StatusArgs;

use crate::resume::ProgressStore;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Human-readable output
    Human,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "human" => Ok(OutputFormat::Human),
            _ => Err(format!("Invalid output format: {s}")),
        }
    }
}

/// Catalog crawler CLI
#[derive(Parser, Debug)]
#[command(name = "catalog-crawler")]
#[command(about = "Crawl an authenticated catalog, store its metadata and download its assets", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Progress store location
    #[arg(long, global = true, env = "CATALOG_DB", default_value = "./catalog_progress.db")]
    pub database: PathBuf,

    /// Output format (json or human)
    #[arg(long, global = true, default_value = "human")]
    pub output_format: OutputFormat,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl the catalog (resumes from the stored cursor by default)
    Crawl(CrawlArgs),
    /// Show progress store statistics
    Status(StatusArgs),
    /// Export stored records to CSV
    Export(ExportArgs),
    /// Rewind the cursor or re-arm failed downloads
    Reset(ResetArgs),
}

impl Cli {
    /// Open the progress store named by `--database`.
    pub(crate) fn open_store(&self) -> Result<ProgressStore, CliError> {
        if let Some(parent) = self.database.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CliError::InvalidArgument(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(ProgressStore::open(&self.database)?)
    }
}

/// Parse a strictly positive integer argument.
pub(crate) fn parse_positive<T>(s: &str) -> Result<T, String>
where
    T: FromStr + PartialEq + Default,
{
    let value: T = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if value == T::default() {
        return Err("value must be at least 1".to_string());
    }
    Ok(value)
}
