//! Reset command implementation

use super::{Cli, CliError, OutputFormat};
use crate::resume::CrawlLock;
use clap::Args;
use serde_json::json;
use tracing::info;

/// Arguments for `reset`
#[derive(Args, Debug, Clone)]
#[command(group = clap::ArgGroup::new("target").required(true).multiple(true))]
pub struct ResetArgs {
    /// Rewind the page cursor to page 1 (records are kept)
    #[arg(long, group = "target")]
    pub cursor: bool,

    /// Put permanently failed downloads back to pending
    #[arg(long, group = "target")]
    pub failed: bool,
}

impl ResetArgs {
    /// Execute the reset command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = cli.open_store()?;
        let _lock = CrawlLock::try_acquire(&cli.database).map_err(|e| {
            CliError::InvalidArgument(format!("cannot reset while a crawl is running: {e}"))
        })?;

        if self.cursor {
            store.reset_cursor().await?;
            info!("Page cursor reset to page 1");
        }
        let rearmed = if self.failed {
            let count = store.reset_failed().await?;
            info!(count, "Failed downloads re-armed");
            Some(count)
        } else {
            None
        };

        match cli.output_format {
            OutputFormat::Json => {
                let output = json!({ "cursor_reset": self.cursor, "failed_rearmed": rearmed });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Human => {
                if self.cursor {
                    println!("Cursor reset to page 1");
                }
                if let Some(count) = rearmed {
                    println!("Re-armed {count} failed downloads");
                }
            }
        }
        Ok(())
    }
}
