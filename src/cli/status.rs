//! Status command implementation

use super::{Cli, CliError, OutputFormat};
use clap::Args;
use serde_json::json;

/// Arguments for `status`
#[derive(Args, Debug, Clone, Default)]
pub struct StatusArgs {}

impl StatusArgs {
    /// Execute the status command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = cli.open_store()?;
        let stats = store.stats().await?;
        let cursor = store.load_cursor().await?;

        match cli.output_format {
            OutputFormat::Json => {
                let output = json!({
                    "database": cli.database,
                    "records": {
                        "total": stats.total,
                        "downloaded": stats.downloaded,
                        "pending": stats.pending,
                        "failed": stats.failed,
                    },
                    "assets": stats.assets,
                    "committed_pages": stats.committed_pages,
                    "cursor": cursor,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Human => {
                println!("Progress store: {}", cli.database.display());
                println!("  Records:          {}", stats.total);
                println!("    downloaded:     {}", stats.downloaded);
                println!("    pending:        {}", stats.pending);
                println!("    failed:         {}", stats.failed);
                println!("  Distinct assets:  {}", stats.assets);
                println!("  Committed pages:  {}", stats.committed_pages);
                let total = cursor
                    .total_pages
                    .map(|total| total.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                println!(
                    "  Cursor:           next page {} of {}{}",
                    cursor.next_page,
                    total,
                    if cursor.finished { " (finished)" } else { "" }
                );
            }
        }
        Ok(())
    }
}
