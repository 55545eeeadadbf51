//! Export command implementation

use super::{Cli, CliError, OutputFormat};
use crate::resume::export_csv;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::PathBuf;

/// Arguments for `export`
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Destination CSV file
    #[arg(long, short)]
    pub output: PathBuf,
}

impl ExportArgs {
    /// Execute the export command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let store = cli.open_store()?;
        let total = store.stats().await?.total;

        let progress = match cli.output_format {
            OutputFormat::Human => create_progress_bar(total)?,
            OutputFormat::Json => ProgressBar::hidden(),
        };
        let written = export_csv(&store, &self.output, |row| progress.set_position(row as u64)).await?;
        progress.finish_with_message("done");

        match cli.output_format {
            OutputFormat::Json => {
                let output = json!({ "output": self.output, "records": written });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Human => {
                println!("Exported {written} records to {}", self.output.display());
            }
        }
        Ok(())
    }
}

fn create_progress_bar(total: u64) -> Result<ProgressBar, CliError> {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        .map_err(|e| CliError::ConfigurationError(format!("invalid progress template: {e}")))?
        .progress_chars("#>-");
    let pb = ProgressBar::new(total);
    pb.set_style(style);
    pb.set_message("exporting records");
    Ok(pb)
}
