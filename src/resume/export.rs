//! CSV export of scraped metadata.

use super::store::{ProgressStore, StoreError};
use crate::record::CatalogRecord;
use csv::Writer;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

/// Export errors
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Reading records failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Writing the CSV failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Creating the file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Attribute map could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    external_id: &'a str,
    title: &'a str,
    description: &'a str,
    image_url: &'a str,
    thumbnail_url: &'a str,
    local_path: String,
    content_hash: &'a str,
    tags: String,
    attributes: String,
    created_at: String,
    downloaded: bool,
    download_attempts: u32,
    status: &'static str,
    last_error: &'a str,
}

impl<'a> ExportRow<'a> {
    fn from_record(record: &'a CatalogRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            external_id: &record.external_id,
            title: record.title.as_deref().unwrap_or_default(),
            description: record.description.as_deref().unwrap_or_default(),
            image_url: record.image_url.as_deref().unwrap_or_default(),
            thumbnail_url: record.thumbnail_url.as_deref().unwrap_or_default(),
            local_path: record
                .local_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            content_hash: record.content_hash.as_deref().unwrap_or_default(),
            tags: record.tags.iter().cloned().collect::<Vec<_>>().join(";"),
            attributes: serde_json::to_string(&record.attributes)?,
            created_at: record.created_at.to_rfc3339(),
            downloaded: record.downloaded,
            download_attempts: record.download_attempts,
            status: record.status.as_str(),
            last_error: record.last_error.as_deref().unwrap_or_default(),
        })
    }
}

/// Write `records` as CSV, calling `on_row` after each row.
pub fn write_records<W: Write>(
    out: W,
    records: &[CatalogRecord],
    mut on_row: impl FnMut(usize),
) -> Result<usize, ExportError> {
    let mut writer = Writer::from_writer(out);
    for (index, record) in records.iter().enumerate() {
        writer.serialize(ExportRow::from_record(record)?)?;
        on_row(index + 1);
    }
    writer.flush()?;
    Ok(records.len())
}

/// Export every record in the store to `path`.
pub async fn export_csv(
    store: &ProgressStore,
    path: &Path,
    on_row: impl FnMut(usize),
) -> Result<usize, ExportError> {
    let records = store.all_records().await?;
    let file = BufWriter::new(File::create(path)?);
    let written = write_records(file, &records, on_row)?;
    info!(path = %path.display(), records = written, "Exported records to CSV");
    Ok(written)
}
