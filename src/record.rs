//! Catalog data model: records, raw item descriptors and the page cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// One raw item as handed over by the rendering collaborator.
pub type RawItem = serde_json::Map<String, serde_json::Value>;

/// Download lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Extracted, asset not stored yet
    Pending,
    /// Asset stored (written or deduplicated)
    Stored,
    /// Asset download exhausted its attempts or hit a permanent error
    FailedPermanent,
}

impl RecordStatus {
    /// Stable string used in the progress store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Stored => "stored",
            Self::FailedPermanent => "failed_permanent",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "stored" => Some(Self::Stored),
            "failed_permanent" => Some(Self::FailedPermanent),
            _ => None,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scraped catalog item.
///
/// `external_id` is the unique key. A record with `downloaded == true`
/// always carries a `local_path` whose content hash equals `content_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    /// Stable identifier assigned by the catalog
    pub external_id: String,
    /// Display title
    pub title: Option<String>,
    /// Free-text description
    pub description: Option<String>,
    /// Full-size image URL
    pub image_url: Option<String>,
    /// Thumbnail URL
    pub thumbnail_url: Option<String>,
    /// Where the asset lives on disk once stored
    pub local_path: Option<PathBuf>,
    /// SHA-256 of the stored asset, lowercase hex
    pub content_hash: Option<String>,
    /// Open-ended tag set
    pub tags: BTreeSet<String>,
    /// Open-ended attributes (film title, director, year, ...)
    pub attributes: BTreeMap<String, String>,
    /// When the record was first seen
    pub created_at: DateTime<Utc>,
    /// Whether the asset is stored on disk
    pub downloaded: bool,
    /// Download attempts so far
    pub download_attempts: u32,
    /// Download lifecycle state
    pub status: RecordStatus,
    /// Last download error, if any
    pub last_error: Option<String>,
}

impl CatalogRecord {
    /// Fresh, not-yet-downloaded record.
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            title: None,
            description: None,
            image_url: None,
            thumbnail_url: None,
            local_path: None,
            content_hash: None,
            tags: BTreeSet::new(),
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
            downloaded: false,
            download_attempts: 0,
            status: RecordStatus::Pending,
            last_error: None,
        }
    }

    /// URL to download: the full image, falling back to the thumbnail.
    pub fn asset_url(&self) -> Option<&str> {
        self.image_url
            .as_deref()
            .or(self.thumbnail_url.as_deref())
            .filter(|url| !url.is_empty())
    }

    /// Refresh metadata from a later extraction of the same item.
    ///
    /// Download bookkeeping (`downloaded`, path, hash, attempts, status) and
    /// `created_at` are kept; descriptive fields take the newer values.
    pub fn merge_metadata(&mut self, newer: &CatalogRecord) {
        if newer.title.is_some() {
            self.title = newer.title.clone();
        }
        if newer.description.is_some() {
            self.description = newer.description.clone();
        }
        if newer.image_url.is_some() {
            self.image_url = newer.image_url.clone();
        }
        if newer.thumbnail_url.is_some() {
            self.thumbnail_url = newer.thumbnail_url.clone();
        }
        self.tags.extend(newer.tags.iter().cloned());
        for (key, value) in &newer.attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }
}

/// Position of the crawl in the catalog.
///
/// `next_page` is the lowest page whose effects have not been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Next page to process (1-based)
    pub next_page: u32,
    /// Total page count, once the catalog has revealed it
    pub total_pages: Option<u32>,
    /// End of catalog reached
    pub finished: bool,
}

impl Default for PageCursor {
    fn default() -> Self {
        Self {
            next_page: 1,
            total_pages: None,
            finished: false,
        }
    }
}
