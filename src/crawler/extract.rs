//! Turns raw item descriptors into catalog records and commits them.
//!
//! Field mapping is deliberately loose: identifiers, URLs and tags are read
//! from their common spellings, and everything else lands in the open-ended
//! attribute map under a normalized snake_case key.

use crate::browser::PageContent;
use crate::record::{CatalogRecord, RawItem};
use crate::resume::{CommitSummary, PageCommit, PageOutcome, ProgressStore, StoreError};
use super::pagination::PageClass;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const ID_KEYS: &[&str] = &["external_id", "id", "shotdeck_id", "shot_id"];
const TITLE_KEYS: &[&str] = &["title", "name"];
const DESCRIPTION_KEYS: &[&str] = &["description", "caption"];
const IMAGE_KEYS: &[&str] = &["image_url", "full_image_url", "image", "src"];
const THUMBNAIL_KEYS: &[&str] = &["thumbnail_url", "thumbnail", "thumb"];
const TAG_KEYS: &[&str] = &["tags", "keywords"];
const NESTED_KEYS: &[&str] = &["metadata", "attributes", "details"];

/// Extraction errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    /// The page had items but none could be turned into a record
    #[error("page {page}: none of {count} items carried an identifier")]
    NoValidItems {
        /// Page number
        page: u32,
        /// Items on the page
        count: usize,
    },
}

/// Errors that stop the pipeline for a page.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Committing failed; fatal
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of processing one page.
#[derive(Debug, Clone)]
pub struct ProcessedPage {
    /// Store-side result of the commit
    pub summary: CommitSummary,
    /// Records found on the page
    pub found: u64,
    /// Items dropped for lack of an identifier
    pub rejected: u64,
    /// Set when the page was committed as skipped
    pub extraction_error: Option<ExtractionError>,
}

/// Per-page extraction and deduplicating commit.
#[derive(Debug, Clone)]
pub struct ExtractionPipeline {
    store: ProgressStore,
}

impl ExtractionPipeline {
    /// Pipeline committing into `store`.
    pub fn new(store: ProgressStore) -> Self {
        Self { store }
    }

    /// Extract `content` and commit the page atomically.
    ///
    /// An unreadable page is logged and committed as skipped so the cursor
    /// can move past it; only store failures are returned.
    pub async fn process(
        &self,
        page: u32,
        class: PageClass,
        content: &PageContent,
    ) -> Result<ProcessedPage, PipelineError> {
        let (records, rejected, extraction_error) = match extract_records(page, &content.items) {
            Ok((records, rejected)) => (records, rejected, None),
            Err(e) => {
                warn!(page, error = %e, "Skipping page with unreadable content");
                (Vec::new(), content.items.len(), Some(e))
            }
        };

        let outcome = match (class, &extraction_error) {
            (PageClass::EndOfCatalog, _) => PageOutcome::EndOfCatalog,
            (_, Some(_)) => PageOutcome::Skipped,
            (PageClass::Items, None) => PageOutcome::Items,
            (PageClass::Empty, None) => PageOutcome::Empty,
        };
        let found = records.len() as u64;

        let summary = self
            .store
            .commit_page(PageCommit {
                page,
                outcome,
                records,
                total_pages: content.total_pages,
            })
            .await?;
        debug!(
            page,
            found,
            inserted = summary.inserted,
            merged = summary.merged,
            skipped = summary.skipped_downloaded,
            "Page committed"
        );

        Ok(ProcessedPage {
            summary,
            found,
            rejected: rejected as u64,
            extraction_error,
        })
    }

    /// Commit a page whose content could not be read at all.
    pub async fn skip(&self, page: u32, reason: &str) -> Result<ProcessedPage, PipelineError> {
        warn!(page, reason, "Skipping unreadable page");
        let summary = self
            .store
            .commit_page(PageCommit {
                page,
                outcome: PageOutcome::Skipped,
                records: Vec::new(),
                total_pages: None,
            })
            .await?;
        Ok(ProcessedPage {
            summary,
            found: 0,
            rejected: 0,
            extraction_error: None,
        })
    }
}

/// Map raw items to records; items without an identifier are dropped.
pub fn extract_records(
    page: u32,
    items: &[RawItem],
) -> Result<(Vec<CatalogRecord>, usize), ExtractionError> {
    let mut records = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        match record_from_item(item) {
            Some(record) => records.push(record),
            None => rejected += 1,
        }
    }
    if rejected > 0 {
        warn!(page, rejected, "Dropped items without an identifier");
    }
    if records.is_empty() && !items.is_empty() {
        return Err(ExtractionError::NoValidItems {
            page,
            count: items.len(),
        });
    }
    Ok((records, rejected))
}

/// Map one raw item, or `None` if it has no usable identifier.
pub fn record_from_item(item: &RawItem) -> Option<CatalogRecord> {
    let external_id = first_text(item, ID_KEYS)?;
    let mut record = CatalogRecord::new(external_id);
    record.title = first_text(item, TITLE_KEYS);
    record.description = first_text(item, DESCRIPTION_KEYS);
    record.image_url = first_text(item, IMAGE_KEYS);
    record.thumbnail_url = first_text(item, THUMBNAIL_KEYS);

    for key in TAG_KEYS {
        match item.get(*key) {
            Some(Value::Array(values)) => {
                record.tags.extend(values.iter().filter_map(scalar_text));
            }
            Some(Value::String(joined)) => {
                record.tags.extend(
                    joined
                        .split(',')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string),
                );
            }
            _ => {}
        }
    }

    let known: Vec<&str> = [
        ID_KEYS,
        TITLE_KEYS,
        DESCRIPTION_KEYS,
        IMAGE_KEYS,
        THUMBNAIL_KEYS,
        TAG_KEYS,
        NESTED_KEYS,
    ]
    .concat();
    let mut attributes = BTreeMap::new();
    for (key, value) in item {
        if !known.contains(&key.as_str()) {
            insert_attribute(&mut attributes, key, value);
        }
    }
    for nested in NESTED_KEYS {
        if let Some(Value::Object(map)) = item.get(*nested) {
            for (key, value) in map {
                insert_attribute(&mut attributes, key, value);
            }
        }
    }
    record.attributes = attributes;
    Some(record)
}

fn first_text(item: &RawItem, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| item.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn insert_attribute(attributes: &mut BTreeMap<String, String>, key: &str, value: &Value) {
    let key = normalize_key(key);
    if key.is_empty() {
        return;
    }
    let text = match value {
        Value::Null => return,
        Value::Array(values) => {
            let parts: Vec<String> = values.iter().filter_map(scalar_text).collect();
            if parts.is_empty() {
                return;
            }
            parts.join(", ")
        }
        Value::Object(_) => value.to_string(),
        scalar => match scalar_text(scalar) {
            Some(text) => text,
            None => return,
        },
    };
    attributes.insert(key, text);
}

/// Lowercase snake_case key: `"Director:"` becomes `director`,
/// `"Film Title"` becomes `film_title`.
pub fn normalize_key(label: &str) -> String {
    let mut key = String::with_capacity(label.len());
    for ch in label.trim().trim_end_matches(':').chars() {
        if ch.is_alphanumeric() {
            key.extend(ch.to_lowercase());
        } else if !key.ends_with('_') && !key.is_empty() {
            key.push('_');
        }
    }
    while key.ends_with('_') {
        key.pop();
    }
    key
}
