//! Durable crawl state on SQLite.
//!
//! All statements run on one dedicated thread that owns the connection;
//! async callers hand it closures through [`ProgressStore::execute`] and await
//! the reply. Every mutating operation is a single transaction, so a page's
//! record upserts and its cursor advance land together or not at all.

use super::migrations::run_migrations;
use crate::record::{CatalogRecord, PageCursor, RecordStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Progress store errors. Always fatal for the operation that hit them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite failure
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema migration failure
    #[error("migration error: {0}")]
    Migration(String),

    /// Stored JSON column could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row violates the data model
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Update targeted a record that does not exist
    #[error("unknown record: {0}")]
    UnknownRecord(String),

    /// Filesystem failure while preparing the database location
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store thread is gone
    #[error("progress store worker unavailable: {0}")]
    WorkerGone(String),
}

/// How a committed page was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// Page carried items
    Items,
    /// Page was empty but not terminal
    Empty,
    /// Page carried the end-of-catalog signature
    EndOfCatalog,
    /// Page content could not be extracted; skipped
    Skipped,
}

impl PageOutcome {
    /// Stable string used in the store and in metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Items => "items",
            Self::Empty => "empty",
            Self::EndOfCatalog => "end_of_catalog",
            Self::Skipped => "skipped",
        }
    }
}

/// Everything a page contributes, committed atomically.
#[derive(Debug, Clone)]
pub struct PageCommit {
    /// Page number (1-based)
    pub page: u32,
    /// Classification
    pub outcome: PageOutcome,
    /// Extracted candidates, in page order
    pub records: Vec<CatalogRecord>,
    /// Total page count if the page revealed it
    pub total_pages: Option<u32>,
}

/// Result of [`ProgressStore::commit_page`].
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    /// Identifiers seen for the first time
    pub inserted: u64,
    /// Existing, not yet downloaded records whose metadata was refreshed
    pub merged: u64,
    /// Candidates dropped because their asset is already stored
    pub skipped_downloaded: u64,
    /// Records that need their asset fetched, one per identifier
    pub to_download: Vec<CatalogRecord>,
    /// Cursor after the commit
    pub cursor: PageCursor,
}

/// Aggregate counts for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// All records
    pub total: u64,
    /// Records with a stored asset
    pub downloaded: u64,
    /// Records awaiting download
    pub pending: u64,
    /// Records whose download failed permanently
    pub failed: u64,
    /// Distinct asset files
    pub assets: u64,
    /// Pages committed
    pub committed_pages: u64,
}

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Handle to the progress store. Cheap to clone.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<StoreInner>,
    path: Option<Arc<PathBuf>>,
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore").field("path", &self.path).finish()
    }
}

impl ProgressStore {
    /// Open (or create) the store at `path` and run migrations.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let for_thread = path.clone();
        let store = Self::spawn(move || Connection::open(&for_thread), Some(path))?;
        if let Some(path) = &store.path {
            info!(path = %path.display(), "Progress store opened");
        }
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::spawn(Connection::open_in_memory, None)
    }

    fn spawn<F>(open: F, path: Option<PathBuf>) -> Result<Self, StoreError>
    where
        F: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), StoreError>>();

        let worker = thread::Builder::new()
            .name("catalog-store".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(conn) => conn,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.into()));
                        return;
                    }
                };
                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                let init = run_migrations(&mut conn).and_then(|_| ensure_cursor_row(&conn));
                if ready_tx.send(init).is_err() {
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }
                debug!("Store thread shutting down");
            })?;

        ready_rx
            .recv()
            .map_err(|_| StoreError::WorkerGone("exited before signalling readiness".into()))??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            path: path.map(Arc::new),
        })
    }

    /// Database location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref().map(PathBuf::as_path)
    }

    /// Run `task` on the store thread and await its result.
    pub async fn execute<F, T>(&self, task: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                debug!("Store caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|e| StoreError::WorkerGone(e.to_string()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::WorkerGone("store thread terminated".into()))?
    }

    /// Current cursor.
    pub async fn load_cursor(&self) -> Result<PageCursor, StoreError> {
        self.execute(|conn| read_cursor(conn)).await
    }

    /// Apply a page's full effect in one transaction.
    ///
    /// Candidates are deduplicated by external identifier in page order, so a
    /// later occurrence refreshes an earlier one. Already downloaded records
    /// are left untouched, pending ones are merged and requeued, permanently
    /// failed ones are merged but not requeued. The cursor advances over the
    /// contiguous prefix of committed pages.
    pub async fn commit_page(&self, commit: PageCommit) -> Result<CommitSummary, StoreError> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now();
            let mut summary = CommitSummary::default();
            let mut queued: BTreeMap<String, CatalogRecord> = BTreeMap::new();

            for candidate in &commit.records {
                match load_record(&tx, &candidate.external_id)? {
                    None => {
                        insert_record(&tx, candidate, commit.page, now)?;
                        summary.inserted += 1;
                        if candidate.asset_url().is_some() {
                            queued.insert(candidate.external_id.clone(), candidate.clone());
                        }
                    }
                    Some(existing) if existing.downloaded => {
                        summary.skipped_downloaded += 1;
                    }
                    Some(mut existing) => {
                        existing.merge_metadata(candidate);
                        update_metadata(&tx, &existing, now)?;
                        summary.merged += 1;
                        if existing.status == RecordStatus::Pending
                            && existing.asset_url().is_some()
                        {
                            queued.insert(existing.external_id.clone(), existing);
                        }
                    }
                }
            }

            tx.execute(
                "INSERT OR REPLACE INTO committed_pages (page, outcome, item_count, committed_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    commit.page,
                    commit.outcome.as_str(),
                    commit.records.len() as i64,
                    now.to_rfc3339()
                ],
            )?;
            summary.cursor = advance_cursor(&tx, &commit, now)?;
            tx.commit()?;

            summary.to_download = queued.into_values().collect();
            Ok(summary)
        })
        .await
    }

    /// Record a stored asset and point the record at it.
    ///
    /// If another record already registered the same content hash, the
    /// earlier path wins and is returned.
    pub async fn mark_downloaded(
        &self,
        external_id: &str,
        path: &Path,
        content_hash: &str,
        size_bytes: u64,
    ) -> Result<PathBuf, StoreError> {
        let external_id = external_id.to_string();
        let path = path.to_string_lossy().into_owned();
        let content_hash = content_hash.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "INSERT OR IGNORE INTO assets (content_hash, path, size_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![content_hash, path, size_bytes as i64, now],
            )?;
            let canonical: String = tx.query_row(
                "SELECT path FROM assets WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )?;
            let updated = tx.execute(
                "UPDATE records
                 SET downloaded = 1,
                     status = 'stored',
                     local_path = ?1,
                     content_hash = ?2,
                     download_attempts = download_attempts + 1,
                     last_error = NULL,
                     updated_at = ?3
                 WHERE external_id = ?4",
                params![canonical, content_hash, now, external_id],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownRecord(external_id));
            }
            tx.commit()?;
            Ok(PathBuf::from(canonical))
        })
        .await
    }

    /// Count a failed download attempt; returns the attempts so far.
    pub async fn record_download_failure(
        &self,
        external_id: &str,
        error: &str,
        permanent: bool,
    ) -> Result<u32, StoreError> {
        let external_id = external_id.to_string();
        let error = error.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE records
                 SET download_attempts = download_attempts + 1,
                     last_error = ?1,
                     status = CASE WHEN ?2 THEN 'failed_permanent' ELSE status END,
                     updated_at = ?3
                 WHERE external_id = ?4 AND downloaded = 0",
                params![error, permanent, Utc::now().to_rfc3339(), external_id],
            )?;
            if updated == 0 {
                return Err(StoreError::UnknownRecord(external_id));
            }
            let attempts: i64 = tx.query_row(
                "SELECT download_attempts FROM records WHERE external_id = ?1",
                params![external_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            to_u32(attempts)
        })
        .await
    }

    /// Path of a stored asset with this content hash.
    pub async fn find_asset(&self, content_hash: &str) -> Result<Option<PathBuf>, StoreError> {
        let content_hash = content_hash.to_string();
        self.execute(move |conn| {
            let path: Option<String> = conn
                .query_row(
                    "SELECT path FROM assets WHERE content_hash = ?1",
                    params![content_hash],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(path.map(PathBuf::from))
        })
        .await
    }

    /// Drop an asset row whose file is gone.
    pub async fn forget_asset(&self, content_hash: &str) -> Result<(), StoreError> {
        let content_hash = content_hash.to_string();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM assets WHERE content_hash = ?1",
                params![content_hash],
            )?;
            Ok(())
        })
        .await
    }

    /// Put a downloaded record back to pending (file missing or corrupt).
    pub async fn demote_download(&self, external_id: &str, reason: &str) -> Result<(), StoreError> {
        let external_id = external_id.to_string();
        let reason = reason.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE records
                 SET downloaded = 0,
                     status = 'pending',
                     local_path = NULL,
                     content_hash = NULL,
                     last_error = ?1,
                     updated_at = ?2
                 WHERE external_id = ?3",
                params![reason, Utc::now().to_rfc3339(), external_id],
            )?;
            Ok(())
        })
        .await
    }

    /// One record by external identifier.
    pub async fn get(&self, external_id: &str) -> Result<Option<CatalogRecord>, StoreError> {
        let external_id = external_id.to_string();
        self.execute(move |conn| load_record(conn, &external_id)).await
    }

    /// Records still waiting for their asset.
    pub async fn pending_downloads(&self) -> Result<Vec<CatalogRecord>, StoreError> {
        self.query_records(
            "WHERE status = 'pending'
               AND (image_url IS NOT NULL OR thumbnail_url IS NOT NULL)
             ORDER BY created_at, external_id",
        )
        .await
    }

    /// Records marked downloaded.
    pub async fn downloaded_records(&self) -> Result<Vec<CatalogRecord>, StoreError> {
        self.query_records("WHERE downloaded = 1 ORDER BY external_id")
            .await
    }

    /// Every record, oldest first.
    pub async fn all_records(&self) -> Result<Vec<CatalogRecord>, StoreError> {
        self.query_records("ORDER BY created_at, external_id").await
    }

    async fn query_records(&self, clause: &'static str) -> Result<Vec<CatalogRecord>, StoreError> {
        self.execute(move |conn| {
            let sql = format!("SELECT {RECORD_COLUMNS} FROM records {clause}");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_record(row)?);
            }
            Ok(out)
        })
        .await
    }

    /// Aggregate counts.
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.execute(|conn| {
            let (total, downloaded, pending, failed): (i64, i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(downloaded), 0),
                        COALESCE(SUM(status = 'pending'), 0),
                        COALESCE(SUM(status = 'failed_permanent'), 0)
                 FROM records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;
            let assets: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
            let committed_pages: i64 =
                conn.query_row("SELECT COUNT(*) FROM committed_pages", [], |row| row.get(0))?;
            Ok(StoreStats {
                total: total as u64,
                downloaded: downloaded as u64,
                pending: pending as u64,
                failed: failed as u64,
                assets: assets as u64,
                committed_pages: committed_pages as u64,
            })
        })
        .await
    }

    /// Rewind the cursor to page 1. Records are kept.
    pub async fn reset_cursor(&self) -> Result<(), StoreError> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM committed_pages", [])?;
            write_cursor(&tx, &PageCursor::default(), Utc::now())?;
            tx.commit()?;
            info!("Crawl cursor reset to page 1");
            Ok(())
        })
        .await
    }

    /// Re-arm permanently failed downloads; returns how many were reset.
    pub async fn reset_failed(&self) -> Result<usize, StoreError> {
        self.execute(|conn| {
            let count = conn.execute(
                "UPDATE records
                 SET status = 'pending', download_attempts = 0, last_error = NULL, updated_at = ?1
                 WHERE status = 'failed_permanent'",
                params![Utc::now().to_rfc3339()],
            )?;
            Ok(count)
        })
        .await
    }
}

const RECORD_COLUMNS: &str = "external_id, title, description, image_url, thumbnail_url, \
     local_path, content_hash, tags, attributes, created_at, downloaded, download_attempts, \
     status, last_error";

fn ensure_cursor_row(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO crawl_cursor (id, next_page, total_pages, finished, updated_at)
         VALUES (1, 1, NULL, 0, ?1)",
        params![Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn read_cursor(conn: &Connection) -> Result<PageCursor, StoreError> {
    let (next_page, total_pages, finished): (i64, Option<i64>, bool) = conn.query_row(
        "SELECT next_page, total_pages, finished FROM crawl_cursor WHERE id = 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(PageCursor {
        next_page: to_u32(next_page)?,
        total_pages: total_pages.map(to_u32).transpose()?,
        finished,
    })
}

fn write_cursor(conn: &Connection, cursor: &PageCursor, now: DateTime<Utc>) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE crawl_cursor
         SET next_page = ?1, total_pages = ?2, finished = ?3, updated_at = ?4
         WHERE id = 1",
        params![
            cursor.next_page,
            cursor.total_pages,
            cursor.finished,
            now.to_rfc3339()
        ],
    )?;
    Ok(())
}

fn advance_cursor(
    tx: &Transaction<'_>,
    commit: &PageCommit,
    now: DateTime<Utc>,
) -> Result<PageCursor, StoreError> {
    let mut cursor = read_cursor(tx)?;
    if let Some(total) = commit.total_pages {
        cursor.total_pages = Some(cursor.total_pages.map_or(total, |known| known.max(total)));
    }
    if commit.outcome == PageOutcome::EndOfCatalog {
        cursor.total_pages = Some(commit.page);
    }

    let mut committed = tx.prepare("SELECT 1 FROM committed_pages WHERE page = ?1")?;
    while committed.exists(params![cursor.next_page])? {
        cursor.next_page += 1;
    }
    cursor.finished = matches!(cursor.total_pages, Some(total) if cursor.next_page > total);

    write_cursor(tx, &cursor, now)?;
    Ok(cursor)
}

fn load_record(conn: &Connection, external_id: &str) -> Result<Option<CatalogRecord>, StoreError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM records WHERE external_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![external_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_record(row)?)),
        None => Ok(None),
    }
}

fn insert_record(
    conn: &Connection,
    record: &CatalogRecord,
    page: u32,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO records (external_id, title, description, image_url, thumbnail_url,
                              tags, attributes, created_at, updated_at, downloaded,
                              download_attempts, status, source_page)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, 'pending', ?10)",
        params![
            record.external_id,
            record.title,
            record.description,
            record.image_url,
            record.thumbnail_url,
            serde_json::to_string(&record.tags)?,
            serde_json::to_string(&record.attributes)?,
            record.created_at.to_rfc3339(),
            now.to_rfc3339(),
            page,
        ],
    )?;
    Ok(())
}

fn update_metadata(
    conn: &Connection,
    record: &CatalogRecord,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE records
         SET title = ?1, description = ?2, image_url = ?3, thumbnail_url = ?4,
             tags = ?5, attributes = ?6, updated_at = ?7
         WHERE external_id = ?8",
        params![
            record.title,
            record.description,
            record.image_url,
            record.thumbnail_url,
            serde_json::to_string(&record.tags)?,
            serde_json::to_string(&record.attributes)?,
            now.to_rfc3339(),
            record.external_id,
        ],
    )?;
    Ok(())
}

fn read_record(row: &Row<'_>) -> Result<CatalogRecord, StoreError> {
    let tags: String = row.get(7)?;
    let attributes: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let status: String = row.get(12)?;
    let attempts: i64 = row.get(11)?;

    Ok(CatalogRecord {
        external_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        image_url: row.get(3)?,
        thumbnail_url: row.get(4)?,
        local_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        content_hash: row.get(6)?,
        tags: serde_json::from_str::<BTreeSet<String>>(&tags)?,
        attributes: serde_json::from_str::<BTreeMap<String, String>>(&attributes)?,
        created_at: parse_datetime(&created_at)?,
        downloaded: row.get(10)?,
        download_attempts: to_u32(attempts)?,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown record status '{status}'")))?,
        last_error: row.get(13)?,
    })
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("invalid datetime '{value}': {err}")))
}

fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("value {value} out of range")))
}
