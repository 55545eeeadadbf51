//! Download manager
//!
//! Every asset goes through the same steps:
//!
//! 1. fetch the body (bounded by a semaphore of `concurrent_downloads` permits)
//! 2. hash it and write it to a temporary file under the staging directory
//! 3. under the placement lock, either reuse the file already registered for
//!    that hash or move the staged file to `{assets}/{hash[..2]}/{hash}.{ext}`
//! 4. mark the record downloaded
//!
//! A staged file is never moved into place once shutdown has been requested,
//! and a record is only marked downloaded after its file exists.

use super::config::{calculate_backoff, extension_for, MAX_ASSET_BYTES, STAGING_DIR};
use super::{AssetFetcher, DownloadError};
use crate::config::CrawlConfig;
use crate::crawler::progress::CrawlStats;
use crate::metrics;
use crate::record::CatalogRecord;
use crate::resume::{ProgressStore, StoreError};
use crate::shutdown::SharedShutdown;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// One record's asset to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Owning record
    pub external_id: String,
    /// Asset URL (image, or thumbnail fallback)
    pub url: String,
    /// Attempts already spent in earlier runs
    pub prior_attempts: u32,
}

impl DownloadTask {
    /// Task for `record`, or `None` if it has no asset URL.
    pub fn from_record(record: &CatalogRecord) -> Option<Self> {
        Some(Self {
            external_id: record.external_id.clone(),
            url: record.asset_url()?.to_string(),
            prior_attempts: record.download_attempts,
        })
    }
}

struct Stored {
    path: PathBuf,
    deduplicated: bool,
    size: u64,
}

struct Inner {
    store: ProgressStore,
    fetcher: Arc<dyn AssetFetcher>,
    assets_dir: PathBuf,
    staging_dir: PathBuf,
    max_attempts: u32,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    placement: tokio::sync::Mutex<()>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: SharedShutdown,
    stats: Arc<CrawlStats>,
    fatal: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes the record from the in-flight set when its task ends.
struct InFlight {
    inner: Arc<Inner>,
    external_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.external_id);
    }
}

/// Concurrent, deduplicating asset downloader.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("assets_dir", &self.inner.assets_dir)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl DownloadManager {
    /// Manager storing assets under `config.assets_dir`.
    pub fn new(
        store: ProgressStore,
        fetcher: Arc<dyn AssetFetcher>,
        config: &CrawlConfig,
        shutdown: SharedShutdown,
        stats: Arc<CrawlStats>,
    ) -> Self {
        let assets_dir = config.assets_dir.clone();
        let staging_dir = assets_dir.join(STAGING_DIR);
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                assets_dir,
                staging_dir,
                max_attempts: config.max_download_attempts,
                permits: Arc::new(Semaphore::new(config.concurrent_downloads)),
                in_flight: Mutex::new(HashSet::new()),
                placement: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(JoinSet::new()),
                shutdown,
                stats,
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Root directory of stored assets.
    pub fn assets_dir(&self) -> &Path {
        &self.inner.assets_dir
    }

    /// Downloads queued or running.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Set when a store failure stopped a download; the crawl must stop.
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.inner.fatal).clone()
    }

    /// Remove leftovers of interrupted downloads; returns files removed.
    pub async fn cleanup_staging(&self) -> Result<usize, DownloadError> {
        let staging = &self.inner.staging_dir;
        tokio::fs::create_dir_all(staging).await?;
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(staging).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Removed partial downloads from staging");
        }
        Ok(removed)
    }

    /// Put records whose asset file is missing (or, with `verify_hashes`,
    /// no longer matches its hash) back to pending. Returns records demoted.
    pub async fn reconcile(&self, verify_hashes: bool) -> Result<usize, DownloadError> {
        let store = &self.inner.store;
        let mut demoted = 0;
        for record in store.downloaded_records().await? {
            let reason = match &record.local_path {
                None => Some("no asset path recorded"),
                Some(path) => match tokio::fs::metadata(path).await {
                    Err(_) => Some("asset file missing"),
                    Ok(meta) if !meta.is_file() => Some("asset path is not a file"),
                    Ok(_) if verify_hashes => {
                        let actual = hash_file(path.clone()).await?;
                        (record.content_hash.as_deref() != Some(actual.as_str()))
                            .then_some("asset hash mismatch")
                    }
                    Ok(_) => None,
                },
            };

            if let Some(reason) = reason {
                warn!(
                    external_id = %record.external_id,
                    path = ?record.local_path,
                    reason,
                    "Demoting downloaded record"
                );
                if let Some(hash) = &record.content_hash {
                    store.forget_asset(hash).await?;
                }
                store.demote_download(&record.external_id, reason).await?;
                demoted += 1;
            }
        }
        if demoted > 0 {
            info!(demoted, "Reconciled stored assets");
        }
        Ok(demoted)
    }

    /// Queue the record's asset. Returns `false` if the record has no asset
    /// URL, is already queued, or shutdown is in progress.
    pub fn enqueue(&self, record: &CatalogRecord) -> bool {
        let Some(task) = DownloadTask::from_record(record) else {
            debug!(external_id = %record.external_id, "Record has no asset URL");
            return false;
        };
        self.enqueue_task(task)
    }

    /// Queue a prepared task.
    pub fn enqueue_task(&self, task: DownloadTask) -> bool {
        if self.inner.shutdown.is_shutdown_requested() {
            return false;
        }
        if !lock(&self.inner.in_flight).insert(task.external_id.clone()) {
            debug!(external_id = %task.external_id, "Download already queued");
            return false;
        }

        let guard = InFlight {
            inner: self.inner.clone(),
            external_id: task.external_id.clone(),
        };
        let inner = self.inner.clone();
        lock(&self.inner.tasks).spawn(async move {
            let _guard = guard;
            let permit = inner
                .shutdown
                .run(inner.permits.clone().acquire_owned())
                .await;
            if let Ok(Ok(_permit)) = permit {
                inner.download(&task).await;
            }
        });
        true
    }

    /// Wait for every queued download to finish.
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *lock(&self.inner.tasks));
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Download task aborted");
                }
            }
        }
    }
}

impl Inner {
    async fn download(&self, task: &DownloadTask) {
        // The task may have been queued from a snapshot taken before an
        // earlier download of the same record finished.
        match self.store.get(&task.external_id).await {
            Ok(Some(record)) if record.downloaded => {
                debug!(external_id = %task.external_id, "Asset already stored");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                self.fail_fatally(&task.external_id, &e);
                return;
            }
        }

        let mut attempts = task.prior_attempts;
        loop {
            if self.shutdown.is_shutdown_requested() {
                return;
            }
            let error = match self.attempt(task).await {
                Ok(stored) => {
                    self.stats.asset_stored(stored.deduplicated, stored.size);
                    metrics::record_asset_stored(stored.deduplicated, stored.size);
                    debug!(
                        external_id = %task.external_id,
                        path = %stored.path.display(),
                        deduplicated = stored.deduplicated,
                        "Asset stored"
                    );
                    return;
                }
                Err(DownloadError::Cancelled) => {
                    debug!(external_id = %task.external_id, "Download cancelled");
                    return;
                }
                Err(DownloadError::Store(e)) => {
                    self.fail_fatally(&task.external_id, &e);
                    return;
                }
                Err(e) => e,
            };

            let permanent = !error.is_retryable() || attempts + 1 >= self.max_attempts;
            match self
                .store
                .record_download_failure(&task.external_id, &error.to_string(), permanent)
                .await
            {
                Ok(total) => attempts = total,
                Err(e) => {
                    self.fail_fatally(&task.external_id, &e);
                    return;
                }
            }

            if permanent {
                warn!(
                    external_id = %task.external_id,
                    url = %task.url,
                    attempts,
                    error = %error,
                    "Download failed permanently"
                );
                self.stats.download_failed();
                metrics::record_download_failed();
                return;
            }

            let backoff = calculate_backoff(attempts.saturating_sub(1));
            self.stats.download_retried();
            metrics::record_download_retry(attempts, backoff);
            warn!(
                external_id = %task.external_id,
                retry_count = attempts,
                max_retries = self.max_attempts,
                backoff_ms = backoff.as_millis(),
                error = %error,
                "Retrying download after backoff delay"
            );
            if self.shutdown.sleep(backoff).await.is_err() {
                return;
            }
        }
    }

    async fn attempt(&self, task: &DownloadTask) -> Result<Stored, DownloadError> {
        let body = self.shutdown.run(self.fetcher.fetch(&task.url)).await??;
        if body.is_empty() {
            return Err(DownloadError::Permanent(format!("{} returned an empty body", task.url)));
        }
        let size = body.len() as u64;
        if size > MAX_ASSET_BYTES {
            return Err(DownloadError::TooLarge { size });
        }
        let hash = format!("{:x}", Sha256::digest(&body));

        let staging = self.staging_dir.clone();
        let staged = tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
            std::fs::create_dir_all(&staging)?;
            let mut file = NamedTempFile::new_in(&staging)?;
            file.write_all(&body)?;
            file.as_file().sync_all()?;
            Ok(file)
        })
        .await
        .map_err(std::io::Error::other)??;

        self.shutdown.check()?;
        let _placement = self.placement.lock().await;

        if let Some(existing) = self.store.find_asset(&hash).await? {
            if tokio::fs::try_exists(&existing).await.unwrap_or(false) {
                drop(staged);
                let path = self
                    .store
                    .mark_downloaded(&task.external_id, &existing, &hash, size)
                    .await?;
                return Ok(Stored {
                    path,
                    deduplicated: true,
                    size,
                });
            }
            warn!(hash = %hash, path = %existing.display(), "Registered asset file is missing");
            self.store.forget_asset(&hash).await?;
        }

        let target = self
            .assets_dir
            .join(&hash[..2])
            .join(format!("{hash}.{}", extension_for(&task.url)));
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        self.shutdown.check()?;
        let destination = target.clone();
        tokio::task::spawn_blocking(move || staged.persist(&destination).map(|_| ()))
            .await
            .map_err(std::io::Error::other)?
            .map_err(|e| e.error)?;

        let path = self
            .store
            .mark_downloaded(&task.external_id, &target, &hash, size)
            .await?;
        Ok(Stored {
            path,
            deduplicated: false,
            size,
        })
    }

    fn fail_fatally(&self, external_id: &str, e: &StoreError) {
        error!(external_id, error = %e, "Progress store failed during download");
        lock(&self.fatal).get_or_insert_with(|| e.to_string());
        self.shutdown.request_shutdown();
    }
}

async fn hash_file(path: PathBuf) -> Result<String, DownloadError> {
    let hash = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(hash)
}
