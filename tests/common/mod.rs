//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use catalog_crawler::browser::{
    Browser, BrowserContext, BrowserError, LoginOutcome, PageContent, PageHandle,
};
use catalog_crawler::config::{Credentials, CrawlConfig};
use catalog_crawler::downloader::{AssetFetcher, DownloadError};
use catalog_crawler::record::RawItem;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Build a raw item the way the listing endpoint hands it over.
pub fn item(id: &str, title: &str, image_url: &str) -> RawItem {
    match json!({ "external_id": id, "title": title, "image_url": image_url }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

/// Crawl configuration fast enough for wall-clock tests.
pub fn fast_config(root: &Path) -> CrawlConfig {
    CrawlConfig {
        concurrent_sessions: 1,
        pages_per_session: 2,
        requests_per_minute: 60_000,
        backoff_floor: Duration::from_millis(1),
        backoff_ceiling: Duration::from_millis(50),
        assets_dir: root.join("assets"),
        database_path: root.join("progress.db"),
        progress_every_pages: 1,
        ..CrawlConfig::default()
    }
}

pub fn credentials() -> Credentials {
    Credentials::new("crawler@example.com", "hunter2")
}

/// Every regular file under `dir`, skipping the staging area.
pub fn stored_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == ".staging") {
                continue;
            }
            files.extend(stored_files(&path));
        } else {
            files.push(path);
        }
    }
    files.sort();
    files
}

#[derive(Default)]
struct CatalogState {
    pages: Vec<Vec<RawItem>>,
    expose_total: bool,
    logins: AtomicU32,
    contexts_created: AtomicU32,
    reject_credentials: AtomicBool,
    requests: Mutex<Vec<(u32, Instant)>>,
    expire_at: Mutex<HashSet<u32>>,
    transient_failures: Mutex<HashMap<u32, u32>>,
    throttled: Mutex<HashMap<u32, u32>>,
    retry_after: Mutex<HashMap<u32, Duration>>,
    broken_pages: Mutex<HashSet<u32>>,
    load_delay: Mutex<Duration>,
}

/// A catalog that serves scripted pages behind a login.
///
/// The last scripted page carries the end-of-catalog signature. Pages past
/// it come back empty and flagged, so a crawler that ignores the signal is
/// caught by the request log rather than by a hang.
#[derive(Clone, Default)]
pub struct FakeCatalog {
    state: Arc<CatalogState>,
}

impl FakeCatalog {
    pub fn new(pages: Vec<Vec<RawItem>>) -> Self {
        Self {
            state: Arc::new(CatalogState {
                pages,
                ..CatalogState::default()
            }),
        }
    }

    /// Report the total page count with every page.
    pub fn with_total(pages: Vec<Vec<RawItem>>) -> Self {
        Self {
            state: Arc::new(CatalogState {
                pages,
                expose_total: true,
                ..CatalogState::default()
            }),
        }
    }

    /// Log the serving context out the first time `page` is requested.
    pub fn expire_session_at(&self, page: u32) {
        lock(&self.state.expire_at).insert(page);
    }

    /// Fail the next `times` requests for `page` with a timeout.
    pub fn fail_page(&self, page: u32, times: u32) {
        lock(&self.state.transient_failures).insert(page, times);
    }

    /// Answer the next `times` requests for `page` with a throttling response.
    pub fn throttle_page(&self, page: u32, times: u32) {
        lock(&self.state.throttled).insert(page, times);
    }

    /// Throttle the next request for `page` once, asking for `retry_after`.
    pub fn throttle_page_for(&self, page: u32, retry_after: Duration) {
        lock(&self.state.retry_after).insert(page, retry_after);
    }

    /// Serve `page` with markup the extractor cannot understand.
    pub fn break_page(&self, page: u32) {
        lock(&self.state.broken_pages).insert(page);
    }

    pub fn reject_credentials(&self) {
        self.state.reject_credentials.store(true, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *lock(&self.state.load_delay) = delay;
    }

    pub fn logins(&self) -> u32 {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> u32 {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    /// Pages requested, in request order, retries included.
    pub fn requested_pages(&self) -> Vec<u32> {
        lock(&self.state.requests).iter().map(|(page, _)| *page).collect()
    }

    /// When each page request reached the catalog.
    pub fn request_times(&self) -> Vec<Instant> {
        lock(&self.state.requests).iter().map(|(_, at)| *at).collect()
    }

    pub fn browser(&self) -> Arc<dyn Browser> {
        Arc::new(FakeBrowser {
            catalog: self.clone(),
        })
    }
}

struct FakeBrowser {
    catalog: FakeCatalog,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, BrowserError> {
        self.catalog.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            catalog: self.catalog.clone(),
            authenticated: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct FakeContext {
    catalog: FakeCatalog,
    authenticated: Arc<AtomicBool>,
}

#[async_trait]
impl BrowserContext for FakeContext {
    async fn submit_login(
        &mut self,
        _credentials: &Credentials,
    ) -> Result<LoginOutcome, BrowserError> {
        if self.catalog.state.reject_credentials.load(Ordering::SeqCst) {
            return Ok(LoginOutcome::InvalidCredentials("wrong password".into()));
        }
        self.catalog.state.logins.fetch_add(1, Ordering::SeqCst);
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(LoginOutcome::Success)
    }

    async fn probe(&mut self) -> Result<bool, BrowserError> {
        Ok(self.authenticated.load(Ordering::SeqCst))
    }

    async fn open_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        Ok(Box::new(FakePage {
            catalog: self.catalog.clone(),
            authenticated: self.authenticated.clone(),
        }))
    }

    async fn close(&mut self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }
}

struct FakePage {
    catalog: FakeCatalog,
    authenticated: Arc<AtomicBool>,
}

#[async_trait]
impl PageHandle for FakePage {
    async fn load_catalog_page(&mut self, page: u32) -> Result<PageContent, BrowserError> {
        let state = &self.catalog.state;
        lock(&state.requests).push((page, Instant::now()));

        let delay = *lock(&state.load_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if lock(&state.expire_at).remove(&page) {
            self.authenticated.store(false, Ordering::SeqCst);
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(BrowserError::AuthRequired);
        }
        if let Some(remaining) = lock(&state.transient_failures).get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrowserError::Timeout(format!("page {page} timed out")));
            }
        }
        if let Some(remaining) = lock(&state.throttled).get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrowserError::RateLimited { retry_after: None });
            }
        }
        if let Some(retry_after) = lock(&state.retry_after).remove(&page) {
            return Err(BrowserError::RateLimited {
                retry_after: Some(retry_after),
            });
        }
        if lock(&state.broken_pages).contains(&page) {
            return Err(BrowserError::Extraction("listing container missing".into()));
        }

        let last = state.pages.len() as u32;
        let items = state
            .pages
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default();
        Ok(PageContent {
            items,
            end_of_catalog: page >= last,
            total_pages: state.expose_total.then_some(last),
        })
    }
}

/// Asset server backed by a URL map.
#[derive(Clone, Default)]
pub struct FakeAssetFetcher {
    assets: Arc<Mutex<HashMap<String, Bytes>>>,
    fetches: Arc<Mutex<Vec<String>>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeAssetFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: &'static [u8]) -> &Self {
        lock(&self.assets).insert(url.to_string(), Bytes::from_static(body));
        self
    }

    /// Fail the next `times` fetches of `url` with a transient error.
    pub fn fail(&self, url: &str, times: u32) -> &Self {
        lock(&self.failures).insert(url.to_string(), times);
        self
    }

    pub fn fetches(&self) -> Vec<String> {
        lock(&self.fetches).clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        lock(&self.fetches).iter().filter(|fetched| *fetched == url).count()
    }

    pub fn shared(&self) -> Arc<dyn AssetFetcher> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl AssetFetcher for FakeAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        lock(&self.fetches).push(url.to_string());
        if let Some(remaining) = lock(&self.failures).get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DownloadError::Transient(format!("{url}: 503")));
            }
        }
        lock(&self.assets)
            .get(url)
            .cloned()
            .ok_or_else(|| DownloadError::Permanent(format!("{url}: 404")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
