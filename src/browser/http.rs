//! HTTP browsing surface for catalogs with JSON listing endpoints.
//!
//! Each context owns a reqwest client with its own cookie jar; page handles
//! clone the client and therefore share the context's authentication.
//! Redirects are not followed so the redirect-to-login signature stays
//! visible.

use super::{Browser, BrowserContext, BrowserError, LoginOutcome, PageContent, PageHandle};
use crate::config::{Credentials, SiteConfig};
use crate::metrics::RequestMetrics;
use crate::record::RawItem;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, LOCATION, RETRY_AFTER};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP connect timeout (seconds)
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// HTTP request timeout (seconds)
const HTTP_REQUEST_TIMEOUT_SECS: u64 = 30;

/// [`Browser`] backed by plain HTTP requests.
#[derive(Debug, Clone)]
pub struct HttpBrowser {
    site: Arc<SiteConfig>,
    base: Url,
}

impl HttpBrowser {
    /// Browser for `site`; fails if the base URL does not parse.
    pub fn new(site: SiteConfig) -> Result<Self, BrowserError> {
        let base = Url::parse(&site.base_url)
            .map_err(|e| BrowserError::Network(format!("invalid base URL {}: {e}", site.base_url)))?;
        Ok(Self {
            site: Arc::new(site),
            base,
        })
    }
}

#[async_trait]
impl Browser for HttpBrowser {
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, BrowserError> {
        let client = Client::builder()
            .cookie_store(true)
            .redirect(Policy::none())
            .user_agent(self.site.user_agent.clone())
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BrowserError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Box::new(HttpContext {
            client,
            endpoints: Arc::new(Endpoints::new(&self.base, &self.site)?),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct Endpoints {
    login: Url,
    catalog: Url,
    probe: Url,
    login_path: String,
}

impl Endpoints {
    fn new(base: &Url, site: &SiteConfig) -> Result<Self, BrowserError> {
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| BrowserError::Network(format!("invalid path {path}: {e}")))
        };
        Ok(Self {
            login: join(&site.login_path)?,
            catalog: join(&site.catalog_path)?,
            probe: join(&site.probe_path)?,
            login_path: site.login_path.clone(),
        })
    }

    fn redirects_to_login(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        status.is_redirection()
            && headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|location| location.contains(&self.login_path))
    }
}

struct HttpContext {
    client: Client,
    endpoints: Arc<Endpoints>,
    closed: bool,
}

fn transport_error(err: reqwest::Error) -> BrowserError {
    if err.is_timeout() {
        BrowserError::Timeout(err.to_string())
    } else {
        BrowserError::Network(err.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl BrowserContext for HttpContext {
    async fn submit_login(
        &mut self,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let metrics = RequestMetrics::start("login");
        let response = self
            .client
            .post(self.endpoints.login.clone())
            .form(&[
                ("email", credentials.email.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                metrics.record_network_error(&e.to_string());
                transport_error(e)
            })?;

        let status = response.status();
        metrics.record_status(status.as_u16());

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BrowserError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(BrowserError::Network(format!("login returned {status}")));
        }
        if matches!(
            status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::UNPROCESSABLE_ENTITY
        ) || self.endpoints.redirects_to_login(status, response.headers())
        {
            return Ok(LoginOutcome::InvalidCredentials(format!(
                "login rejected with {status}"
            )));
        }
        if status.is_success() || status.is_redirection() {
            debug!(correlation_id = metrics.correlation_id(), "Login accepted");
            return Ok(LoginOutcome::Success);
        }
        Ok(LoginOutcome::InvalidCredentials(format!(
            "unexpected login status {status}"
        )))
    }

    async fn probe(&mut self) -> Result<bool, BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        let metrics = RequestMetrics::start("probe");
        let response = self
            .client
            .get(self.endpoints.probe.clone())
            .send()
            .await
            .map_err(|e| {
                metrics.record_network_error(&e.to_string());
                transport_error(e)
            })?;
        let status = response.status();
        metrics.record_status(status.as_u16());

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BrowserError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(BrowserError::Network(format!("probe returned {status}")));
        }
        Ok(status.is_success() && !self.endpoints.redirects_to_login(status, response.headers()))
    }

    async fn open_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        if self.closed {
            return Err(BrowserError::Closed);
        }
        Ok(Box::new(HttpPage {
            client: self.client.clone(),
            endpoints: self.endpoints.clone(),
        }))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

struct HttpPage {
    client: Client,
    endpoints: Arc<Endpoints>,
}

#[async_trait]
impl PageHandle for HttpPage {
    async fn load_catalog_page(&mut self, page: u32) -> Result<PageContent, BrowserError> {
        let metrics = RequestMetrics::start("page");
        let response = self
            .client
            .get(self.endpoints.catalog.clone())
            .query(&[("page", page)])
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                metrics.record_network_error(&e.to_string());
                transport_error(e)
            })?;
        let status = response.status();
        metrics.record_status(status.as_u16());

        if status == StatusCode::UNAUTHORIZED
            || self.endpoints.redirects_to_login(status, response.headers())
        {
            return Err(BrowserError::AuthRequired);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BrowserError::RateLimited {
                retry_after: retry_after(response.headers()),
            });
        }
        if status.is_server_error() {
            return Err(BrowserError::Network(format!("page {page} returned {status}")));
        }
        if status == StatusCode::NOT_FOUND {
            debug!(page, "Catalog page not found, treating as end of catalog");
            return Ok(PageContent {
                items: Vec::new(),
                end_of_catalog: true,
                total_pages: None,
            });
        }
        if !status.is_success() {
            return Err(BrowserError::Extraction(format!(
                "page {page} returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BrowserError::Extraction(format!("page {page} body is not JSON: {e}")))?;
        parse_listing(body, page)
    }
}

fn pick<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

/// Interpret a JSON listing body.
///
/// Accepts a bare array or an object with `items`/`results`/`data`, plus the
/// usual paging hints (`total_pages`, `has_more`, `next`, `last_page`).
pub(crate) fn parse_listing(body: Value, page: u32) -> Result<PageContent, BrowserError> {
    let (raw_items, object) = match body {
        Value::Array(items) => (items, None),
        Value::Object(object) => {
            let items = match pick(&object, &["items", "results", "data"]) {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(other) => {
                    return Err(BrowserError::Extraction(format!(
                        "page {page} item list is {other}"
                    )))
                }
            };
            (items, Some(object))
        }
        other => {
            return Err(BrowserError::Extraction(format!(
                "page {page} body is neither list nor object: {other}"
            )))
        }
    };

    let total = raw_items.len();
    let items: Vec<RawItem> = raw_items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect();
    if items.len() < total {
        warn!(page, dropped = total - items.len(), "Ignoring non-object catalog items");
    }

    let mut content = PageContent {
        items,
        end_of_catalog: false,
        total_pages: None,
    };
    if let Some(object) = object {
        content.total_pages = pick(&object, &["total_pages", "totalPages", "page_count"])
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());
        let no_more = matches!(object.get("has_more"), Some(Value::Bool(false)))
            || matches!(object.get("next"), Some(Value::Null))
            || matches!(object.get("last_page"), Some(Value::Bool(true)));
        let past_total = content.total_pages.is_some_and(|t| page >= t);
        content.end_of_catalog = no_more || past_total;
    }
    Ok(content)
}
