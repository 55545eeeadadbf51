//! Rendering collaborator interface.
//!
//! The crawl core never touches page structure. It talks to a [`Browser`]
//! that creates isolated contexts, a [`BrowserContext`] that holds one
//! authenticated cookie state, and lightweight [`PageHandle`]s opened on a
//! context that load one catalog page at a time and hand back raw item
//! descriptors.
//!
//! [`http`] provides an implementation for catalogs that expose JSON listing
//! endpoints; tests substitute scripted fakes.

use crate::config::Credentials;
use crate::record::RawItem;
use async_trait::async_trait;
use std::time::Duration;

pub mod http;

pub use http::HttpBrowser;

/// Failures reported by the rendering collaborator.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BrowserError {
    /// The response carried the login-redirect signature
    #[error("authentication required")]
    AuthRequired,

    /// The server throttled the request
    #[error("rate limited by server")]
    RateLimited {
        /// Server-suggested wait, if provided
        retry_after: Option<Duration>,
    },

    /// Request timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection-level failure or 5xx
    #[error("network error: {0}")]
    Network(String),

    /// The page loaded but its structure was not understood
    #[error("unexpected page structure: {0}")]
    Extraction(String),

    /// The context or page is gone and must be recreated
    #[error("browser context closed")]
    Closed,
}

impl BrowserError {
    /// Timeouts and connection failures; retried within budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Network(_))
    }
}

/// Result of submitting credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Session is usable
    Success,
    /// Credentials were rejected; retrying will not help
    InvalidCredentials(String),
}

/// What one catalog page yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    /// Raw item descriptors in page order
    pub items: Vec<RawItem>,
    /// The page carried the end-of-catalog signature
    pub end_of_catalog: bool,
    /// Total page count, when the catalog exposes it
    pub total_pages: Option<u32>,
}

/// Factory for isolated browsing contexts.
#[async_trait]
pub trait Browser: Send + Sync {
    /// Create a fresh, unauthenticated context.
    async fn new_context(&self) -> Result<Box<dyn BrowserContext>, BrowserError>;
}

/// One cookie/token state shared by the pages opened on it.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Run the login flow with `credentials`.
    async fn submit_login(&mut self, credentials: &Credentials)
        -> Result<LoginOutcome, BrowserError>;

    /// Lightweight authenticated request; `Ok(false)` means logged out.
    async fn probe(&mut self) -> Result<bool, BrowserError>;

    /// Open a page handle sharing this context's authentication.
    async fn open_page(&self) -> Result<Box<dyn PageHandle>, BrowserError>;

    /// Release the context.
    async fn close(&mut self);
}

/// A single tab-like handle.
#[async_trait]
pub trait PageHandle: Send {
    /// Load catalog page `page` (1-based) and extract its raw items.
    async fn load_catalog_page(&mut self, page: u32) -> Result<PageContent, BrowserError>;
}
