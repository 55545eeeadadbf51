//! Login, validity checks and re-authentication for one browsing context.

use crate::browser::{Browser, BrowserContext, BrowserError, LoginOutcome};
use crate::config::{Credentials, SESSION_PROBE_AFTER};
use crate::downloader::config::calculate_backoff;
use crate::metrics as crawl_metrics;
use crate::rate_limit::{Outcome, RateController};
use crate::shutdown::SharedShutdown;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Login attempts before a transient failure is reported.
pub const MAX_LOGIN_ATTEMPTS: u32 = 3;

/// Authentication errors
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials rejected; fatal, never retried
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Login kept failing for transient reasons
    #[error("login failed after {attempts} attempts: {last_error}")]
    Transient {
        /// Attempts made
        attempts: u32,
        /// Last failure observed
        last_error: String,
    },

    /// Shutdown requested mid-login
    #[error("login cancelled by shutdown")]
    Cancelled,
}

impl AuthError {
    /// Whether the crawl must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_))
    }
}

/// One authenticated browsing context and its health.
pub struct Session {
    context: Box<dyn BrowserContext>,
    /// Process-unique id, for logs
    pub id: u64,
    /// Bumped on every successful (re-)authentication
    pub generation: u64,
    /// When the current authentication was established
    pub authenticated_at: Instant,
    /// Last request that succeeded on this session
    pub last_success: Instant,
    /// Transport failures since the last success
    pub consecutive_failures: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("consecutive_failures", &self.consecutive_failures)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// The underlying context, for opening page handles.
    pub fn context(&self) -> &dyn BrowserContext {
        self.context.as_ref()
    }

    /// Note a successful request.
    pub fn record_success(&mut self) {
        self.last_success = Instant::now();
        self.consecutive_failures = 0;
    }

    /// Note a transport failure; returns the running count.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }
}

/// Performs the login protocol against the browsing surface.
pub struct SessionManager {
    browser: Arc<dyn Browser>,
    credentials: Credentials,
    rate: Arc<RateController>,
    shutdown: SharedShutdown,
    max_failures: u32,
    next_id: AtomicU64,
    reauthentications: AtomicU64,
}

impl SessionManager {
    /// Create a manager. `max_failures` consecutive transport failures make
    /// a session invalid.
    pub fn new(
        browser: Arc<dyn Browser>,
        credentials: Credentials,
        rate: Arc<RateController>,
        shutdown: SharedShutdown,
        max_failures: u32,
    ) -> Self {
        Self {
            browser,
            credentials,
            rate,
            shutdown,
            max_failures,
            next_id: AtomicU64::new(1),
            reauthentications: AtomicU64::new(0),
        }
    }

    /// Re-authentications performed so far.
    pub fn reauthentications(&self) -> u64 {
        self.reauthentications.load(Ordering::Relaxed)
    }

    /// Create a context and log in.
    pub async fn login(&self) -> Result<Session, AuthError> {
        let mut last_error = String::new();
        for attempt in 0..MAX_LOGIN_ATTEMPTS {
            if attempt > 0 {
                self.pause(attempt - 1).await?;
            }
            let mut context = match self.browser.new_context().await {
                Ok(context) => context,
                Err(e) => {
                    warn!(attempt, error = %e, "Failed to create browser context");
                    last_error = e.to_string();
                    continue;
                }
            };
            match self.authenticate(context.as_mut()).await {
                Ok(()) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    info!(session = id, "Session logged in");
                    return Ok(Session {
                        context,
                        id,
                        generation: 1,
                        authenticated_at: now,
                        last_success: now,
                        consecutive_failures: 0,
                    });
                }
                Err(LoginFailure::Fatal(e)) => {
                    context.close().await;
                    return Err(e);
                }
                Err(LoginFailure::Retry(e)) => {
                    context.close().await;
                    last_error = e;
                }
            }
        }
        Err(AuthError::Transient {
            attempts: MAX_LOGIN_ATTEMPTS,
            last_error,
        })
    }

    /// Cheap local check, plus a remote probe when the session has been idle.
    pub async fn is_valid(&self, session: &mut Session) -> bool {
        if session.consecutive_failures >= self.max_failures {
            return false;
        }
        if session.last_success.elapsed() < SESSION_PROBE_AFTER {
            return true;
        }
        if self.rate.acquire(&self.shutdown).await.is_err() {
            return false;
        }
        match session.context.probe().await {
            Ok(valid) => {
                self.rate.report(Outcome::Success);
                if valid {
                    session.record_success();
                }
                valid
            }
            Err(BrowserError::RateLimited { .. }) => {
                self.rate.report(Outcome::RateLimited);
                true
            }
            Err(e) => {
                self.rate.report(Outcome::Failure);
                warn!(session = session.id, error = %e, "Session probe failed");
                false
            }
        }
    }

    /// Log the session in again, replacing its context if it is gone.
    pub async fn reauthenticate(&self, session: &mut Session) -> Result<(), AuthError> {
        warn!(session = session.id, generation = session.generation, "Re-authenticating session");
        crawl_metrics::record_reauthentication();
        self.reauthentications.fetch_add(1, Ordering::Relaxed);

        let mut last_error = String::new();
        for attempt in 0..MAX_LOGIN_ATTEMPTS {
            if attempt > 0 {
                self.pause(attempt - 1).await?;
            }
            match self.authenticate(session.context.as_mut()).await {
                Ok(()) => {
                    let now = Instant::now();
                    session.generation += 1;
                    session.authenticated_at = now;
                    session.last_success = now;
                    session.consecutive_failures = 0;
                    info!(session = session.id, generation = session.generation, "Session re-authenticated");
                    return Ok(());
                }
                Err(LoginFailure::Fatal(e)) => return Err(e),
                Err(LoginFailure::Retry(e)) if e == CONTEXT_CLOSED => {
                    // The old context is unusable; swap in a fresh one.
                    let fresh = self.login().await?;
                    let generation = session.generation + 1;
                    session.context.close().await;
                    *session = Session {
                        generation,
                        id: session.id,
                        ..fresh
                    };
                    return Ok(());
                }
                Err(LoginFailure::Retry(e)) => last_error = e,
            }
        }
        Err(AuthError::Transient {
            attempts: MAX_LOGIN_ATTEMPTS,
            last_error,
        })
    }

    /// Release a session's context.
    pub async fn close(&self, mut session: Session) {
        session.context.close().await;
    }

    async fn authenticate(&self, context: &mut dyn BrowserContext) -> Result<(), LoginFailure> {
        self.rate
            .acquire(&self.shutdown)
            .await
            .map_err(|_| LoginFailure::Fatal(AuthError::Cancelled))?;

        match context.submit_login(&self.credentials).await {
            Ok(LoginOutcome::Success) => {
                self.rate.report(Outcome::Success);
                Ok(())
            }
            Ok(LoginOutcome::InvalidCredentials(reason)) => {
                self.rate.report(Outcome::Success);
                Err(LoginFailure::Fatal(AuthError::InvalidCredentials(reason)))
            }
            Err(BrowserError::RateLimited { .. }) => {
                self.rate.report(Outcome::RateLimited);
                Err(LoginFailure::Retry("rate limited during login".into()))
            }
            Err(BrowserError::Closed) => Err(LoginFailure::Retry(CONTEXT_CLOSED.into())),
            Err(e) if e.is_transient() => {
                self.rate.report(Outcome::Failure);
                warn!(error = %e, "Transient login failure");
                Err(LoginFailure::Retry(e.to_string()))
            }
            Err(e) => {
                // The server answered; only the login page was not what we expected.
                self.rate.report(Outcome::Success);
                warn!(error = %e, "Unexpected login response");
                Err(LoginFailure::Retry(e.to_string()))
            }
        }
    }

    async fn pause(&self, retry: u32) -> Result<(), AuthError> {
        self.shutdown
            .sleep(calculate_backoff(retry))
            .await
            .map_err(|_| AuthError::Cancelled)
    }
}

const CONTEXT_CLOSED: &str = "browser context closed";

enum LoginFailure {
    Fatal(AuthError),
    Retry(String),
}
