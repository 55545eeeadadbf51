//! Fixed-capacity pool of authenticated sessions.
//!
//! The pool holds `N` slots, each owning one [`Session`] and multiplexing up
//! to `M` page handles. [`SessionPool::with_page`] checks a page handle out of
//! the least loaded healthy slot, runs one request under a rate permit and
//! returns the handle on every exit path. Callers beyond `N * M` queue on a
//! semaphore.
//!
//! Re-authentication is serialized per slot: the session sits behind an async
//! mutex and carries a generation number, so when several page handles of
//! one slot observe the login-redirect signature at once only the first
//! re-authenticates and the rest retry on the refreshed session. A slot whose
//! re-authentication fails is taken out of rotation for a cooldown period.

use super::manager::{AuthError, Session, SessionManager};
use crate::browser::{BrowserError, PageHandle};
use crate::config::CrawlConfig;
use crate::rate_limit::{Outcome, RateController, RateLimitError};
use crate::shutdown::{Cancelled, SharedShutdown};
use futures::future::{join_all, BoxFuture};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Re-authentications one `with_page` call may trigger before giving up.
pub const MAX_AUTH_RETRIES: u32 = 3;

/// Throttling responses one `with_page` call waits out before giving up.
pub const MAX_THROTTLE_WAITS: u32 = 8;

/// Session pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Login failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The page task failed
    #[error("page task failed: {0}")]
    Browser(#[from] BrowserError),

    /// The page kept demanding authentication right after logging in
    #[error("authentication still required after {0} re-authentications")]
    AuthLoop(u32),

    /// No slot could be brought up
    #[error("no session could be established: {0}")]
    NoSessions(String),

    /// The pool was closed
    #[error("session pool closed")]
    Closed,

    /// Shutdown requested
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl From<Cancelled> for PoolError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<RateLimitError> for PoolError {
    fn from(_: RateLimitError) -> Self {
        Self::Cancelled
    }
}

impl PoolError {
    /// Errors that must stop the crawl.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_fatal(),
            Self::NoSessions(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct SlotLoad {
    in_use: usize,
    cooldown_until: Option<Instant>,
    needs_auth: bool,
}

struct Slot {
    index: usize,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    idle_pages: std::sync::Mutex<Vec<(u64, Box<dyn PageHandle>)>>,
}

impl Slot {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Box<dyn PageHandle>)>> {
        match self.idle_pages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum Pick {
    Slot(usize),
    Wait(Option<Instant>),
}

/// Bounded set of sessions shared by page workers.
pub struct SessionPool {
    manager: Arc<SessionManager>,
    rate: Arc<RateController>,
    shutdown: SharedShutdown,
    slots: Vec<Slot>,
    loads: std::sync::Mutex<Vec<SlotLoad>>,
    capacity: Semaphore,
    freed: Notify,
    pages_per_session: usize,
    max_failures: u32,
    cooldown: Duration,
}

/// A checked-out page handle; returned to its slot on drop.
struct Checkout<'p> {
    pool: &'p SessionPool,
    index: usize,
    generation: u64,
    page: Option<Box<dyn PageHandle>>,
    _permit: SemaphorePermit<'p>,
}

impl Checkout<'_> {
    fn discard_page(&mut self) {
        self.page = None;
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let slot = &self.pool.slots[self.index];
            if slot.generation.load(Ordering::SeqCst) == self.generation {
                slot.idle().push((self.generation, page));
            }
        }
        self.pool.release(self.index);
    }
}

/// Releases a picked slot if preparation fails before a checkout exists.
struct SlotClaim<'p> {
    pool: &'p SessionPool,
    index: usize,
    armed: bool,
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.index);
        }
    }
}

impl SessionPool {
    /// Build an empty pool sized from the configuration. Call
    /// [`SessionPool::start`] to log the sessions in.
    pub fn new(
        manager: Arc<SessionManager>,
        rate: Arc<RateController>,
        shutdown: SharedShutdown,
        config: &CrawlConfig,
    ) -> Self {
        let slots = (0..config.concurrent_sessions)
            .map(|index| Slot {
                index,
                session: Mutex::new(None),
                generation: AtomicU64::new(0),
                idle_pages: std::sync::Mutex::new(Vec::new()),
            })
            .collect();
        Self {
            manager,
            rate,
            shutdown,
            slots,
            loads: std::sync::Mutex::new(vec![SlotLoad::default(); config.concurrent_sessions]),
            capacity: Semaphore::new(config.pool_capacity()),
            freed: Notify::new(),
            pages_per_session: config.pages_per_session,
            max_failures: config.session_max_failures,
            cooldown: config.session_cooldown,
        }
    }

    fn loads(&self) -> std::sync::MutexGuard<'_, Vec<SlotLoad>> {
        match self.loads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Log every slot in. Fails on bad credentials or if no slot came up.
    pub async fn start(&self) -> Result<usize, PoolError> {
        let results = join_all(self.slots.iter().map(|slot| async move {
            let mut session = slot.session.lock().await;
            self.bring_up(slot, &mut session).await
        }))
        .await;

        let mut ready = 0;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(_) => ready += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(PoolError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if ready == 0 {
            return Err(PoolError::NoSessions(
                last_error.unwrap_or_else(|| "pool has no slots".into()),
            ));
        }
        info!(
            ready,
            sessions = self.slots.len(),
            pages_per_session = self.pages_per_session,
            "Session pool started"
        );
        Ok(ready)
    }

    /// Run `task` against a page handle from some session with spare capacity.
    ///
    /// Each call is one rate-limited request. An authentication-required
    /// response re-authenticates the session and retries without surfacing
    /// an error. A throttling response backs the rate controller off, waits
    /// for the larger of the server's `Retry-After` and the new delay, then
    /// retries. Other failures are reported to the rate controller and
    /// returned to the caller.
    pub async fn with_page<T, F>(&self, mut task: F) -> Result<T, PoolError>
    where
        F: for<'a> FnMut(&'a mut dyn PageHandle) -> BoxFuture<'a, Result<T, BrowserError>>,
    {
        let mut reauths = 0;
        let mut throttled = 0;
        loop {
            let mut checkout = self.checkout().await?;
            self.rate.acquire(&self.shutdown).await?;

            let attempt = match checkout.page.as_mut() {
                Some(page) => Some(self.shutdown.run(task(page.as_mut())).await),
                None => None,
            };
            let result = match attempt {
                Some(Ok(result)) => result,
                Some(Err(cancelled)) => {
                    checkout.discard_page();
                    return Err(cancelled.into());
                }
                None => Err(BrowserError::Closed),
            };

            let index = checkout.index;
            match result {
                Ok(value) => {
                    self.rate.report(Outcome::Success);
                    drop(checkout);
                    self.note_success(index).await;
                    return Ok(value);
                }
                Err(BrowserError::AuthRequired) => {
                    let observed = checkout.generation;
                    checkout.discard_page();
                    drop(checkout);
                    if reauths == MAX_AUTH_RETRIES {
                        return Err(PoolError::AuthLoop(reauths));
                    }
                    reauths += 1;
                    debug!(slot = index, generation = observed, "Authentication required");
                    self.reauthenticate_slot(index, observed).await?;
                }
                Err(BrowserError::RateLimited { retry_after }) => {
                    let delay = self.rate.report(Outcome::RateLimited);
                    drop(checkout);
                    if throttled == MAX_THROTTLE_WAITS {
                        return Err(BrowserError::RateLimited { retry_after }.into());
                    }
                    throttled += 1;
                    let wait = retry_after.map_or(delay, |after| after.max(delay));
                    debug!(
                        slot = index,
                        throttled,
                        wait_ms = wait.as_millis() as u64,
                        "Throttled; waiting before retry"
                    );
                    self.shutdown.sleep(wait).await?;
                }
                Err(e @ BrowserError::Extraction(_)) => {
                    self.rate.report(Outcome::Success);
                    drop(checkout);
                    self.note_success(index).await;
                    return Err(e.into());
                }
                Err(BrowserError::Closed) => {
                    checkout.discard_page();
                    drop(checkout);
                    self.flag_for_auth(index);
                    return Err(BrowserError::Closed.into());
                }
                Err(e) => {
                    self.rate.report(Outcome::Failure);
                    drop(checkout);
                    self.note_failure(index).await;
                    return Err(e.into());
                }
            }
        }
    }

    /// Close every session. Pending and future checkouts fail with
    /// [`PoolError::Closed`].
    pub async fn close(&self) {
        self.capacity.close();
        for slot in &self.slots {
            slot.idle().clear();
            if let Some(session) = slot.session.lock().await.take() {
                self.manager.close(session).await;
            }
        }
        info!("Session pool closed");
    }

    async fn checkout(&self) -> Result<Checkout<'_>, PoolError> {
        let permit = self
            .shutdown
            .run(self.capacity.acquire())
            .await?
            .map_err(|_| PoolError::Closed)?;

        loop {
            let index = self.pick_slot().await?;
            let mut claim = SlotClaim {
                pool: self,
                index,
                armed: true,
            };
            match self.prepare(index).await {
                Ok((generation, page)) => {
                    claim.armed = false;
                    return Ok(Checkout {
                        pool: self,
                        index,
                        generation,
                        page: Some(page),
                        _permit: permit,
                    });
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(PoolError::Cancelled) => return Err(PoolError::Cancelled),
                Err(e) => {
                    debug!(slot = index, error = %e, "Slot unavailable, picking another");
                }
            }
        }
    }

    async fn pick_slot(&self) -> Result<usize, PoolError> {
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_pick() {
                Pick::Slot(index) => return Ok(index),
                Pick::Wait(until) => {
                    let deadline = until.unwrap_or_else(|| Instant::now() + self.cooldown);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.shutdown.wait_for_shutdown() => return Err(PoolError::Cancelled),
                    }
                }
            }
        }
    }

    fn try_pick(&self) -> Pick {
        let now = Instant::now();
        let mut loads = self.loads();
        let mut best: Option<(usize, usize)> = None;
        let mut earliest_cooldown: Option<Instant> = None;

        for (index, load) in loads.iter_mut().enumerate() {
            if let Some(until) = load.cooldown_until {
                if until > now {
                    earliest_cooldown = Some(earliest_cooldown.map_or(until, |e| e.min(until)));
                    continue;
                }
                load.cooldown_until = None;
            }
            if load.in_use >= self.pages_per_session {
                continue;
            }
            if best.map_or(true, |(_, in_use)| load.in_use < in_use) {
                best = Some((index, load.in_use));
            }
        }

        match best {
            Some((index, _)) => {
                loads[index].in_use += 1;
                Pick::Slot(index)
            }
            None => Pick::Wait(earliest_cooldown),
        }
    }

    fn release(&self, index: usize) {
        {
            let mut loads = self.loads();
            loads[index].in_use = loads[index].in_use.saturating_sub(1);
        }
        self.freed.notify_waiters();
    }

    fn flag_for_auth(&self, index: usize) {
        self.loads()[index].needs_auth = true;
    }

    fn start_cooldown(&self, index: usize) {
        let until = Instant::now() + self.cooldown;
        {
            let mut loads = self.loads();
            loads[index].cooldown_until = Some(until);
            loads[index].needs_auth = true;
        }
        warn!(
            slot = index,
            cooldown_secs = self.cooldown.as_secs(),
            "Session unavailable, removing from rotation"
        );
    }

    /// Make sure the slot has a usable session and hand out a page handle.
    async fn prepare(&self, index: usize) -> Result<(u64, Box<dyn PageHandle>), PoolError> {
        let slot = &self.slots[index];
        let mut session = slot.session.lock().await;

        let flagged = std::mem::take(&mut self.loads()[index].needs_auth);
        let healthy = match session.as_mut() {
            Some(current) if !flagged => self.manager.is_valid(current).await,
            _ => false,
        };
        if !healthy {
            self.bring_up(slot, &mut session).await?;
        }

        let generation = slot.generation.load(Ordering::SeqCst);
        let reused = {
            let mut idle = slot.idle();
            idle.retain(|(page_generation, _)| *page_generation == generation);
            idle.pop().map(|(_, page)| page)
        };
        if let Some(page) = reused {
            return Ok((generation, page));
        }

        let Some(current) = session.as_ref() else {
            return Err(PoolError::Closed);
        };
        match current.context().open_page().await {
            Ok(page) => Ok((generation, page)),
            Err(e) => {
                self.start_cooldown(index);
                Err(e.into())
            }
        }
    }

    /// Log in (no session yet) or re-authenticate (stale session) under the
    /// slot's lock, moving the slot into cooldown on transient failure.
    async fn bring_up(&self, slot: &Slot, session: &mut Option<Session>) -> Result<(), PoolError> {
        let result = match session.as_mut() {
            Some(current) => self.manager.reauthenticate(current).await.map(|_| None),
            None => self.manager.login().await.map(Some),
        };
        match result {
            Ok(fresh) => {
                if let Some(fresh) = fresh {
                    *session = Some(fresh);
                }
                let generation = session.as_ref().map_or(0, |s| s.generation);
                slot.generation.store(generation, Ordering::SeqCst);
                slot.idle().clear();
                self.loads()[slot.index].cooldown_until = None;
                Ok(())
            }
            Err(AuthError::Cancelled) => Err(PoolError::Cancelled),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                self.start_cooldown(slot.index);
                Err(e.into())
            }
        }
    }

    async fn reauthenticate_slot(&self, index: usize, observed: u64) -> Result<(), PoolError> {
        let slot = &self.slots[index];
        let mut session = slot.session.lock().await;
        if slot.generation.load(Ordering::SeqCst) != observed {
            debug!(slot = index, "Session already re-authenticated by another task");
            return Ok(());
        }
        match self.bring_up(slot, &mut session).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(PoolError::Cancelled) => Err(PoolError::Cancelled),
            // The slot is cooling down; the retry lands on another one.
            Err(_) => Ok(()),
        }
    }

    async fn note_success(&self, index: usize) {
        if let Some(session) = self.slots[index].session.lock().await.as_mut() {
            session.record_success();
        }
    }

    async fn note_failure(&self, index: usize) {
        let failures = match self.slots[index].session.lock().await.as_mut() {
            Some(session) => session.record_failure(),
            None => return,
        };
        if failures >= self.max_failures {
            warn!(slot = index, failures, "Session failing repeatedly, will re-authenticate");
            self.flag_for_auth(index);
        }
    }
}
