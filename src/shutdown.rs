//! Cooperative cancellation shared by every crawl component.
//!
//! A single [`ShutdownCoordinator`] is threaded through the rate controller,
//! the session pool, page tasks and the download manager. Every suspension
//! point either races its wait against [`ShutdownCoordinator::wait_for_shutdown`]
//! or checks [`ShutdownCoordinator::is_shutdown_requested`] before and after
//! blocking, so Ctrl+C never interrupts a store transaction or an asset rename.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Returned by the cancellable helpers when shutdown won the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("shutdown requested")]
pub struct Cancelled;

/// Coordinates graceful shutdown across async tasks.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    is_shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    /// Create a new coordinator.
    pub fn new() -> Self {
        Self {
            is_shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Create a new shared coordinator wrapped in [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request shutdown. Waiters are woken exactly once.
    pub fn request_shutdown(&self) {
        if !self.is_shutdown.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    /// Fail fast with [`Cancelled`] if shutdown was already requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_shutdown_requested() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait until shutdown is requested. Returns immediately if already set.
    pub async fn wait_for_shutdown(&self) {
        // Register interest before reading the flag so a request landing in
        // between cannot be missed.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless shutdown is requested first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.wait_for_shutdown() => Err(Cancelled),
        }
    }

    /// Sleep until `deadline` unless shutdown is requested first.
    pub async fn sleep_until(&self, deadline: tokio::time::Instant) -> Result<(), Cancelled> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => Ok(()),
            _ = self.wait_for_shutdown() => Err(Cancelled),
        }
    }

    /// Drive `fut` to completion unless shutdown is requested first.
    ///
    /// The check happens before and after the wait, matching the contract
    /// every suspension point in the crawler follows.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        self.check()?;
        let value = tokio::select! {
            value = fut => value,
            _ = self.wait_for_shutdown() => return Err(Cancelled),
        };
        Ok(value)
    }
}
