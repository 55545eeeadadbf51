//! Adaptive, process-wide request throttle.
//!
//! Every catalog request goes through [`RateController::acquire`], which
//! reserves the next send slot under a single lock: the slot is computed from
//! the last granted timestamp and the current delay, and the timestamp is
//! advanced before the lock is released. Callers then sleep until their slot
//! outside the lock, so concurrent workers can never compute "enough time has
//! passed" independently and burst.
//!
//! Outcomes fed back through [`RateController::report`] move the delay:
//! server throttling and sustained failure ratios back off multiplicatively up
//! to the ceiling, while clean success runs decay it toward the floor.

use crate::config::{
    CrawlConfig, DECAY_FACTOR, FAILURE_RATIO_THRESHOLD, MIN_BACKOFF_STEP, MIN_WINDOW_SAMPLES,
    OUTCOME_WINDOW, SUCCESS_RUN_FOR_DECAY,
};
use crate::metrics as crawl_metrics;
use crate::shutdown::{Cancelled, ShutdownCoordinator};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Observed result of a network-incurring action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request succeeded
    Success,
    /// Timeout, reset or other transport failure
    Failure,
    /// Server signalled throttling
    RateLimited,
}

/// Grant to proceed with one request.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    /// Instant the slot was granted for
    pub granted_at: Instant,
    /// Delay in force when the slot was reserved
    pub delay: Duration,
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSnapshot {
    /// Current inter-request delay
    pub delay: Duration,
    /// Successes in the window
    pub successes: usize,
    /// Failures in the window
    pub failures: usize,
    /// Throttling responses in the window
    pub rate_limited: usize,
    /// Permits granted since creation
    pub granted: u64,
}

/// Rate controller errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// Shutdown was requested while waiting for a slot
    #[error("rate limiter wait cancelled by shutdown")]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug)]
struct RateState {
    delay: Duration,
    last_granted: Option<Instant>,
    window: VecDeque<Outcome>,
    success_streak: u32,
    granted: u64,
}

impl RateState {
    fn push(&mut self, outcome: Outcome) {
        if self.window.len() == OUTCOME_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(outcome);
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.window.iter().filter(|o| **o == outcome).count()
    }

    fn failure_ratio(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.count(Outcome::Failure) + self.count(Outcome::RateLimited);
        failures as f64 / self.window.len() as f64
    }
}

/// Shared throttle consulted before every catalog request.
#[derive(Debug)]
pub struct RateController {
    state: Mutex<RateState>,
    floor: Duration,
    ceiling: Duration,
    factor: f64,
}

impl RateController {
    /// Create a controller starting at `floor`.
    pub fn new(floor: Duration, ceiling: Duration, factor: f64) -> Self {
        Self {
            state: Mutex::new(RateState {
                delay: floor,
                last_granted: None,
                window: VecDeque::with_capacity(OUTCOME_WINDOW),
                success_streak: 0,
                granted: 0,
            }),
            floor,
            ceiling: ceiling.max(floor),
            factor,
        }
    }

    /// Controller tuned from the crawl configuration.
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self::new(
            config.effective_floor(),
            config.backoff_ceiling,
            config.backoff_factor,
        )
    }

    fn lock(&self) -> MutexGuard<'_, RateState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Wait for the next send slot.
    ///
    /// The slot is reserved atomically before sleeping, so the returned
    /// `granted_at` values of any set of callers are pairwise at least the
    /// delay in force apart.
    pub async fn acquire(&self, shutdown: &ShutdownCoordinator) -> Result<Permit, RateLimitError> {
        shutdown.check()?;

        let requested = Instant::now();
        let permit = {
            let mut state = self.lock();
            let now = Instant::now();
            let slot = match state.last_granted {
                Some(last) => (last + state.delay).max(now),
                None => now,
            };
            state.last_granted = Some(slot);
            state.granted += 1;
            Permit {
                granted_at: slot,
                delay: state.delay,
            }
        };

        if permit.granted_at > Instant::now() {
            shutdown.sleep_until(permit.granted_at).await?;
        }
        crawl_metrics::record_rate_wait(requested.elapsed());
        Ok(permit)
    }

    /// Feed an outcome back; returns the delay now in force.
    pub fn report(&self, outcome: Outcome) -> Duration {
        let mut state = self.lock();
        state.push(outcome);

        match outcome {
            Outcome::RateLimited => {
                state.success_streak = 0;
                self.back_off(&mut state, "server throttling");
            }
            Outcome::Failure => {
                state.success_streak = 0;
                if state.window.len() >= MIN_WINDOW_SAMPLES
                    && state.failure_ratio() >= FAILURE_RATIO_THRESHOLD
                {
                    self.back_off(&mut state, "failure ratio over threshold");
                    state.window.clear();
                }
            }
            Outcome::Success => {
                state.success_streak += 1;
                if state.success_streak >= SUCCESS_RUN_FOR_DECAY {
                    state.success_streak = 0;
                    let decayed = state.delay.mul_f64(DECAY_FACTOR).max(self.floor);
                    if decayed != state.delay {
                        debug!(
                            from_ms = state.delay.as_millis() as u64,
                            to_ms = decayed.as_millis() as u64,
                            "Decaying request delay after clean run"
                        );
                        state.delay = decayed;
                    }
                }
            }
        }

        crawl_metrics::set_rate_delay(state.delay);
        state.delay
    }

    fn back_off(&self, state: &mut RateState, reason: &'static str) {
        let base = if state.delay.is_zero() {
            MIN_BACKOFF_STEP
        } else {
            state.delay
        };
        let next = base.mul_f64(self.factor).min(self.ceiling);
        warn!(
            from_ms = state.delay.as_millis() as u64,
            to_ms = next.as_millis() as u64,
            reason,
            "Backing off request rate"
        );
        state.delay = next;
    }

    /// Current inter-request delay.
    pub fn current_delay(&self) -> Duration {
        self.lock().delay
    }

    /// Point-in-time view for progress reporting.
    pub fn snapshot(&self) -> RateSnapshot {
        let state = self.lock();
        RateSnapshot {
            delay: state.delay,
            successes: state.count(Outcome::Success),
            failures: state.count(Outcome::Failure),
            rate_limited: state.count(Outcome::RateLimited),
            granted: state.granted,
        }
    }
}
