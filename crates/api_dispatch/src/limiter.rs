//! Fixed-window request budget.
//!
//! [`RateLimiter::acquire`] suspends the caller until one unit of budget is
//! available in the current window. Rollover is lazy: the window only moves
//! forward when an `acquire` observes that it has elapsed, and it moves to
//! "now" in a single step rather than catching up on every missed window.
//!
//! Waiters are served first-come-first-served. The window state sits behind a
//! short synchronous critical section that is never held across a suspension.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use snafu::{Snafu, ensure};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigError, InvalidWindowSnafu, ZeroCapacitySnafu};
use crate::internal_event::{RateLimitGranted, RateLimitWaiting, emit};

/// Source of the current time for window bookkeeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Tokio's clock. Honors `tokio::time::pause` in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// The limiter was closed; no further budget will be granted.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(display("rate limiter closed"))]
pub struct Closed;

#[derive(Debug)]
struct FixedWindow {
    capacity: u32,
    window: Duration,
    start: Instant,
    remaining: u32,
}

impl FixedWindow {
    fn new(capacity: u32, window: Duration, start: Instant) -> Self {
        Self {
            capacity,
            window,
            start,
            remaining: capacity,
        }
    }

    fn roll_if_elapsed(&mut self, now: Instant) {
        if now >= self.start + self.window {
            self.start = now;
            self.remaining = self.capacity;
        }
    }

    /// Takes one unit of budget, or reports how long until the window ends.
    fn try_acquire(&mut self, now: Instant) -> Result<u32, Duration> {
        self.roll_if_elapsed(now);
        if self.remaining > 0 {
            self.remaining -= 1;
            Ok(self.remaining)
        } else {
            Err(self.wait_time(now))
        }
    }

    // A clock that moved backward would otherwise ask for more than a window.
    fn wait_time(&self, now: Instant) -> Duration {
        (self.start + self.window)
            .saturating_duration_since(now)
            .min(self.window)
    }
}

pub struct RateLimiter {
    state: Mutex<FixedWindow>,
    turnstile: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
    closed: CancellationToken,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("RateLimiter")
            .field("capacity", &state.capacity)
            .field("window", &state.window)
            .field("remaining", &state.remaining)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::with_clock(capacity, window, Arc::new(TokioClock))
    }

    pub fn with_clock(
        capacity: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        ensure!(capacity > 0, ZeroCapacitySnafu);
        ensure!(!window.is_zero(), InvalidWindowSnafu { window });

        let start = clock.now();
        Ok(Self {
            state: Mutex::new(FixedWindow::new(capacity, window, start)),
            turnstile: tokio::sync::Mutex::new(()),
            clock,
            closed: CancellationToken::new(),
        })
    }

    /// Waits for one unit of budget in the current window and consumes it.
    ///
    /// Fails only once the limiter has been [closed](Self::close); pending
    /// waiters are woken and rejected at that point.
    pub async fn acquire(&self) -> Result<(), Closed> {
        // The turnstile is fair, so waiters are granted in arrival order.
        let _turn = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(Closed),
            turn = self.turnstile.lock() => turn,
        };

        loop {
            if self.closed.is_cancelled() {
                return Err(Closed);
            }

            let attempt = {
                let now = self.clock.now();
                self.state().try_acquire(now)
            };

            match attempt {
                Ok(remaining) => {
                    emit(RateLimitGranted { remaining });
                    return Ok(());
                }
                Err(wait) => {
                    emit(RateLimitWaiting { wait });
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => return Err(Closed),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Rejects every current and future `acquire`.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(message = "Closing rate limiter.");
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Budget left in the current window, as of the last acquire.
    pub fn remaining(&self) -> u32 {
        self.state().remaining
    }

    pub fn capacity(&self) -> u32 {
        self.state().capacity
    }

    pub fn window(&self) -> Duration {
        self.state().window
    }

    fn state(&self) -> MutexGuard<'_, FixedWindow> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
