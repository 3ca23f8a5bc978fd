//! Retry cadence controller.
//!
//! Tracks consecutive transmission failures and doubles the retry delay on
//! each one, capped at [`MAX_BACKOFF`]:
//!
//! ```text
//! delay[k] = min(INITIAL_BACKOFF * 2^k, MAX_BACKOFF)
//! ```
//!
//! Any success resets both the counter and the delay. The drain scheduler
//! reads the controller to pick its next re-arm delay but never resets it.

use std::time::Duration;

/// Delay before the first retry after a success.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);

/// Upper bound for the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(60_000);

/// Growth factor applied on every failure.
const BACKOFF_MULTIPLIER: u32 = 2;

/// Point-in-time view of the backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSnapshot {
    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Current retry delay
    pub delay: Duration,
}

/// Exponential backoff over consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    consecutive_failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            consecutive_failures: 0,
        }
    }

    /// Reset after a successful transmission.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current = self.initial;
    }

    /// Register a failed attempt and return the new retry delay.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current = self
            .current
            .saturating_mul(BACKOFF_MULTIPLIER)
            .min(self.max);
        self.current
    }

    /// Delay until the next drain: the backoff delay while failing, the
    /// normal flush interval otherwise.
    pub fn next_delay(&self, flush_interval: Duration) -> Duration {
        if self.consecutive_failures > 0 {
            self.current
        } else {
            flush_interval
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        BackoffSnapshot {
            consecutive_failures: self.consecutive_failures,
            delay: self.current,
        }
    }
}
