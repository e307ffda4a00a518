//! Reconnection backoff
//!
//! After an unexpected close the connection asks its strategy how long to
//! wait before the next attempt. The strategy counts consecutive failures
//! and is reset on every successful open.
//!
//! # Built-in Strategies
//!
//! - **ExponentialBackoff**: `min * factor^attempts`, capped at `max`
//!   (default 100 ms doubling up to 60 s)
//! - **FixedDelay**: constant delay between attempts
//!
//! Strategies never give up: the connection keeps retrying until a caller
//! disconnects deliberately.
//!
//! # Examples
//!
//! ```rust
//! use ledgerws_client::{ExponentialBackoff, ReconnectionStrategy};
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! assert_eq!(backoff.next_delay(), Duration::from_millis(200));
//! assert_eq!(backoff.attempts(), 2);
//!
//! backoff.reset();
//! assert_eq!(backoff.next_delay(), Duration::from_millis(100));
//! ```

use std::time::Duration;

/// Trait for reconnection strategies
///
/// Implementations must return a non-decreasing sequence of delays between
/// resets, and must never exceed their own configured ceiling.
pub trait ReconnectionStrategy: Send + Sync {
    /// Returns the delay before the next attempt and counts the attempt.
    fn next_delay(&mut self) -> Duration;

    /// Forget accumulated failures; the next delay starts over.
    fn reset(&mut self);

    /// Number of delays handed out since the last reset.
    fn attempts(&self) -> u32;
}

/// Exponential backoff with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
    factor: u32,
    jitter: bool,
    attempts: u32,
    last_delay: Duration,
}

impl ExponentialBackoff {
    /// Create a doubling backoff between `min_delay` and `max_delay`
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            factor: 2,
            jitter: false,
            attempts: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Change the growth factor (values below 1 are treated as 1)
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Add up to 25% random jitter to each delay
    ///
    /// Jittered delays are still clamped so the sequence never shrinks and
    /// never passes `max_delay`.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    fn base_delay(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let growth = (self.factor as u64).saturating_pow(self.attempts);
        Duration::from_millis(min.saturating_mul(growth).min(max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(60))
    }
}

impl ReconnectionStrategy for ExponentialBackoff {
    fn next_delay(&mut self) -> Duration {
        let mut delay = self.base_delay();

        if self.jitter {
            use rand::Rng;
            let ms = delay.as_millis() as u64;
            let jitter_ms = rand::thread_rng().gen_range(0..=(ms / 4));
            delay = Duration::from_millis(ms + jitter_ms);
        }

        delay = delay.max(self.last_delay).min(self.max_delay);
        self.last_delay = delay;
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.last_delay = Duration::ZERO;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Fixed delay reconnection strategy
#[derive(Debug, Clone)]
pub struct FixedDelay {
    delay: Duration,
    attempts: u32,
}

impl FixedDelay {
    /// Create a new fixed delay strategy
    pub fn new(delay: Duration) -> Self {
        Self { delay, attempts: 0 }
    }
}

impl ReconnectionStrategy for FixedDelay {
    fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}
