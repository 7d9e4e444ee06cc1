//! Retry delay strategies for listener retries and queue polling.
//!
//! ```text
//! attempt   exponential (initial=500ms, x1.5, ±50%)
//! ──────────────────────────────────────────────
//!    1          250ms - 750ms
//!    2          375ms - 1.125s
//!    3          562ms - 1.687s
//!   ...         capped at max_interval
//! ```

use std::sync::Arc;
use std::time::Duration;

const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MULTIPLIER: f64 = 1.5;
const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(60);

/// A stateful sequence of retry delays.
pub trait Backoff: Send {
    /// Delay before the next attempt, or `None` to stop retrying.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Start the sequence over.
    fn reset(&mut self);
}

/// Produces a fresh [`Backoff`] for each retry loop.
pub type BackoffFactory = Arc<dyn Fn() -> Box<dyn Backoff> + Send + Sync>;

/// Exponentially growing delays with randomization.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Fraction of the current interval used as jitter (0.0 disables it).
    pub randomization_factor: f64,
    pub max_interval: Duration,
    current: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL)
    }
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: DEFAULT_MULTIPLIER,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            max_interval,
            current: initial_interval,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor.clamp(0.0, 1.0);
        self
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization_factor == 0.0 {
            return interval;
        }

        let nanos = interval.as_nanos() as f64;
        let delta = nanos * self.randomization_factor;
        let jittered = nanos - delta + fastrand::f64() * 2.0 * delta;

        Duration::from_nanos(jittered.max(0.0).round() as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        let interval = self.current;
        let grown = Duration::from_nanos((interval.as_nanos() as f64 * self.multiplier).round() as u64);
        self.current = grown.min(self.max_interval);

        Some(self.jittered(interval))
    }

    fn reset(&mut self) {
        self.current = self.initial_interval;
    }
}

/// The same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff {
    pub interval: Duration,
}

impl ConstantBackoff {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for ConstantBackoff {
    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.interval)
    }

    fn reset(&mut self) {}
}

/// Factory for the default exponential strategy.
pub fn exponential() -> BackoffFactory {
    Arc::new(|| Box::new(ExponentialBackoff::default()))
}

/// Factory for a constant delay.
pub fn constant(interval: Duration) -> BackoffFactory {
    Arc::new(move || Box::new(ConstantBackoff::new(interval)))
}
