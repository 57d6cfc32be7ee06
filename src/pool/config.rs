// ABOUTME: Immutable pool configuration, built with the same with-method chaining style
// ABOUTME: used elsewhere in this crate's public builders

use std::time::Duration;

/// Configuration for a [`crate::pool::Pool`], fixed for its whole lifetime.
///
/// # Example
///
/// ```
/// use respool::pool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::new(10, 2)
///     .with_leaky(false)
///     .with_initial_backoff(Duration::from_millis(50))
///     .with_backoff_factor(2.0);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub(crate) max: usize,
    pub(crate) min: usize,
    pub(crate) leaky: bool,
    pub(crate) initial_backoff: Duration,
    pub(crate) backoff_factor: f64,
}

impl PoolConfig {
    /// Create a configuration with `max` and `min` population bounds.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`; this is a programming error, caught at
    /// construction rather than surfaced as a recoverable error.
    pub fn new(max: usize, min: usize) -> Self {
        assert!(min <= max, "pool minimum ({min}) must not exceed maximum ({max})");
        Self {
            max,
            min,
            leaky: false,
            initial_backoff: Duration::from_millis(50),
            backoff_factor: 2.0,
        }
    }

    /// Set the overflow policy. A leaky pool creates connections beyond
    /// `max` to satisfy demand but does not retain them past a single use;
    /// a strict (non-leaky) pool never lets its available-plus-leased
    /// population exceed `max`.
    pub fn with_leaky(mut self, leaky: bool) -> Self {
        self.leaky = leaky;
        self
    }

    /// Set the delay before the first retry of a failed connection attempt.
    pub fn with_initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Set the multiplier applied to the backoff delay after each failed
    /// retry.
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }
}
