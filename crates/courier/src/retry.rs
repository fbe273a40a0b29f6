//! # Reconnect Policy Module
//!
//! Bounded retry with exponential backoff for re-establishing a failed
//! connection. The core never loops unboundedly: a connection makes one
//! attempt plus at most `max_retries` more, sleeping for the policy's backoff
//! between attempts.
//!
//! The backoff is pluggable: the default is exponential with jitter, and a
//! caller can install any `Fn(u32) -> Duration` via [`RetryPolicy::with_backoff_fn`].

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied backoff function, receives the 0-based retry attempt
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Retry policy for reconnect attempts
///
/// # Examples
///
/// ```rust
/// use courier::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: no retries beyond the single reconnect attempt
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_retries, 0);
///
/// // Custom policy with a fixed backoff
/// let policy = RetryPolicy::new(3, Duration::from_millis(50), Duration::from_secs(1), 2.0)
///     .with_backoff_fn(|_| Duration::from_millis(10));
/// assert_eq!(policy.calculate_delay(2), Duration::from_millis(10));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first one
    pub max_retries: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as percentage (default 25% = ±25%)
    pub jitter_percent: f64,

    backoff_fn: Option<BackoffFn>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("use_jitter", &self.use_jitter)
            .field("custom_backoff", &self.backoff_fn.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            use_jitter: config.use_jitter,
            jitter_percent: 0.25,
            backoff_fn: None,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Attempts allowed after the first failure
    /// * `initial_delay` - Delay before the first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Exponential growth factor
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
            backoff_fn: None,
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Replace the exponential backoff with a caller-supplied function
    pub fn with_backoff_fn<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff_fn = Some(Arc::new(backoff));
        self
    }

    /// Calculate delay before retry `attempt` (0-based)
    ///
    /// Uses `initial * multiplier^attempt`, capped at `max_delay`, unless a
    /// backoff function is installed.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if let Some(backoff) = &self.backoff_fn {
            return backoff(attempt);
        }

        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Check if retry `attempt` (0-based) is still allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Total number of connect attempts (initial + retries)
    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
