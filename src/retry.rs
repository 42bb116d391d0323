//! Bounded retry with exponential backoff and jitter
//!
//! Used by every internally-retried operation: CAS loops on counters, lock
//! polling on transient store errors, and chunk decode retries.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the first try
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum retry delay
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Enable jitter
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: false,
            jitter_factor: 0.0,
        }
    }

    /// Base delay before retry number `attempt` (1-based), capped at `max_delay`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let multiplier = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);
        delay.min(self.max_delay)
    }

    /// Apply jitter to delay
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }

    /// Sleep before retry number `attempt`
    pub async fn backoff(&self, attempt: u32) {
        let delay = self.apply_jitter(self.calculate_delay(attempt));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `operation`, retrying while `should_retry` accepts the error and
    /// attempts remain. The last error is returned on exhaustion.
    pub async fn retry<T, E, F, Fut, P>(
        &self,
        context: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_retries && should_retry(&err) => {
                    attempt += 1;
                    debug!(
                        "Retrying {} (attempt {}/{}) after error: {}",
                        context, attempt, self.max_retries, err
                    );
                    self.backoff(attempt).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

// Default functions for serde
fn default_max_retries() -> u32 {
    25
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(20)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}
