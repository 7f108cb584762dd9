use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::Config;

/// Exponential backoff for throttled completion calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.retry_max_attempts.max(1),
            initial_delay: cfg.retry_initial_delay,
            max_delay: cfg.retry_max_delay,
        }
    }

    /// Un-jittered wait before `attempt` (1-based). Zero for the first attempt,
    /// then `initial_delay`, doubling each time, capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 2).min(31);
        self.initial_delay
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `base × (1 + fraction)`, with `fraction` clamped to `[0, 1]`.
    pub fn jittered(base: Duration, fraction: f64) -> Duration {
        base.mul_f64(1.0 + fraction.clamp(0.0, 1.0))
    }
}

/// Source of the random fraction added to each backoff delay.
pub trait JitterSource: Send + Sync {
    /// A value in `[0, 1)`.
    fn fraction(&self) -> f64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RandJitter;

impl JitterSource for RandJitter {
    fn fraction(&self) -> f64 {
        rand::rng().random::<f64>()
    }
}

/// Deterministic jitter for tests and reproducible runs.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn fraction(&self) -> f64 {
        self.0
    }
}

/// Emitted before sleeping ahead of a retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryNotice {
    /// The attempt that was just throttled (1-based).
    pub attempt: u32,
    pub max_attempts: u32,
    pub wait: Duration,
}

#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_retry(&self, notice: RetryNotice);
}
