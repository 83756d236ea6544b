//! Backoff between attempts.
//!
//! One policy type serves two callers: the dispatcher delays re-enqueued
//! jobs with it, and service loops wait with it after the store failed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * 2^(failures - 1)`, capped at `max_delay`.
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" => Ok(BackoffStrategy::Fixed),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy '{other}' (fixed|exponential)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Execution budget per job, the first attempt included.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay (0.0-1.0) that is spread per key.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter: 0.1,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before the next try after `failures` consecutive failures.
    ///
    /// `spread_key` (a job id, a service name) shifts the delay by up to
    /// `jitter` of its length, so jobs that failed together do not come back
    /// together. The same key always gets the same delay.
    pub fn delay_after(&self, failures: u32, spread_key: &str) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay.as_millis() as f64;
        let cap = self.max_delay.as_millis().max(self.base_delay.as_millis()) as f64;
        let nominal = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let doublings = failures.saturating_sub(1).min(62) as i32;
                (base * 2_f64.powi(doublings)).min(cap)
            }
        };

        let spread = nominal * self.jitter.clamp(0.0, 1.0);
        let offset = if spread > 0.0 {
            spread * (unit_hash(spread_key, failures) * 2.0 - 1.0)
        } else {
            0.0
        };

        Duration::from_millis((nominal + offset).clamp(0.0, cap) as u64)
    }
}

/// Stable value in `[0, 1)` for `(key, failures)`.
fn unit_hash(key: &str, failures: u32) -> f64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    failures.hash(&mut hasher);
    (hasher.finish() % 10_000) as f64 / 10_000.0
}
