//! Exponential backoff schedule with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule shared by every fallible external operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
    /// Randomize half of each delay so concurrent retries spread out.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Schedule used for state checkpoints on slow or syncing filesystems.
    pub fn state_store() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }

    /// Retry schedule without any sleeping, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Delay before retrying after the `failures`-th failed attempt (1-based), without jitter.
    pub fn nominal_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay before the next attempt, with equal jitter applied when enabled.
    pub fn delay(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        if !self.jitter {
            return nominal;
        }
        let millis = u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX);
        let half = millis / 2;
        if half == 0 {
            return nominal;
        }
        Duration::from_millis(half + rand::thread_rng().gen_range(0..=half))
    }
}
