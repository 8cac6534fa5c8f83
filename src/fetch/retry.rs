use crate::error::FetchError;
use crate::utils::CancelToken;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Bounded exponential backoff for transient fetch failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per failure streak, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `failures` (1-based): `base * 2^(failures-1)`, capped
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts.max(1)
    }

    /// Sleep for the backoff delay, waking early on cancellation
    pub fn backoff(&self, failures: u32, cancel: &CancelToken) -> Result<(), FetchError> {
        let deadline = Instant::now() + self.delay(failures);
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}
