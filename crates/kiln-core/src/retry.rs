//! Bounded exponential backoff for transient infrastructure errors.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::{Error, Result};

/// Retry policy for scheduler and store calls.
///
/// Only [`Error::Transient`] failures are retried; everything else is
/// returned immediately. Once `max_retries` is exhausted the last error is
/// returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_retries > 20 {
            return Err(format!("max_retries must be <= 20, got {}", self.max_retries));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        if !(1.0..=10.0).contains(&self.multiplier) {
            return Err(format!(
                "multiplier must be between 1.0 and 10.0, got {}",
                self.multiplier
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Shorthand for wrapping a connectivity error.
pub fn transient(e: impl std::fmt::Display) -> Error {
    Error::Transient(e.to_string())
}
