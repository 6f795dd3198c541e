//! Retry policy for provider calls
//!
//! One policy object replaces per-call retry loops: exponential backoff
//! (1s, 2s, 4s, 8s, 16s) for transient errors, `Retry-After` for rate
//! limits, immediate surfacing for everything else.

use std::time::Duration;

use log::warn;

use super::ProviderError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out
    pub fn run<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut delay = self.base_delay;
        for attempt in 1..=self.max_attempts {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let sleep_for = match &e {
                        ProviderError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => delay,
                    };
                    warn!(
                        "{what} failed (attempt {attempt}/{}), retrying in {:?}: {e}",
                        self.max_attempts, sleep_for
                    );
                    std::thread::sleep(sleep_for);
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop always returns")
    }
}
