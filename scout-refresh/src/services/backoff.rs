//! Retry delays and bounded persistence retries

use rand::Rng;
use scout_common::Result;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped, plus jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the random jitter as a fraction of `base`
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter_ratio: 0.5,
        }
    }

    /// Un-jittered exponential delay for `attempt` (0-based)
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Delay before retry number `attempt`
    ///
    /// Never shorter than `previous` (delays for one task only grow) nor
    /// than `floor` (a provider-reported retry-after).
    pub fn delay(&self, attempt: u32, previous: Option<Duration>, floor: Option<Duration>) -> Duration {
        let max_jitter = self.base.mul_f64(self.jitter_ratio.max(0.0));
        let jitter = if max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=max_jitter)
        };

        let delay = self.exponential(attempt).saturating_add(jitter);
        delay
            .max(previous.unwrap_or_default())
            .max(floor.unwrap_or_default())
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// `max_attempts` is used up
///
/// Delay doubles from `base` between attempts.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    max_attempts: u32,
    base: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = base;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Persistence operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient persistence error, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(err) => {
                if err.is_transient() {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Persistence retries exhausted"
                    );
                }
                return Err(err);
            }
        }
    }
}
