//! Per-provider token buckets
//!
//! Each provider owns one [`ProviderBudget`]. Refill is computed lazily when a
//! caller asks for a token; nothing runs in the background.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Capacity and refill rate for one provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetConfig {
    pub capacity: u32,
    /// Tokens per second
    pub refill_rate: f64,
}

#[derive(Debug, Error, PartialEq)]
pub enum RateLimitError {
    #[error("no budget configured for provider '{0}'")]
    UnknownProvider(String),

    /// No token became available within the wait timeout
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

/// Token bucket state for one provider
#[derive(Debug, Clone)]
pub struct ProviderBudget {
    capacity: f64,
    available_tokens: f64,
    refill_rate: f64,
    /// Refill baseline; may sit in the future while a provider cooldown runs
    last_refill_at: Instant,
}

impl ProviderBudget {
    /// Full bucket
    pub fn new(config: BudgetConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity);
        Self {
            capacity,
            available_tokens: capacity,
            refill_rate: config.refill_rate,
            last_refill_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill_at {
            return;
        }
        let elapsed = (now - self.last_refill_at).as_secs_f64();
        self.available_tokens = (self.available_tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill_at = now;
    }

    /// Take one token, or report how long until one is available
    pub fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);

        let cooldown = self.last_refill_at.saturating_duration_since(now);
        if cooldown.is_zero() && self.available_tokens >= 1.0 {
            self.available_tokens -= 1.0;
            return Ok(());
        }

        Err(cooldown.saturating_add(self.time_to_one_token()))
    }

    fn time_to_one_token(&self) -> Duration {
        let missing = (1.0 - self.available_tokens).max(0.0);
        if missing == 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Honor a provider-reported cooldown: empty the bucket and push the next
    /// refill out to `now + retry_after` (never pulls an existing cooldown in)
    pub fn defer(&mut self, now: Instant, retry_after: Duration) {
        self.refill(now);
        if let Some(resume_at) = now.checked_add(retry_after) {
            if resume_at > self.last_refill_at {
                self.last_refill_at = resume_at;
            }
        }
        self.available_tokens = 0.0;
    }

    /// Point-in-time view for the admin surface
    pub fn level(&self, now: Instant) -> BudgetLevel {
        let mut view = self.clone();
        view.refill(now);
        BudgetLevel {
            capacity: self.capacity as u32,
            available_tokens: view.available_tokens,
            refill_rate: self.refill_rate,
            cooldown_ms: view.last_refill_at.saturating_duration_since(now).as_millis() as u64,
        }
    }
}

/// Budget snapshot reported by `/status`
#[derive(Debug, Clone, Serialize)]
pub struct BudgetLevel {
    pub capacity: u32,
    pub available_tokens: f64,
    pub refill_rate: f64,
    pub cooldown_ms: u64,
}

/// Token-bucket rate limiter keyed by provider name
///
/// Budgets are owned here and injected at construction; callers share the
/// limiter through an `Arc`.
pub struct RateLimiter {
    budgets: HashMap<String, Mutex<ProviderBudget>>,
    wait_timeout: Duration,
}

impl RateLimiter {
    pub fn new(budgets: HashMap<String, BudgetConfig>, wait_timeout: Duration) -> Self {
        let now = Instant::now();
        let budgets = budgets
            .into_iter()
            .map(|(name, config)| (name, Mutex::new(ProviderBudget::new(config, now))))
            .collect();

        Self {
            budgets,
            wait_timeout,
        }
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.budgets.contains_key(provider)
    }

    /// Wait for a token from `provider`'s budget
    ///
    /// Suspends only the calling task. Fails with `RateLimited` once the
    /// wait timeout would be exceeded.
    pub async fn acquire(&self, provider: &str) -> Result<(), RateLimitError> {
        let budget = self
            .budgets
            .get(provider)
            .ok_or_else(|| RateLimitError::UnknownProvider(provider.to_string()))?;
        let deadline = Instant::now() + self.wait_timeout;

        loop {
            let now = Instant::now();
            let wait = match budget.lock().await.try_take(now) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if now.checked_add(wait).map_or(true, |ready| ready > deadline) {
                debug!(provider, wait_ms = wait.as_millis() as u64, "Token wait exceeds timeout");
                return Err(RateLimitError::RateLimited { retry_after: wait });
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Fold a provider's own cooldown signal into its bucket
    pub async fn release_on_failure(&self, provider: &str, retry_after: Duration) {
        match self.budgets.get(provider) {
            Some(budget) => {
                warn!(
                    provider,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Provider requested cooldown"
                );
                budget.lock().await.defer(Instant::now(), retry_after);
            }
            None => warn!(provider, "Cooldown reported for provider without a budget"),
        }
    }

    /// Current level of every budget, sorted by provider name
    pub async fn levels(&self) -> Vec<(String, BudgetLevel)> {
        let now = Instant::now();
        let mut levels = Vec::with_capacity(self.budgets.len());
        for (name, budget) in &self.budgets {
            levels.push((name.clone(), budget.lock().await.level(now)));
        }
        levels.sort_by(|a, b| a.0.cmp(&b.0));
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32, refill_rate: f64, wait_timeout: Duration) -> RateLimiter {
        let mut budgets = HashMap::new();
        budgets.insert(
            "serp".to_string(),
            BudgetConfig {
                capacity,
                refill_rate,
            },
        );
        RateLimiter::new(budgets, wait_timeout)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_then_wait() {
        let limiter = limiter(3, 1.0, Duration::from_secs(30));

        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("serp").await.unwrap();
        }
        assert_eq!(Instant::now(), start);

        limiter.acquire("serp").await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_rate_limited() {
        let limiter = limiter(1, 0.1, Duration::from_secs(2));
        limiter.acquire("serp").await.unwrap();

        let err = limiter.acquire("serp").await.unwrap_err();
        match err {
            RateLimitError::RateLimited { retry_after } => {
                assert!(retry_after > Duration::from_secs(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_on_failure_honors_provider_cooldown() {
        let limiter = limiter(5, 10.0, Duration::from_secs(60));
        let start = Instant::now();

        limiter
            .release_on_failure("serp", Duration::from_secs(10))
            .await;
        limiter.acquire("serp").await.unwrap();

        assert!(Instant::now() - start >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let limiter = limiter(1, 1.0, Duration::from_secs(1));
        assert_eq!(
            limiter.acquire("nitter").await,
            Err(RateLimitError::UnknownProvider("nitter".to_string()))
        );
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let start = Instant::now();
        let mut budget = ProviderBudget::new(
            BudgetConfig {
                capacity: 2,
                refill_rate: 1.0,
            },
            start,
        );
        budget.try_take(start).unwrap();
        budget.try_take(start).unwrap();
        assert!(budget.try_take(start).is_err());

        let later = start + Duration::from_secs(3600);
        assert_eq!(budget.level(later).available_tokens, 2.0);
    }
}
