//! External data providers
//!
//! Each adapter performs one fetch for one entity and classifies the outcome
//! as a [`FetchResult`]. Transport details never leak past this module.

pub mod nitter;
pub mod serp;

use crate::models::{EntityRef, FetchResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use nitter::NitterProvider;
pub use serp::{SerpApiClient, SerpDiscoverySource, SerpProvider};

/// One provider's fetch-or-fail function
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name; also the rate limiter budget key
    fn name(&self) -> &str;

    async fn fetch(&self, entity: &EntityRef) -> FetchResult;
}

/// Adapters by provider name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Cooldown assumed when a 429 carries no usable Retry-After
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Longest provider cooldown we honor
const MAX_RETRY_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Map a non-success HTTP status to a failure outcome
///
/// Returns `None` for 2xx.
pub fn classify_status<T>(status: StatusCode, retry_after: Option<Duration>) -> Option<FetchResult<T>> {
    if status.is_success() {
        return None;
    }

    let result = match status {
        StatusCode::TOO_MANY_REQUESTS => FetchResult::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER).min(MAX_RETRY_AFTER),
        },
        StatusCode::REQUEST_TIMEOUT => FetchResult::transient(format!("HTTP {}", status)),
        s if s.is_server_error() => FetchResult::transient(format!("HTTP {}", status)),
        s => FetchResult::permanent(format!("HTTP {}", s)),
    };
    Some(result)
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Classify a transport-level failure
pub fn classify_transport_error<T>(err: &reqwest::Error) -> FetchResult<T> {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchResult::transient(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status, None).unwrap_or_else(|| FetchResult::transient(err.to_string()))
    } else if err.is_decode() {
        FetchResult::permanent(format!("undecodable response: {}", err))
    } else {
        FetchResult::transient(err.to_string())
    }
}

/// Build the shared HTTP client
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("scout-refresh/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}
