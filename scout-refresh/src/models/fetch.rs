//! Classified outcome of one provider call

use crate::models::EntityPayload;
use std::time::Duration;

/// Provider call outcome, classified by the adapter
///
/// Adapters map transport and HTTP failures into these four cases; the
/// worker pool decides what to do with each one.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult<T = EntityPayload> {
    Success(T),
    /// Provider asked us to slow down
    RateLimited { retry_after: Duration },
    /// Network blip, 5xx, timeout: worth retrying
    TransientError { cause: String },
    /// Not found, bad request, unparseable entity: retrying will not help
    PermanentError { cause: String },
}

impl<T> FetchResult<T> {
    pub fn transient(cause: impl Into<String>) -> Self {
        FetchResult::TransientError {
            cause: cause.into(),
        }
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        FetchResult::PermanentError {
            cause: cause.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchResult::RateLimited { .. } | FetchResult::TransientError { .. }
        )
    }

    /// Short label for logs and events
    pub fn label(&self) -> &'static str {
        match self {
            FetchResult::Success(_) => "success",
            FetchResult::RateLimited { .. } => "rate_limited",
            FetchResult::TransientError { .. } => "transient_error",
            FetchResult::PermanentError { .. } => "permanent_error",
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchResult<U> {
        match self {
            FetchResult::Success(value) => FetchResult::Success(f(value)),
            FetchResult::RateLimited { retry_after } => FetchResult::RateLimited { retry_after },
            FetchResult::TransientError { cause } => FetchResult::TransientError { cause },
            FetchResult::PermanentError { cause } => FetchResult::PermanentError { cause },
        }
    }
}
