//! scout-refresh library interface
//!
//! Keeps company and founder profiles fresh: a timer-driven loop selects
//! stale entities, per-provider worker lanes fetch them under a token-bucket
//! budget, and an idempotent upsert merges the results.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod providers;
pub mod services;

pub use crate::error::{ApiError, ApiResult, RefreshError};

use axum::Router;
use chrono::{DateTime, Utc};
use scout_common::events::EventBus;
use services::{RateLimiter, Scheduler, Telemetry, WorkerPool};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub pool: Arc<WorkerPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub telemetry: Telemetry,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, rate_limiter: Arc<RateLimiter>, telemetry: Telemetry) -> Self {
        Self {
            pool: Arc::clone(scheduler.pool()),
            event_bus: telemetry.event_bus().clone(),
            scheduler,
            rate_limiter,
            telemetry,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::admin_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
