//! Scheduler control and status endpoints
//!
//! - GET  /status             loop state, lane queues, budgets, health
//! - POST /scheduler/start    resume timed ticks
//! - POST /scheduler/stop     pause timed ticks (in-flight work drains)
//! - POST /scheduler/refresh  immediate staleness tick
//! - POST /scheduler/discover immediate discovery run

use crate::services::{BudgetLevel, HealthCounters, LaneStatus};
use crate::{ApiError, ApiResult, AppState};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use scout_common::events::LoopState;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub provider: String,
    #[serde(flatten)]
    pub level: BudgetLevel,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: LoopState,
    pub running: bool,
    pub shutting_down: bool,
    /// Tasks queued, retrying or in progress across all lanes
    pub active_tasks: usize,
    pub lanes: Vec<LaneStatus>,
    pub budgets: Vec<BudgetStatus>,
    pub health: HealthCounters,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub state: LoopState,
    pub message: String,
}

/// GET /status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let budgets = state
        .rate_limiter
        .levels()
        .await
        .into_iter()
        .map(|(provider, level)| BudgetStatus { provider, level })
        .collect();

    Json(StatusResponse {
        state: state.scheduler.state().await,
        running: state.scheduler.is_running(),
        shutting_down: state.pool.is_shutting_down(),
        active_tasks: state.pool.active_count().await,
        lanes: state.pool.lane_status().await,
        budgets,
        health: state.telemetry.health(),
    })
}

/// POST /scheduler/start
pub async fn start_scheduler(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    ensure_accepting(&state)?;
    if !state.scheduler.start().await {
        return Err(ApiError::Conflict("Scheduler is already running".to_string()));
    }
    info!("Scheduler started via admin API");

    Ok(Json(ControlResponse {
        state: state.scheduler.state().await,
        message: "Scheduler started".to_string(),
    }))
}

/// POST /scheduler/stop
pub async fn stop_scheduler(State(state): State<AppState>) -> ApiResult<Json<ControlResponse>> {
    if !state.scheduler.stop().await {
        return Err(ApiError::Conflict("Scheduler is already stopped".to_string()));
    }
    info!("Scheduler stopped via admin API");

    Ok(Json(ControlResponse {
        state: state.scheduler.state().await,
        message: "Scheduler stopped; in-flight tasks keep draining".to_string(),
    }))
}

/// POST /scheduler/refresh
///
/// Runs even while timed ticks are stopped.
pub async fn trigger_refresh(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<ControlResponse>)> {
    ensure_accepting(&state)?;
    state.scheduler.trigger_refresh();
    info!("Immediate refresh requested via admin API");

    Ok((
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            state: state.scheduler.state().await,
            message: "Refresh tick requested".to_string(),
        }),
    ))
}

/// POST /scheduler/discover
pub async fn trigger_discovery(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<ControlResponse>)> {
    ensure_accepting(&state)?;
    if !state.scheduler.has_discovery() {
        return Err(ApiError::NotFound("Discovery is not configured".to_string()));
    }
    state.scheduler.trigger_discovery();
    info!("Immediate discovery requested via admin API");

    Ok((
        StatusCode::ACCEPTED,
        Json(ControlResponse {
            state: state.scheduler.state().await,
            message: "Discovery run requested".to_string(),
        }),
    ))
}

fn ensure_accepting(state: &AppState) -> ApiResult<()> {
    if state.pool.is_shutting_down() {
        return Err(crate::error::RefreshError::ShuttingDown.into());
    }
    Ok(())
}

/// Build admin routes
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/scheduler/start", post(start_scheduler))
        .route("/scheduler/stop", post(stop_scheduler))
        .route("/scheduler/refresh", post(trigger_refresh))
        .route("/scheduler/discover", post(trigger_discovery))
}
