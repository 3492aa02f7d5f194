//! Server-Sent Events stream of scheduler events

use crate::config::MODULE_NAME;
use crate::AppState;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

/// GET /events
///
/// Streams every `ScoutEvent`: task outcomes, retries, worker restarts,
/// state changes and run completions.
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    scout_common::sse::create_event_sse_stream(MODULE_NAME, &state.event_bus)
}
