//! Event types for the scout event system
//!
//! Provides the shared event definitions and EventBus. Every terminal refresh
//! outcome, scheduler transition and maintenance pass is published here; the
//! admin SSE stream and the tracing sink both consume it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Scheduler loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting for the next tick
    Idle,
    /// Querying for stale entities
    Selecting,
    /// Handing tasks to the worker pool
    Dispatching,
    /// Ticks suspended by an operator (workers keep draining)
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Selecting => "selecting",
            LoopState::Dispatching => "dispatching",
            LoopState::Stopped => "stopped",
        }
    }
}

/// Scout event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScoutEvent {
    /// A refresh task finished with fetched data merged into the entity
    RefreshSucceeded {
        entity_id: i64,
        provider: String,
        /// Failed attempts before the successful one
        attempts: u32,
        /// Value written to last_refreshed_at
        refreshed_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A refresh task was dropped without a terminal provider verdict
    ///
    /// Covers retry exhaustion, upsert exhaustion and shutdown. The entity
    /// stays eligible for the next staleness cycle.
    RefreshAbandoned {
        entity_id: i64,
        provider: String,
        attempts: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Provider reported a non-retryable failure; entity is cooling down
    RefreshFailedPermanent {
        entity_id: i64,
        provider: String,
        cause: String,
        /// Entity will not be re-selected before this instant
        blocked_until: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// A retryable failure put the task back after a backoff delay
    RefreshRetryScheduled {
        entity_id: i64,
        provider: String,
        /// Failed attempts so far, this one included
        attempt: u32,
        delay_ms: u64,
        cause: String,
        timestamp: DateTime<Utc>,
    },

    /// A worker panicked; it was restarted and its task requeued
    WorkerRestarted {
        lane: String,
        worker: usize,
        entity_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// Scheduler loop changed state
    SchedulerStateChanged {
        old_state: LoopState,
        new_state: LoopState,
        timestamp: DateTime<Utc>,
    },

    /// One staleness tick finished
    TickCompleted {
        selected: usize,
        enqueued: usize,
        timestamp: DateTime<Utc>,
    },

    /// One discovery run finished
    DiscoveryCompleted {
        queries: usize,
        candidates: usize,
        discovered: usize,
        timestamp: DateTime<Utc>,
    },

    /// Maintenance sweep finished
    MaintenanceCompleted {
        expired_failures_removed: u64,
        timestamp: DateTime<Utc>,
    },
}

impl ScoutEvent {
    /// Event name used for SSE `event:` lines and log messages
    pub fn event_type(&self) -> &'static str {
        match self {
            ScoutEvent::RefreshSucceeded { .. } => "RefreshSucceeded",
            ScoutEvent::RefreshAbandoned { .. } => "RefreshAbandoned",
            ScoutEvent::RefreshFailedPermanent { .. } => "RefreshFailedPermanent",
            ScoutEvent::RefreshRetryScheduled { .. } => "RefreshRetryScheduled",
            ScoutEvent::WorkerRestarted { .. } => "WorkerRestarted",
            ScoutEvent::SchedulerStateChanged { .. } => "SchedulerStateChanged",
            ScoutEvent::TickCompleted { .. } => "TickCompleted",
            ScoutEvent::DiscoveryCompleted { .. } => "DiscoveryCompleted",
            ScoutEvent::MaintenanceCompleted { .. } => "MaintenanceCompleted",
        }
    }

    /// True for the three terminal task outcomes
    pub fn is_terminal_outcome(&self) -> bool {
        matches!(
            self,
            ScoutEvent::RefreshSucceeded { .. }
                | ScoutEvent::RefreshAbandoned { .. }
                | ScoutEvent::RefreshFailedPermanent { .. }
        )
    }

    /// Entity id for task-scoped events
    pub fn entity_id(&self) -> Option<i64> {
        match self {
            ScoutEvent::RefreshSucceeded { entity_id, .. }
            | ScoutEvent::RefreshAbandoned { entity_id, .. }
            | ScoutEvent::RefreshFailedPermanent { entity_id, .. }
            | ScoutEvent::RefreshRetryScheduled { entity_id, .. }
            | ScoutEvent::WorkerRestarted { entity_id, .. } => Some(*entity_id),
            _ => None,
        }
    }
}

/// Broadcast channel for ScoutEvents
///
/// Cloning is cheap; all clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ScoutEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<ScoutEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ScoutEvent,
    ) -> Result<usize, broadcast::error::SendError<ScoutEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ScoutEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
