//! Unit of refresh work

use crate::models::EntityRef;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// One entity queued for one provider lane
///
/// Owned by exactly one place at a time: a lane queue, a worker, or a
/// pending retry timer.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshTask {
    pub task_id: Uuid,
    pub entity: EntityRef,
    /// Lane name; also the provider identity for uniqueness
    pub provider: String,
    /// Scheduler tick (or discovery run) that produced the task
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far
    pub attempt_count: u32,
    pub last_backoff: Option<Duration>,
    /// Times a worker died while holding this task
    pub crash_count: u32,
}

/// In-flight uniqueness key
pub type TaskKey = (i64, String);

impl RefreshTask {
    pub fn new(entity: EntityRef, provider: impl Into<String>, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            entity,
            provider: provider.into(),
            enqueued_at,
            attempt_count: 0,
            last_backoff: None,
            crash_count: 0,
        }
    }

    pub fn entity_id(&self) -> i64 {
        self.entity.id
    }

    pub fn key(&self) -> TaskKey {
        (self.entity.id, self.provider.clone())
    }
}
