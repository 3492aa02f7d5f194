//! Merge fetched payloads into persisted entities
//!
//! One transaction per entity; transient persistence errors are retried a
//! bounded number of times. Scoring is requested after commit and never
//! affects the outcome of the merge.

use crate::db::{EntityStore, ScoringSink};
use crate::models::{EntityPayload, RefreshTask};
use crate::services::backoff::retry_transient;
use chrono::{DateTime, Utc};
use scout_common::time::now_millis;
use scout_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Bounded retry settings for persistence writes
#[derive(Debug, Clone, Copy)]
pub struct UpsertRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

pub struct UpsertPipeline {
    store: Arc<dyn EntityStore>,
    scoring: Arc<dyn ScoringSink>,
    retry: UpsertRetry,
}

impl UpsertPipeline {
    pub fn new(store: Arc<dyn EntityStore>, scoring: Arc<dyn ScoringSink>, retry: UpsertRetry) -> Self {
        Self {
            store,
            scoring,
            retry,
        }
    }

    /// Merge `payload` for `task`'s entity
    ///
    /// `last_refreshed_at` becomes the tick timestamp the task was created
    /// with. Returns that timestamp. On error nothing was written.
    pub async fn apply(&self, task: &RefreshTask, payload: &EntityPayload) -> Result<DateTime<Utc>> {
        let entity_id = task.entity_id();
        let refreshed_at = task.enqueued_at;

        retry_transient(
            "entity upsert",
            self.retry.max_attempts,
            self.retry.base_delay,
            || self.store.upsert_entity(entity_id, payload, refreshed_at),
        )
        .await?;

        self.schedule_scoring(entity_id);
        Ok(refreshed_at)
    }

    /// Record a permanent provider failure, retried like an upsert
    pub async fn mark_failed_permanent(
        &self,
        task: &RefreshTask,
        cause: &str,
        blocked_until: DateTime<Utc>,
    ) -> Result<()> {
        let entity_id = task.entity_id();
        let failed_at = now_millis();

        retry_transient(
            "permanent failure record",
            self.retry.max_attempts,
            self.retry.base_delay,
            || {
                self.store.mark_refresh_failed_permanent(
                    entity_id,
                    &task.provider,
                    cause,
                    failed_at,
                    blocked_until,
                )
            },
        )
        .await
    }

    fn schedule_scoring(&self, entity_id: i64) {
        let scoring = Arc::clone(&self.scoring);
        tokio::spawn(async move {
            if let Err(e) = scoring.enqueue_scoring(entity_id, now_millis()).await {
                warn!(entity_id, error = %e, "Failed to enqueue scoring");
            }
        });
    }
}
