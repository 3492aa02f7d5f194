//! Picks the entities due for refresh

use crate::db::EntityStore;
use crate::models::EntityRef;
use chrono::{DateTime, Utc};
use scout_common::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Read-only view over persistence producing the next batch of stale entities
#[derive(Clone)]
pub struct StalenessSelector {
    store: Arc<dyn EntityStore>,
    threshold: Duration,
    batch_size: usize,
}

impl StalenessSelector {
    pub fn new(store: Arc<dyn EntityStore>, threshold: Duration, batch_size: usize) -> Self {
        Self {
            store,
            threshold,
            batch_size,
        }
    }

    /// Entities stale at `now`, never-refreshed first, then oldest, ties by id
    ///
    /// `in_flight` holds entity ids that already have a task somewhere in the
    /// worker pool; those are skipped.
    pub async fn select(&self, now: DateTime<Utc>, in_flight: &HashSet<i64>) -> Result<Vec<EntityRef>> {
        self.store
            .load_entities_needing_refresh(now, self.threshold, self.batch_size, in_flight)
            .await
    }
}
