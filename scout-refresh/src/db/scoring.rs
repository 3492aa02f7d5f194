//! Hand-off to the downstream scoring collaborator

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_common::Result;
use sqlx::SqlitePool;

/// Receives entities whose profile changed and needs re-scoring
#[async_trait]
pub trait ScoringSink: Send + Sync {
    async fn enqueue_scoring(&self, entity_id: i64, now: DateTime<Utc>) -> Result<()>;
}

/// Scoring requests persisted to `scoring_queue` for the scoring service to drain
///
/// One pending row per entity; repeat requests while one is pending are no-ops.
#[derive(Clone)]
pub struct SqliteScoringQueue {
    pool: SqlitePool,
}

impl SqliteScoringQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn pending(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT entity_id FROM scoring_queue ORDER BY enqueued_at, entity_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl ScoringSink for SqliteScoringQueue {
    async fn enqueue_scoring(&self, entity_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO scoring_queue (entity_id, enqueued_at) VALUES (?, ?)")
            .bind(entity_id)
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteEntityStore;
    use crate::models::EntityKind;
    use scout_common::db::init_memory_database;
    use scout_common::time::now_millis;

    #[tokio::test]
    async fn test_repeat_requests_keep_one_row() {
        let pool = init_memory_database().await.unwrap();
        let store = SqliteEntityStore::new(pool.clone());
        let queue = SqliteScoringQueue::new(pool);
        let now = now_millis();
        let id = store.insert_entity(EntityKind::Company, "Acme", now).await.unwrap();

        queue.enqueue_scoring(id, now).await.unwrap();
        queue.enqueue_scoring(id, now).await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), vec![id]);
    }
}
