//! Discovery lane: broad searches for entities we do not track yet
//!
//! Unseen names are inserted with a null `last_refreshed_at` and queued on
//! the discovery lane. Known names are skipped. Query submission is paced so
//! a long query list does not burst against the provider.

use crate::db::EntityStore;
use crate::error::RefreshError;
use crate::models::{EntityKind, FetchResult, RefreshTask};
use crate::services::rate_limiter::{RateLimitError, RateLimiter};
use crate::services::worker_pool::{EnqueueOutcome, WorkerPool};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Pacer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One broad search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub query: String,
    /// Recency filter such as `m6` (last six months)
    #[serde(default)]
    pub time_filter: Option<String>,
}

/// A profile found by a broad search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: EntityKind,
    pub name: String,
}

/// Where discovery candidates come from
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Rate budget the searches draw from
    fn provider(&self) -> &str;

    async fn search(&self, query: &DiscoveryQuery) -> FetchResult<Vec<Candidate>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub queries: usize,
    pub candidates: usize,
    pub discovered: usize,
    pub enqueued: usize,
}

type QueryPacer = Pacer<NotKeyed, InMemoryState, DefaultClock>;

pub struct DiscoveryLane {
    source: Arc<dyn DiscoverySource>,
    store: Arc<dyn EntityStore>,
    rate_limiter: Arc<RateLimiter>,
    queries: Vec<DiscoveryQuery>,
    lane: String,
    pacer: Option<QueryPacer>,
}

impl DiscoveryLane {
    /// `query_spacing` of zero disables pacing
    pub fn new(
        source: Arc<dyn DiscoverySource>,
        store: Arc<dyn EntityStore>,
        rate_limiter: Arc<RateLimiter>,
        queries: Vec<DiscoveryQuery>,
        lane: impl Into<String>,
        query_spacing: Duration,
    ) -> Self {
        let pacer = Quota::with_period(query_spacing).map(QueryPacer::direct);
        Self {
            source,
            store,
            rate_limiter,
            queries,
            lane: lane.into(),
            pacer,
        }
    }

    /// Run every configured query once and queue what is new
    pub async fn run(&self, pool: &WorkerPool, now: DateTime<Utc>) -> Result<DiscoveryReport, RefreshError> {
        let mut report = DiscoveryReport::default();
        let mut seen = HashSet::new();

        for query in &self.queries {
            if let Some(pacer) = &self.pacer {
                pacer.until_ready().await;
            }

            match self.rate_limiter.acquire(self.source.provider()).await {
                Ok(()) => {}
                Err(RateLimitError::RateLimited { retry_after }) => {
                    warn!(
                        query = %query.query,
                        retry_after_ms = retry_after.as_millis() as u64,
                        "Discovery query skipped, budget exhausted"
                    );
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Discovery source has no rate budget");
                    break;
                }
            }
            report.queries += 1;

            let candidates = match self.source.search(query).await {
                FetchResult::Success(candidates) => candidates,
                FetchResult::RateLimited { retry_after } => {
                    self.rate_limiter
                        .release_on_failure(self.source.provider(), retry_after)
                        .await;
                    continue;
                }
                FetchResult::TransientError { cause } | FetchResult::PermanentError { cause } => {
                    warn!(query = %query.query, cause = %cause, "Discovery query failed");
                    continue;
                }
            };
            debug!(query = %query.query, candidates = candidates.len(), "Discovery query returned");

            for candidate in candidates {
                if !seen.insert((candidate.kind, candidate.name.to_lowercase())) {
                    continue;
                }
                report.candidates += 1;

                let Some(entity) = self
                    .store
                    .insert_discovered(candidate.kind, &candidate.name, now)
                    .await?
                else {
                    continue;
                };
                report.discovered += 1;
                info!(entity_id = entity.id, kind = %entity.kind, name = %entity.name, "Discovered new entity");

                match pool.enqueue(RefreshTask::new(entity, self.lane.clone(), now)).await? {
                    EnqueueOutcome::Enqueued => report.enqueued += 1,
                    // Still has a null timestamp; the staleness tick will pick it up
                    EnqueueOutcome::QueueFull | EnqueueOutcome::AlreadyInFlight => {}
                }
            }
        }

        Ok(report)
    }
}
