//! Per-provider worker lanes
//!
//! Every lane has a bounded queue and a fixed number of workers. A worker
//! pops a task, takes a token from the lane's provider budget, calls the
//! adapter and routes the [`FetchResult`]. Each worker runs under a
//! supervisor that restarts it after a panic and puts the task it was
//! holding back on the queue.
//!
//! The active set holds every (entity, lane) pair that is queued, being
//! processed or waiting out a retry delay. A pair leaves the set only when
//! the task reaches a terminal outcome.

use crate::error::RefreshError;
use crate::models::{FetchResult, RefreshTask, TaskKey};
use crate::providers::ProviderRegistry;
use crate::services::backoff::BackoffPolicy;
use crate::services::rate_limiter::{RateLimitError, RateLimiter};
use crate::services::telemetry::Telemetry;
use crate::services::upsert_pipeline::UpsertPipeline;
use chrono::{DateTime, Utc};
use scout_common::events::ScoutEvent;
use scout_common::time::{now, now_millis, to_chrono};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One provider lane
#[derive(Debug, Clone, PartialEq)]
pub struct LaneConfig {
    pub name: String,
    /// Adapter (and rate-limit budget) the lane fetches through
    pub adapter: String,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub lanes: Vec<LaneConfig>,
    pub retry_ceiling: u32,
    pub backoff: BackoffPolicy,
    /// How long a permanent failure keeps an entity out of selection
    pub permanent_block: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The same (entity, lane) pair is already queued or running
    AlreadyInFlight,
    /// Lane queue is at capacity; the entity stays eligible next tick
    QueueFull,
}

/// Per-lane figures for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct LaneStatus {
    pub lane: String,
    pub adapter: String,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub retrying: usize,
    pub in_progress: usize,
}

/// How one attempt ended, before retry policy is applied
enum Outcome {
    Succeeded { refreshed_at: DateTime<Utc> },
    FailedPermanent { cause: String, blocked_until: DateTime<Utc> },
    Retryable { cause: String, floor: Option<Duration> },
    Abandoned { reason: String },
}

struct Lane {
    config: LaneConfig,
    tx: mpsc::Sender<RefreshTask>,
    rx: Mutex<mpsc::Receiver<RefreshTask>>,
    queued: AtomicUsize,
    retrying: AtomicUsize,
    /// Task each worker currently holds, read back after a crash
    slots: Vec<Arc<Mutex<Option<RefreshTask>>>>,
}

impl Lane {
    fn new(config: LaneConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let slots = (0..config.concurrency)
            .map(|_| Arc::new(Mutex::new(None)))
            .collect();
        Self {
            config,
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            retrying: AtomicUsize::new(0),
            slots,
        }
    }
}

struct PoolShared {
    lanes: HashMap<String, Arc<Lane>>,
    active: Mutex<HashSet<TaskKey>>,
    rate_limiter: Arc<RateLimiter>,
    providers: ProviderRegistry,
    upsert: Arc<UpsertPipeline>,
    telemetry: Telemetry,
    retry_ceiling: u32,
    backoff: BackoffPolicy,
    permanent_block: Duration,
    /// Workers stop taking new tasks
    shutdown: CancellationToken,
    /// Grace period over; running tasks are dropped
    hard_stop: CancellationToken,
}

/// Bounded-concurrency executors, one lane per provider
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        rate_limiter: Arc<RateLimiter>,
        providers: ProviderRegistry,
        upsert: Arc<UpsertPipeline>,
        telemetry: Telemetry,
    ) -> Result<Self, RefreshError> {
        let mut lanes = HashMap::new();
        for lane in config.lanes {
            if providers.get(&lane.adapter).is_none() {
                return Err(RefreshError::UnknownLane(format!(
                    "lane '{}' uses adapter '{}' which is not registered",
                    lane.name, lane.adapter
                )));
            }
            if !rate_limiter.has_provider(&lane.adapter) {
                return Err(RefreshError::UnknownLane(format!(
                    "lane '{}' uses adapter '{}' which has no rate budget",
                    lane.name, lane.adapter
                )));
            }
            lanes.insert(lane.name.clone(), Arc::new(Lane::new(lane)));
        }

        Ok(Self {
            shared: Arc::new(PoolShared {
                lanes,
                active: Mutex::new(HashSet::new()),
                rate_limiter,
                providers,
                upsert,
                telemetry,
                retry_ceiling: config.retry_ceiling,
                backoff: config.backoff,
                permanent_block: config.permanent_block,
                shutdown: CancellationToken::new(),
                hard_stop: CancellationToken::new(),
            }),
            supervisors: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn every lane's workers; later calls are no-ops
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut supervisors = self.supervisors.lock().await;
        for lane in self.shared.lanes.values() {
            info!(
                lane = %lane.config.name,
                adapter = %lane.config.adapter,
                concurrency = lane.config.concurrency,
                "Starting lane workers"
            );
            for worker in 0..lane.config.concurrency {
                supervisors.push(tokio::spawn(supervise(
                    Arc::clone(&self.shared),
                    Arc::clone(lane),
                    worker,
                )));
            }
        }
    }

    /// Queue `task` on its lane
    ///
    /// Never blocks: a full lane reports `QueueFull` and the entity is picked
    /// up again by a later tick.
    pub async fn enqueue(&self, task: RefreshTask) -> Result<EnqueueOutcome, RefreshError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RefreshError::ShuttingDown);
        }
        let lane = self
            .shared
            .lanes
            .get(&task.provider)
            .ok_or_else(|| RefreshError::UnknownLane(task.provider.clone()))?;

        let key = task.key();
        if !self.shared.active.lock().await.insert(key.clone()) {
            return Ok(EnqueueOutcome::AlreadyInFlight);
        }

        lane.queued.fetch_add(1, Ordering::SeqCst);
        match lane.tx.try_send(task) {
            Ok(()) => Ok(EnqueueOutcome::Enqueued),
            Err(err) => {
                lane.queued.fetch_sub(1, Ordering::SeqCst);
                self.shared.active.lock().await.remove(&key);
                match err {
                    mpsc::error::TrySendError::Full(_) => Ok(EnqueueOutcome::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(RefreshError::ShuttingDown),
                }
            }
        }
    }

    /// Entity ids with a task anywhere in the pool
    pub async fn active_entity_ids(&self) -> HashSet<i64> {
        self.shared.active.lock().await.iter().map(|(id, _)| *id).collect()
    }

    pub async fn is_in_flight(&self, entity_id: i64, lane: &str) -> bool {
        self.shared
            .active
            .lock()
            .await
            .contains(&(entity_id, lane.to_string()))
    }

    pub async fn active_count(&self) -> usize {
        self.shared.active.lock().await.len()
    }

    /// Wait until no task is queued, running or waiting to retry
    pub async fn wait_idle(&self) {
        while self.active_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn lane_status(&self) -> Vec<LaneStatus> {
        let mut statuses = Vec::with_capacity(self.shared.lanes.len());
        for lane in self.shared.lanes.values() {
            let mut in_progress = 0;
            for slot in &lane.slots {
                if slot.lock().await.is_some() {
                    in_progress += 1;
                }
            }
            statuses.push(LaneStatus {
                lane: lane.config.name.clone(),
                adapter: lane.config.adapter.clone(),
                concurrency: lane.config.concurrency,
                queue_capacity: lane.config.queue_capacity,
                queued: lane.queued.load(Ordering::SeqCst),
                retrying: lane.retrying.load(Ordering::SeqCst),
                in_progress,
            });
        }
        statuses.sort_by(|a, b| a.lane.cmp(&b.lane));
        statuses
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Stop taking work, let running tasks finish for up to `grace`, then
    /// drop whatever is left
    ///
    /// Tasks dropped here are abandoned, not marked failed; their entities
    /// stay eligible for the next cycle.
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_ms = grace.as_millis() as u64, "Worker pool shutting down");
        self.shared.shutdown.cancel();

        let handles = std::mem::take(&mut *self.supervisors.lock().await);
        let all = futures::future::join_all(handles);
        tokio::pin!(all);

        if tokio::time::timeout(grace, &mut all).await.is_err() {
            warn!("Shutdown grace period elapsed, stopping running tasks");
            self.shared.hard_stop.cancel();
            all.await;
        }

        for lane in self.shared.lanes.values() {
            let mut rx = lane.rx.lock().await;
            while let Ok(task) = rx.try_recv() {
                lane.queued.fetch_sub(1, Ordering::SeqCst);
                self.shared.abandon(&task, "shutdown before start".to_string()).await;
            }
        }

        info!("Worker pool stopped");
    }
}

/// Keep one worker slot alive, restarting the worker after a panic
async fn supervise(shared: Arc<PoolShared>, lane: Arc<Lane>, worker: usize) {
    let slot = Arc::clone(&lane.slots[worker]);

    loop {
        let mut handle = tokio::spawn(worker_loop(
            Arc::clone(&shared),
            Arc::clone(&lane),
            Arc::clone(&slot),
        ));

        let joined = tokio::select! {
            res = &mut handle => Some(res),
            _ = shared.hard_stop.cancelled() => {
                handle.abort();
                let _ = handle.await;
                None
            }
        };

        match joined {
            Some(Ok(())) => break,
            Some(Err(err)) if err.is_panic() => {
                let held = slot.lock().await.take();
                error!(lane = %lane.config.name, worker, "Worker panicked, restarting");
                if let Some(mut task) = held {
                    task.crash_count += 1;
                    shared.telemetry.emit(ScoutEvent::WorkerRestarted {
                        lane: lane.config.name.clone(),
                        worker,
                        entity_id: task.entity_id(),
                        timestamp: now(),
                    });
                    if task.crash_count > shared.retry_ceiling {
                        let reason = format!("worker crashed {} times on this task", task.crash_count);
                        shared.abandon(&task, reason).await;
                    } else {
                        // Requeue off the supervisor; only a live worker frees queue space
                        shared.schedule_retry(&lane, task, Duration::ZERO);
                    }
                }
                if shared.shutdown.is_cancelled() {
                    break;
                }
            }
            Some(Err(_)) => break,
            None => {
                if let Some(task) = slot.lock().await.take() {
                    shared
                        .abandon(&task, "shutdown deadline exceeded".to_string())
                        .await;
                }
                break;
            }
        }
    }

    debug!(lane = %lane.config.name, worker, "Worker supervisor exited");
}

async fn worker_loop(shared: Arc<PoolShared>, lane: Arc<Lane>, slot: Arc<Mutex<Option<RefreshTask>>>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => None,
            task = async { lane.rx.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            break;
        };
        lane.queued.fetch_sub(1, Ordering::SeqCst);

        *slot.lock().await = Some(task.clone());
        let outcome = shared.process(&lane, &task).await;
        *slot.lock().await = None;

        shared.settle(&lane, task, outcome).await;
    }
}

impl PoolShared {
    /// One attempt: token, fetch, classify
    async fn process(&self, lane: &Lane, task: &RefreshTask) -> Outcome {
        let adapter_name = lane.config.adapter.as_str();
        let Some(adapter) = self.providers.get(adapter_name) else {
            return Outcome::Abandoned {
                reason: format!("no adapter registered for '{}'", adapter_name),
            };
        };

        match self.rate_limiter.acquire(adapter_name).await {
            Ok(()) => {}
            Err(RateLimitError::RateLimited { retry_after }) => {
                return Outcome::Retryable {
                    cause: "local rate budget exhausted".to_string(),
                    floor: Some(retry_after),
                };
            }
            Err(err) => {
                return Outcome::Abandoned {
                    reason: err.to_string(),
                }
            }
        }

        let result = adapter.fetch(&task.entity).await;
        debug!(
            task_id = %task.task_id,
            entity_id = task.entity_id(),
            provider = %task.provider,
            attempt = task.attempt_count,
            result = result.label(),
            "Provider fetch finished"
        );

        match result {
            FetchResult::Success(payload) => match self.upsert.apply(task, &payload).await {
                Ok(refreshed_at) => Outcome::Succeeded { refreshed_at },
                Err(e) => Outcome::Abandoned {
                    reason: format!("upsert failed: {}", e),
                },
            },
            FetchResult::RateLimited { retry_after } => {
                self.rate_limiter
                    .release_on_failure(adapter_name, retry_after)
                    .await;
                Outcome::Retryable {
                    cause: "provider rate limited".to_string(),
                    floor: Some(retry_after),
                }
            }
            FetchResult::TransientError { cause } => Outcome::Retryable { cause, floor: None },
            FetchResult::PermanentError { cause } => {
                let blocked_until = now_millis() + to_chrono(self.permanent_block);
                match self.upsert.mark_failed_permanent(task, &cause, blocked_until).await {
                    Ok(()) => Outcome::FailedPermanent {
                        cause,
                        blocked_until,
                    },
                    Err(e) => Outcome::Abandoned {
                        reason: format!("could not record permanent failure ({}): {}", cause, e),
                    },
                }
            }
        }
    }

    /// Apply retry policy and emit the terminal event, if any
    async fn settle(self: &Arc<Self>, lane: &Arc<Lane>, mut task: RefreshTask, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded { refreshed_at } => {
                self.telemetry.emit(ScoutEvent::RefreshSucceeded {
                    entity_id: task.entity_id(),
                    provider: task.provider.clone(),
                    attempts: task.attempt_count,
                    refreshed_at,
                    timestamp: now(),
                });
                self.release(&task).await;
            }
            Outcome::FailedPermanent {
                cause,
                blocked_until,
            } => {
                self.telemetry.emit(ScoutEvent::RefreshFailedPermanent {
                    entity_id: task.entity_id(),
                    provider: task.provider.clone(),
                    cause,
                    blocked_until,
                    timestamp: now(),
                });
                self.release(&task).await;
            }
            Outcome::Abandoned { reason } => self.abandon(&task, reason).await,
            Outcome::Retryable { cause, floor } => {
                if task.attempt_count >= self.retry_ceiling {
                    let reason = format!("retry ceiling reached: {}", cause);
                    self.abandon(&task, reason).await;
                    return;
                }

                let delay = self.backoff.delay(task.attempt_count, task.last_backoff, floor);
                task.attempt_count += 1;
                task.last_backoff = Some(delay);

                self.telemetry.emit(ScoutEvent::RefreshRetryScheduled {
                    entity_id: task.entity_id(),
                    provider: task.provider.clone(),
                    attempt: task.attempt_count,
                    delay_ms: delay.as_millis() as u64,
                    cause,
                    timestamp: now(),
                });
                self.schedule_retry(lane, task, delay);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, lane: &Arc<Lane>, task: RefreshTask, delay: Duration) {
        lane.retrying.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(self);
        let lane = Arc::clone(lane);

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    shared.requeue(&lane, task).await;
                    lane.retrying.fetch_sub(1, Ordering::SeqCst);
                }
                _ = shared.shutdown.cancelled() => {
                    lane.retrying.fetch_sub(1, Ordering::SeqCst);
                    shared.abandon(&task, "shutdown during retry delay".to_string()).await;
                }
            }
        });
    }

    /// Put a task that is still in the active set back on its lane
    async fn requeue(&self, lane: &Lane, task: RefreshTask) {
        tokio::select! {
            permit = lane.tx.reserve() => match permit {
                Ok(permit) => {
                    lane.queued.fetch_add(1, Ordering::SeqCst);
                    permit.send(task);
                }
                Err(_) => self.abandon(&task, "lane closed".to_string()).await,
            },
            _ = self.shutdown.cancelled() => {
                self.abandon(&task, "shutdown before requeue".to_string()).await;
            }
        }
    }

    async fn abandon(&self, task: &RefreshTask, reason: String) {
        self.telemetry.emit(ScoutEvent::RefreshAbandoned {
            entity_id: task.entity_id(),
            provider: task.provider.clone(),
            attempts: task.attempt_count,
            reason,
            timestamp: now(),
        });
        self.release(task).await;
    }

    async fn release(&self, task: &RefreshTask) {
        self.active.lock().await.remove(&task.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{SqliteEntityStore, SqliteScoringQueue};
    use crate::models::{EntityKind, EntityPayload, EntityRef};
    use crate::providers::ProviderAdapter;
    use crate::services::rate_limiter::BudgetConfig;
    use crate::services::upsert_pipeline::UpsertRetry;
    use async_trait::async_trait;
    use scout_common::db::init_memory_database;
    use scout_common::events::EventBus;
    use std::sync::atomic::AtomicU32;

    /// Fails transiently `failures` times, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, _entity: &EntityRef) -> FetchResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                FetchResult::transient("connection reset")
            } else {
                FetchResult::Success(EntityPayload {
                    summary: Some("ok".into()),
                    ..Default::default()
                })
            }
        }
    }

    /// Panics on the first call, after `delay`
    struct Panicky {
        calls: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl ProviderAdapter for Panicky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, _entity: &EntityRef) -> FetchResult {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(self.delay).await;
                panic!("adapter bug");
            }
            FetchResult::Success(EntityPayload::default())
        }
    }

    async fn pool_with(
        adapter: Arc<dyn ProviderAdapter>,
        retry_ceiling: u32,
    ) -> (SqliteEntityStore, WorkerPool, EventBus) {
        pool_with_lane(adapter, retry_ceiling, 2, 8).await
    }

    async fn pool_with_lane(
        adapter: Arc<dyn ProviderAdapter>,
        retry_ceiling: u32,
        concurrency: usize,
        queue_capacity: usize,
    ) -> (SqliteEntityStore, WorkerPool, EventBus) {
        let db = init_memory_database().await.unwrap();
        let store = SqliteEntityStore::new(db.clone());
        let upsert = Arc::new(UpsertPipeline::new(
            Arc::new(store.clone()),
            Arc::new(SqliteScoringQueue::new(db)),
            UpsertRetry {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        ));
        let mut budgets = HashMap::new();
        budgets.insert(
            "flaky".to_string(),
            BudgetConfig {
                capacity: 100,
                refill_rate: 100.0,
            },
        );
        let limiter = Arc::new(RateLimiter::new(budgets, Duration::from_secs(5)));
        let mut providers = ProviderRegistry::new();
        providers.register(adapter);
        let bus = EventBus::new(256);

        let pool = WorkerPool::new(
            PoolConfig {
                lanes: vec![LaneConfig {
                    name: "flaky".to_string(),
                    adapter: "flaky".to_string(),
                    concurrency,
                    queue_capacity,
                }],
                retry_ceiling,
                backoff: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(10)),
                permanent_block: Duration::from_secs(3600),
            },
            limiter,
            providers,
            upsert,
            Telemetry::new(bus.clone()),
        )
        .unwrap();

        (store, pool, bus)
    }

    async fn seeded_task(store: &SqliteEntityStore, name: &str) -> RefreshTask {
        let now = now_millis();
        let id = store.insert_entity(EntityKind::Company, name, now).await.unwrap();
        RefreshTask::new(
            EntityRef {
                id,
                kind: EntityKind::Company,
                name: name.to_string(),
                last_refreshed_at: None,
                twitter_handle: None,
            },
            "flaky",
            now,
        )
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_rejected() {
        let adapter = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let (store, pool, _bus) = pool_with(adapter, 3).await;
        let task = seeded_task(&store, "Acme").await;

        assert_eq!(pool.enqueue(task.clone()).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(pool.enqueue(task).await.unwrap(), EnqueueOutcome::AlreadyInFlight);
    }

    #[tokio::test]
    async fn test_unknown_lane_is_an_error() {
        let adapter = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let (store, pool, _bus) = pool_with(adapter, 3).await;
        let mut task = seeded_task(&store, "Acme").await;
        task.provider = "missing".to_string();

        assert!(matches!(
            pool.enqueue(task).await,
            Err(RefreshError::UnknownLane(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_ceiling_abandons_task() {
        let adapter = Arc::new(Flaky {
            failures: 100,
            calls: AtomicU32::new(0),
        });
        let (store, pool, bus) = pool_with(adapter.clone(), 2).await;
        let mut rx = bus.subscribe();
        pool.start().await;

        let task = seeded_task(&store, "Acme").await;
        pool.enqueue(task).await.unwrap();

        let abandoned = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ScoutEvent::RefreshAbandoned { attempts, .. } = event {
                break attempts;
            }
        };

        assert_eq!(abandoned, 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
        pool.wait_idle().await;
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_worker_is_restarted_and_task_requeued() {
        let adapter = Arc::new(Panicky {
            calls: AtomicU32::new(0),
            delay: Duration::ZERO,
        });
        let (store, pool, bus) = pool_with(adapter.clone(), 3).await;
        let mut rx = bus.subscribe();
        pool.start().await;

        let task = seeded_task(&store, "Acme").await;
        let entity_id = task.entity_id();
        pool.enqueue(task).await.unwrap();

        let mut restarted = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                ScoutEvent::WorkerRestarted { .. } => restarted = true,
                ScoutEvent::RefreshSucceeded { entity_id: id, .. } => {
                    assert_eq!(id, entity_id);
                    break;
                }
                _ => {}
            }
        }

        assert!(restarted);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_crash_with_full_queue_does_not_stall_the_lane() {
        let adapter = Arc::new(Panicky {
            calls: AtomicU32::new(0),
            delay: Duration::from_millis(200),
        });
        let (store, pool, bus) = pool_with_lane(adapter.clone(), 3, 1, 1).await;
        let mut rx = bus.subscribe();
        pool.start().await;

        let crashing = seeded_task(&store, "Crashes First").await;
        pool.enqueue(crashing).await.unwrap();
        while adapter.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Fills the only queue slot while the single worker is busy
        let waiting = seeded_task(&store, "Waits Behind").await;
        assert_eq!(pool.enqueue(waiting).await.unwrap(), EnqueueOutcome::Enqueued);

        let mut succeeded = HashSet::new();
        while succeeded.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let ScoutEvent::RefreshSucceeded { entity_id, .. } = event {
                succeeded.insert(entity_id);
            }
        }

        pool.wait_idle().await;
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.active_count().await, 0);
        pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let adapter = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let (store, pool, _bus) = pool_with(adapter, 3).await;
        pool.start().await;
        pool.shutdown(Duration::from_millis(100)).await;

        let task = seeded_task(&store, "Late").await;
        assert!(matches!(
            pool.enqueue(task).await,
            Err(RefreshError::ShuttingDown)
        ));
    }
}
