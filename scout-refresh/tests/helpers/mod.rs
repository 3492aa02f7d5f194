//! Test Helper Utilities
//!
//! Shared harness for scout-refresh integration tests: an in-memory database,
//! a scripted provider and a fully wired scheduler.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_common::db::init_memory_database;
use scout_common::events::{EventBus, ScoutEvent};
use scout_common::time::now_millis;
use scout_refresh::db::{EntityStore, SqliteEntityStore, SqliteScoringQueue};
use scout_refresh::models::{EntityKind, EntityPayload, EntityRef, FetchResult};
use scout_refresh::providers::{ProviderAdapter, ProviderRegistry};
use scout_refresh::services::{
    BackoffPolicy, BudgetConfig, DiscoveryLane, LaneConfig, PoolConfig, RateLimiter, Scheduler,
    SchedulerConfig, StalenessSelector, Telemetry, UpsertPipeline, UpsertRetry, WorkerPool,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const PROVIDER: &str = "scripted";

/// Provider answering from a per-entity script
///
/// Entities without a script (or with an exhausted one) get the default
/// result. Overlapping fetches for the same entity are recorded.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<HashMap<i64, VecDeque<FetchResult>>>,
    default: FetchResult,
    delay: Duration,
    calls: Mutex<HashMap<i64, u32>>,
    running: Mutex<HashSet<i64>>,
    overlap: AtomicBool,
    total: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: Mutex::new(HashMap::new()),
            default: FetchResult::Success(EntityPayload::default()),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            total: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_default(mut self, result: FetchResult) -> Self {
        self.default = result;
        self
    }

    pub fn script(&self, entity_id: i64, results: Vec<FetchResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(entity_id, results.into_iter().collect());
    }

    pub fn calls_for(&self, entity_id: i64) -> u32 {
        self.calls.lock().unwrap().get(&entity_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    /// True if two fetches for one entity ever ran at the same time
    pub fn saw_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, entity: &EntityRef) -> FetchResult {
        self.total.fetch_add(1, Ordering::SeqCst);
        *self.calls.lock().unwrap().entry(entity.id).or_insert(0) += 1;
        if !self.running.lock().unwrap().insert(entity.id) {
            self.overlap.store(true, Ordering::SeqCst);
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&entity.id)
            .and_then(|script| script.pop_front())
            .unwrap_or_else(|| self.default.clone());

        self.running.lock().unwrap().remove(&entity.id);
        result
    }
}

/// Knobs for [`build_harness`]
pub struct HarnessOptions {
    pub capacity: u32,
    pub refill_rate: f64,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub retry_ceiling: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub threshold: Duration,
    pub batch_size: usize,
    pub tick_interval: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            refill_rate: 1_000.0,
            concurrency: 4,
            queue_capacity: 1_024,
            retry_ceiling: 5,
            backoff_base: Duration::from_millis(2),
            backoff_cap: Duration::from_millis(50),
            threshold: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
            tick_interval: Duration::from_secs(3600),
        }
    }
}

pub struct Harness {
    pub store: SqliteEntityStore,
    pub scoring: SqliteScoringQueue,
    pub provider: Arc<ScriptedProvider>,
    pub rate_limiter: Arc<RateLimiter>,
    pub telemetry: Telemetry,
    pub bus: EventBus,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<Scheduler>,
}

/// Build a scheduler with one lane backed by `provider`
///
/// `discovery` receives the store and limiter so the lane can be built
/// against the same database.
pub async fn build_harness(
    provider: ScriptedProvider,
    options: HarnessOptions,
    discovery: Option<
        Box<dyn FnOnce(Arc<dyn EntityStore>, Arc<RateLimiter>) -> DiscoveryLane + Send>,
    >,
) -> Harness {
    let db = init_memory_database().await.unwrap();
    let store = SqliteEntityStore::new(db.clone());
    let scoring = SqliteScoringQueue::new(db);
    let shared_store: Arc<dyn EntityStore> = Arc::new(store.clone());

    let provider = Arc::new(provider);
    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let mut budgets = HashMap::new();
    budgets.insert(
        provider.name().to_string(),
        BudgetConfig {
            capacity: options.capacity,
            refill_rate: options.refill_rate,
        },
    );
    let rate_limiter = Arc::new(RateLimiter::new(budgets, Duration::from_secs(5)));

    let bus = EventBus::new(4096);
    let telemetry = Telemetry::new(bus.clone());

    let upsert = Arc::new(UpsertPipeline::new(
        Arc::clone(&shared_store),
        Arc::new(scoring.clone()),
        UpsertRetry {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
    ));

    let pool = Arc::new(
        WorkerPool::new(
            PoolConfig {
                lanes: vec![LaneConfig {
                    name: provider.name().to_string(),
                    adapter: provider.name().to_string(),
                    concurrency: options.concurrency,
                    queue_capacity: options.queue_capacity,
                }],
                retry_ceiling: options.retry_ceiling,
                backoff: BackoffPolicy::new(options.backoff_base, options.backoff_cap),
                permanent_block: options.threshold,
            },
            Arc::clone(&rate_limiter),
            providers,
            upsert,
            telemetry.clone(),
        )
        .unwrap(),
    );

    let selector = StalenessSelector::new(
        Arc::clone(&shared_store),
        options.threshold,
        options.batch_size,
    );
    let discovery = discovery.map(|build| build(Arc::clone(&shared_store), Arc::clone(&rate_limiter)));

    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig {
            tick_interval: options.tick_interval,
            discovery_interval: Duration::from_secs(7 * 24 * 60 * 60),
            maintenance_interval: Duration::from_secs(3600),
            refresh_lanes: vec![provider.name().to_string()],
            shutdown_grace: Duration::from_secs(1),
        },
        shared_store,
        selector,
        Arc::clone(&pool),
        discovery,
        telemetry.clone(),
    ));

    Harness {
        store,
        scoring,
        provider,
        rate_limiter,
        telemetry,
        bus,
        pool,
        scheduler,
    }
}

impl Harness {
    pub async fn company(&self, name: &str) -> i64 {
        self.store
            .insert_entity(EntityKind::Company, name, now_millis())
            .await
            .unwrap()
    }

    pub async fn founder(&self, name: &str) -> i64 {
        self.store
            .insert_entity(EntityKind::Founder, name, now_millis())
            .await
            .unwrap()
    }

    /// Mark an entity refreshed at `at` without going through a provider
    pub async fn refreshed_at(&self, id: i64, at: DateTime<Utc>) {
        self.store
            .upsert_entity(id, &EntityPayload::default(), at)
            .await
            .unwrap();
    }
}

/// Receive events until `pick` returns a value, or panic after `within`
pub async fn wait_for<T>(
    rx: &mut broadcast::Receiver<ScoutEvent>,
    within: Duration,
    mut pick: impl FnMut(&ScoutEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

/// Collect `count` terminal outcomes
pub async fn terminal_outcomes(
    rx: &mut broadcast::Receiver<ScoutEvent>,
    count: usize,
    within: Duration,
) -> Vec<ScoutEvent> {
    let mut outcomes = Vec::with_capacity(count);
    while outcomes.len() < count {
        let event = wait_for(rx, within, |e| e.is_terminal_outcome().then(|| e.clone())).await;
        outcomes.push(event);
    }
    outcomes
}
