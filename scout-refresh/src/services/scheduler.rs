//! Process-wide cadence: staleness ticks, discovery runs, maintenance sweeps
//!
//! One loop owns the timers. Each tick moves `Idle → Selecting → Dispatching
//! → Idle`; an administrative stop parks the loop in `Stopped`, where timed
//! ticks are skipped but queued work keeps draining. Discovery runs in its
//! own task so a long paced run never holds up ticks.

use crate::db::{EntityStore, SchedulerRun};
use crate::error::RefreshError;
use crate::models::RefreshTask;
use crate::services::discovery::{DiscoveryLane, DiscoveryReport};
use crate::services::staleness_selector::StalenessSelector;
use crate::services::telemetry::Telemetry;
use crate::services::worker_pool::{EnqueueOutcome, WorkerPool};
use chrono::{DateTime, Utc};
use scout_common::events::{LoopState, ScoutEvent};
use scout_common::time::{now, now_millis, to_chrono};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RUN_KIND_TICK: &str = "tick";
pub const RUN_KIND_DISCOVERY: &str = "discovery";
pub const RUN_KIND_MAINTENANCE: &str = "maintenance";

/// How long tick and maintenance run records are kept; discovery runs stay
/// so the last discovery time survives restarts
const RUN_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const PRUNED_RUN_KINDS: [&str; 2] = [RUN_KIND_TICK, RUN_KIND_MAINTENANCE];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub discovery_interval: Duration,
    pub maintenance_interval: Duration,
    /// Lanes every stale entity is queued on
    pub refresh_lanes: Vec<String>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub selected: usize,
    pub enqueued: usize,
    pub queue_full: usize,
}

/// Turn a persisted last-run time into the instant the next run is due
///
/// Never ran, or ran longer than `interval` ago: due now.
fn next_due(last_run: Option<DateTime<Utc>>, interval: Duration) -> Instant {
    let now = Instant::now();
    match last_run {
        None => now,
        Some(ts) => {
            let elapsed = (Utc::now() - ts).to_std().unwrap_or(interval);
            match interval.checked_sub(elapsed) {
                Some(remaining) => now + remaining,
                None => now,
            }
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn EntityStore>,
    selector: StalenessSelector,
    pool: Arc<WorkerPool>,
    discovery: Option<DiscoveryLane>,
    telemetry: Telemetry,
    state: RwLock<LoopState>,
    running: AtomicBool,
    refresh_now: Notify,
    discover_now: Notify,
    /// Serializes ticks so manual and timed triggers never overlap
    cycle: Mutex<()>,
    last_error: RwLock<Option<String>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn EntityStore>,
        selector: StalenessSelector,
        pool: Arc<WorkerPool>,
        discovery: Option<DiscoveryLane>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            config,
            store,
            selector,
            pool,
            discovery,
            telemetry,
            state: RwLock::new(LoopState::Idle),
            running: AtomicBool::new(true),
            refresh_now: Notify::new(),
            discover_now: Notify::new(),
            cycle: Mutex::new(()),
            last_error: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub async fn state(&self) -> LoopState {
        *self.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn has_discovery(&self) -> bool {
        self.discovery.is_some()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Resume timed ticks; false if already running
    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Scheduler started");
        self.set_state(LoopState::Idle).await;
        true
    }

    /// Pause timed ticks; false if already stopped
    pub async fn stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!("Scheduler stopped");
        self.set_state(LoopState::Stopped).await;
        true
    }

    /// Ask the loop for an immediate staleness tick
    pub fn trigger_refresh(&self) {
        self.refresh_now.notify_one();
    }

    /// Ask the loop for an immediate discovery run
    pub fn trigger_discovery(&self) {
        self.discover_now.notify_one();
    }

    /// Main loop; returns after shutdown once the worker pool has drained
    pub async fn run(self: Arc<Self>) {
        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            lanes = ?self.config.refresh_lanes,
            "Scheduler loop started"
        );
        self.pool.start().await;

        let mut tick = time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut maintenance = time::interval_at(
            Instant::now() + self.config.maintenance_interval,
            self.config.maintenance_interval,
        );
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let last_discovery = match self.store.last_run_started(RUN_KIND_DISCOVERY).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(error = %e, "Could not load last discovery time");
                None
            }
        };
        let discovery_timer = time::sleep_until(next_due(last_discovery, self.config.discovery_interval));
        tokio::pin!(discovery_timer);
        let mut discovery_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if self.is_running() {
                        self.tick_logged().await;
                    }
                }
                _ = self.refresh_now.notified() => self.tick_logged().await,
                _ = &mut discovery_timer, if self.discovery.is_some() => {
                    if self.is_running() {
                        Arc::clone(&self).spawn_discovery(&mut discovery_task);
                    }
                    discovery_timer
                        .as_mut()
                        .reset(Instant::now() + self.config.discovery_interval);
                }
                _ = self.discover_now.notified() => {
                    Arc::clone(&self).spawn_discovery(&mut discovery_task);
                }
                _ = maintenance.tick() => self.maintenance_logged().await,
            }
        }

        info!("Scheduler loop stopping");
        if let Some(handle) = discovery_task.take() {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_state(LoopState::Stopped).await;
        self.pool.shutdown(self.config.shutdown_grace).await;
    }

    async fn tick_logged(&self) {
        if let Err(e) = self.run_tick().await {
            self.record_error("staleness tick", &e).await;
        }
    }

    /// Run discovery off the loop so ticks keep firing; one run at a time
    fn spawn_discovery(self: Arc<Self>, current: &mut Option<JoinHandle<()>>) {
        if current.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Discovery already running, trigger ignored");
            return;
        }
        *current = Some(tokio::spawn(async move { self.discovery_logged().await }));
    }

    async fn discovery_logged(&self) {
        let result = tokio::select! {
            res = self.run_discovery() => res,
            _ = self.shutdown.cancelled() => return,
        };
        if let Err(e) = result {
            self.record_error("discovery run", &e).await;
        }
    }

    async fn maintenance_logged(&self) {
        if let Err(e) = self.run_maintenance().await {
            self.record_error("maintenance sweep", &e).await;
        }
    }

    async fn record_error(&self, what: &str, err: &RefreshError) {
        error!(error = %err, "{} failed", what);
        *self.last_error.write().await = Some(format!("{} failed: {}", what, err));
    }

    /// One staleness tick stamped with the current time
    pub async fn run_tick(&self) -> Result<TickReport, RefreshError> {
        self.run_tick_at(now_millis()).await
    }

    /// One staleness tick stamped `tick_at`
    ///
    /// `tick_at` becomes every queued task's `enqueued_at`, and so the
    /// `last_refreshed_at` written on success.
    pub async fn run_tick_at(&self, tick_at: DateTime<Utc>) -> Result<TickReport, RefreshError> {
        let _cycle = self.cycle.lock().await;
        let result = self.select_and_dispatch(tick_at).await;
        let settled = if self.is_running() {
            LoopState::Idle
        } else {
            LoopState::Stopped
        };
        self.set_state(settled).await;
        let report = result?;

        self.telemetry.emit(ScoutEvent::TickCompleted {
            selected: report.selected,
            enqueued: report.enqueued,
            timestamp: now(),
        });
        self.store
            .record_run(&SchedulerRun {
                kind: RUN_KIND_TICK.to_string(),
                started_at: tick_at,
                finished_at: now_millis(),
                selected: report.selected,
                enqueued: report.enqueued,
            })
            .await?;

        Ok(report)
    }

    async fn select_and_dispatch(&self, tick_at: DateTime<Utc>) -> Result<TickReport, RefreshError> {
        self.set_state(LoopState::Selecting).await;
        let in_flight = self.pool.active_entity_ids().await;
        let selected = self.selector.select(tick_at, &in_flight).await?;

        self.set_state(LoopState::Dispatching).await;
        let mut report = TickReport {
            selected: selected.len(),
            ..Default::default()
        };

        for entity in selected {
            for lane in &self.config.refresh_lanes {
                let task = RefreshTask::new(entity.clone(), lane.clone(), tick_at);
                match self.pool.enqueue(task).await? {
                    EnqueueOutcome::Enqueued => report.enqueued += 1,
                    EnqueueOutcome::AlreadyInFlight => {}
                    EnqueueOutcome::QueueFull => report.queue_full += 1,
                }
            }
        }

        if report.queue_full > 0 {
            warn!(
                queue_full = report.queue_full,
                "Lane queues full; remaining entities wait for the next tick"
            );
        }

        Ok(report)
    }

    /// One discovery run; `None` when no discovery lane is configured
    pub async fn run_discovery(&self) -> Result<Option<DiscoveryReport>, RefreshError> {
        let Some(discovery) = &self.discovery else {
            return Ok(None);
        };

        let started_at = now_millis();
        let report = discovery.run(&self.pool, started_at).await?;

        self.telemetry.emit(ScoutEvent::DiscoveryCompleted {
            queries: report.queries,
            candidates: report.candidates,
            discovered: report.discovered,
            timestamp: now(),
        });
        self.store
            .record_run(&SchedulerRun {
                kind: RUN_KIND_DISCOVERY.to_string(),
                started_at,
                finished_at: now_millis(),
                selected: report.discovered,
                enqueued: report.enqueued,
            })
            .await?;

        Ok(Some(report))
    }

    /// Expire permanent-failure records and prune old run history
    pub async fn run_maintenance(&self) -> Result<u64, RefreshError> {
        let started_at = now_millis();
        let removed = self.store.clear_expired_failures(started_at).await?;
        let cutoff = started_at - to_chrono(RUN_RETENTION);
        for kind in PRUNED_RUN_KINDS {
            let pruned = self.store.prune_runs(kind, cutoff).await?;
            if pruned > 0 {
                info!(pruned, kind, "Pruned old run records");
            }
        }

        self.telemetry.emit(ScoutEvent::MaintenanceCompleted {
            expired_failures_removed: removed,
            timestamp: now(),
        });
        self.store
            .record_run(&SchedulerRun {
                kind: RUN_KIND_MAINTENANCE.to_string(),
                started_at,
                finished_at: now_millis(),
                selected: 0,
                enqueued: 0,
            })
            .await?;

        Ok(removed)
    }

    async fn set_state(&self, new_state: LoopState) {
        let old_state = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, new_state)
        };
        if old_state != new_state {
            self.telemetry.emit(ScoutEvent::SchedulerStateChanged {
                old_state,
                new_state,
                timestamp: now(),
            });
        }
    }
}
