//! Observability sink: tracing, the event bus, and aggregate counters

use scout_common::events::{EventBus, ScoutEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct OutcomeCounters {
    succeeded: AtomicU64,
    abandoned: AtomicU64,
    failed_permanent: AtomicU64,
    worker_restarts: AtomicU64,
}

/// Aggregate health reported on the admin surface
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthCounters {
    pub succeeded: u64,
    pub abandoned: u64,
    pub failed_permanent: u64,
    pub worker_restarts: u64,
    /// abandoned / all terminal outcomes
    pub abandonment_rate: f64,
    /// failed_permanent / all terminal outcomes
    pub permanent_failure_rate: f64,
}

/// Every scheduler event goes through here exactly once
#[derive(Debug, Clone)]
pub struct Telemetry {
    bus: EventBus,
    counters: Arc<OutcomeCounters>,
}

impl Telemetry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            counters: Arc::new(OutcomeCounters::default()),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Count, log and broadcast one event
    pub fn emit(&self, event: ScoutEvent) {
        match &event {
            ScoutEvent::RefreshSucceeded {
                entity_id,
                provider,
                attempts,
                ..
            } => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(entity_id, provider = %provider, attempts, "Refresh succeeded");
            }
            ScoutEvent::RefreshAbandoned {
                entity_id,
                provider,
                attempts,
                reason,
                ..
            } => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                warn!(entity_id, provider = %provider, attempts, reason = %reason, "Refresh abandoned");
            }
            ScoutEvent::RefreshFailedPermanent {
                entity_id,
                provider,
                cause,
                blocked_until,
                ..
            } => {
                self.counters.failed_permanent.fetch_add(1, Ordering::Relaxed);
                warn!(
                    entity_id,
                    provider = %provider,
                    cause = %cause,
                    blocked_until = %blocked_until,
                    "Refresh failed permanently"
                );
            }
            ScoutEvent::RefreshRetryScheduled {
                entity_id,
                provider,
                attempt,
                delay_ms,
                cause,
                ..
            } => {
                debug!(
                    entity_id,
                    provider = %provider,
                    attempt,
                    delay_ms,
                    cause = %cause,
                    "Retry scheduled"
                );
            }
            ScoutEvent::WorkerRestarted {
                lane,
                worker,
                entity_id,
                ..
            } => {
                self.counters.worker_restarts.fetch_add(1, Ordering::Relaxed);
                warn!(lane = %lane, worker, entity_id, "Worker restarted after crash");
            }
            ScoutEvent::SchedulerStateChanged {
                old_state,
                new_state,
                ..
            } => {
                debug!(from = old_state.as_str(), to = new_state.as_str(), "Scheduler state changed");
            }
            ScoutEvent::TickCompleted {
                selected, enqueued, ..
            } => {
                info!(selected, enqueued, "Staleness tick completed");
            }
            ScoutEvent::DiscoveryCompleted {
                queries,
                candidates,
                discovered,
                ..
            } => {
                info!(queries, candidates, discovered, "Discovery run completed");
            }
            ScoutEvent::MaintenanceCompleted {
                expired_failures_removed,
                ..
            } => {
                info!(expired_failures_removed, "Maintenance sweep completed");
            }
        }

        self.bus.emit_lossy(event);
    }

    pub fn health(&self) -> HealthCounters {
        let succeeded = self.counters.succeeded.load(Ordering::Relaxed);
        let abandoned = self.counters.abandoned.load(Ordering::Relaxed);
        let failed_permanent = self.counters.failed_permanent.load(Ordering::Relaxed);
        let terminal = succeeded + abandoned + failed_permanent;

        let rate = |n: u64| {
            if terminal == 0 {
                0.0
            } else {
                n as f64 / terminal as f64
            }
        };

        HealthCounters {
            succeeded,
            abandoned,
            failed_permanent,
            worker_restarts: self.counters.worker_restarts.load(Ordering::Relaxed),
            abandonment_rate: rate(abandoned),
            permanent_failure_rate: rate(failed_permanent),
        }
    }
}
