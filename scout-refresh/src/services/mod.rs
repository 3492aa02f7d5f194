//! Refresh scheduler services

pub mod backoff;
pub mod discovery;
pub mod rate_limiter;
pub mod scheduler;
pub mod staleness_selector;
pub mod telemetry;
pub mod upsert_pipeline;
pub mod worker_pool;

pub use backoff::BackoffPolicy;
pub use discovery::{Candidate, DiscoveryLane, DiscoveryQuery, DiscoveryReport, DiscoverySource};
pub use rate_limiter::{BudgetConfig, BudgetLevel, RateLimitError, RateLimiter};
pub use scheduler::{Scheduler, SchedulerConfig, TickReport};
pub use staleness_selector::StalenessSelector;
pub use telemetry::{HealthCounters, Telemetry};
pub use upsert_pipeline::{UpsertPipeline, UpsertRetry};
pub use worker_pool::{EnqueueOutcome, LaneConfig, LaneStatus, PoolConfig, WorkerPool};
