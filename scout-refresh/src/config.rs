//! Configuration for scout-refresh
//!
//! Everything tunable lives in one bootstrap TOML file (`scout-refresh.toml`).
//! Missing tables and keys fall back to the compiled defaults below, so an
//! empty file is a valid configuration apart from the SerpApi key.

use crate::providers::nitter::NITTER_BASE_URL;
use crate::providers::serp::{AffiliationRule, SERPAPI_BASE_URL};
use crate::services::{
    BackoffPolicy, BudgetConfig, DiscoveryQuery, LaneConfig, PoolConfig, SchedulerConfig,
    UpsertRetry,
};
use scout_common::config::{env_non_empty, LoggingConfig};
use scout_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const MODULE_NAME: &str = "scout-refresh";

/// Environment variable holding the SerpApi key
pub const SERPAPI_KEY_ENV: &str = "SCOUT_SERPAPI_KEY";

pub const DEFAULT_PORT: u16 = 5790;

/// Root of `scout-refresh.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshToml {
    pub data_folder: Option<PathBuf>,
    pub port: u16,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerSection,
    pub retry: RetrySection,
    pub discovery: DiscoverySection,
    pub providers: Vec<ProviderSection>,
    pub serpapi: SerpApiSection,
    pub nitter: NitterSection,
    pub affiliation: AffiliationSection,
}

impl Default for RefreshToml {
    fn default() -> Self {
        Self {
            data_folder: None,
            port: DEFAULT_PORT,
            logging: LoggingConfig::default(),
            scheduler: SchedulerSection::default(),
            retry: RetrySection::default(),
            discovery: DiscoverySection::default(),
            providers: default_providers(),
            serpapi: SerpApiSection::default(),
            nitter: NitterSection::default(),
            affiliation: AffiliationSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval_secs: u64,
    /// An entity refreshed longer ago than this is stale
    pub staleness_threshold_secs: u64,
    /// Upper bound on entities selected per tick
    pub batch_size: usize,
    pub maintenance_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    /// Lanes every stale entity is queued on
    pub refresh_lanes: Vec<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            staleness_threshold_secs: 24 * 60 * 60,
            batch_size: 100,
            maintenance_interval_secs: 60 * 60,
            shutdown_grace_secs: 30,
            refresh_lanes: vec!["serp".to_string(), "nitter".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Retries per task before it is abandoned
    pub ceiling: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Jitter upper bound as a fraction of the base delay
    pub jitter_ratio: f64,
    /// Attempts per upsert transaction
    pub upsert_attempts: u32,
    pub upsert_base_ms: u64,
    /// Longest a worker waits for a provider token
    pub rate_limit_wait_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            ceiling: 5,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.5,
            upsert_attempts: 3,
            upsert_base_ms: 100,
            rate_limit_wait_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Lane newly discovered entities are queued on
    pub lane: String,
    /// Minimum spacing between two discovery queries; 0 disables pacing
    pub query_spacing_ms: u64,
    pub queries: Vec<DiscoveryQuery>,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let six_months = |query: &str| DiscoveryQuery {
            query: query.to_string(),
            time_filter: Some("m6".to_string()),
        };
        Self {
            enabled: true,
            interval_secs: 7 * 24 * 60 * 60,
            lane: "new".to_string(),
            query_spacing_ms: 2_000,
            queries: vec![
                six_months(r#""Duke University" AND "founder" AND startup"#),
                six_months(r#""Duke alumni" AND "series a""#),
                six_months(r#""Duke graduate" AND "CEO" AND funding"#),
                six_months(r#""Duke University" AND entrepreneur AND raised"#),
                six_months(r#"site:techcrunch.com "Duke" AND funding"#),
                six_months(r#"site:crunchbase.com "Duke University" AND founder"#),
            ],
        }
    }
}

/// One `[[providers]]` entry: a worker lane, and a rate budget when the lane
/// owns its adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSection {
    pub name: String,
    /// Adapter the lane fetches through; defaults to `name`
    #[serde(default)]
    pub adapter: Option<String>,
    /// Token bucket size; required when the lane owns its adapter
    #[serde(default)]
    pub capacity: Option<u32>,
    /// Tokens per second
    #[serde(default)]
    pub refill_per_sec: Option<f64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl ProviderSection {
    pub fn adapter(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.name)
    }

    /// True when this entry defines the adapter's rate budget
    pub fn owns_budget(&self) -> bool {
        self.adapter() == self.name
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_providers() -> Vec<ProviderSection> {
    vec![
        ProviderSection {
            name: "serp".to_string(),
            adapter: None,
            capacity: Some(10),
            refill_per_sec: Some(0.5),
            concurrency: 4,
            queue_capacity: default_queue_capacity(),
        },
        ProviderSection {
            name: "nitter".to_string(),
            adapter: None,
            capacity: Some(5),
            refill_per_sec: Some(0.2),
            concurrency: 2,
            queue_capacity: default_queue_capacity(),
        },
        ProviderSection {
            name: "new".to_string(),
            adapter: Some("serp".to_string()),
            capacity: None,
            refill_per_sec: None,
            concurrency: 2,
            queue_capacity: default_queue_capacity(),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerpApiSection {
    /// Overridden by `SCOUT_SERPAPI_KEY`
    pub api_key: Option<String>,
    pub base_url: String,
    pub results_per_query: u32,
    pub timeout_secs: u64,
}

impl Default for SerpApiSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: SERPAPI_BASE_URL.to_string(),
            results_per_query: 20,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NitterSection {
    pub base_url: String,
    /// Posts folded into `twitter_summary`
    pub max_posts: usize,
    pub timeout_secs: u64,
}

impl Default for NitterSection {
    fn default() -> Self {
        Self {
            base_url: NITTER_BASE_URL.to_string(),
            max_posts: 5,
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffiliationSection {
    pub institution: String,
    pub domains: Vec<String>,
}

impl Default for AffiliationSection {
    fn default() -> Self {
        Self {
            institution: "Duke University".to_string(),
            domains: vec!["duke.edu".to_string()],
        }
    }
}

impl AffiliationSection {
    pub fn rule(&self) -> AffiliationRule {
        AffiliationRule {
            institution: self.institution.clone(),
            domains: self.domains.clone(),
        }
    }
}

impl RefreshToml {
    /// Reject configurations the services cannot run with
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.tick_interval_secs == 0 {
            return Err(Error::Config("scheduler.tick_interval_secs must be positive".to_string()));
        }
        if scheduler.staleness_threshold_secs == 0 {
            return Err(Error::Config(
                "scheduler.staleness_threshold_secs must be positive".to_string(),
            ));
        }
        if scheduler.batch_size == 0 {
            return Err(Error::Config("scheduler.batch_size must be positive".to_string()));
        }
        if scheduler.maintenance_interval_secs == 0 {
            return Err(Error::Config(
                "scheduler.maintenance_interval_secs must be positive".to_string(),
            ));
        }
        if self.retry.backoff_base_ms == 0 || self.retry.backoff_cap_ms < self.retry.backoff_base_ms {
            return Err(Error::Config(
                "retry.backoff_base_ms must be positive and no larger than retry.backoff_cap_ms"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(Error::Config("retry.jitter_ratio must be within 0.0..=1.0".to_string()));
        }
        if self.retry.upsert_attempts == 0 {
            return Err(Error::Config("retry.upsert_attempts must be at least 1".to_string()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Config(format!("Provider '{}' is defined twice", provider.name)));
            }
            if provider.concurrency == 0 || provider.queue_capacity == 0 {
                return Err(Error::Config(format!(
                    "Provider '{}' needs a positive concurrency and queue_capacity",
                    provider.name
                )));
            }
            if provider.owns_budget() {
                match (provider.capacity, provider.refill_per_sec) {
                    (Some(capacity), Some(refill)) if capacity > 0 && refill > 0.0 => {}
                    _ => {
                        return Err(Error::Config(format!(
                            "Provider '{}' needs a positive capacity and refill_per_sec",
                            provider.name
                        )))
                    }
                }
            }
        }

        let budgets = self.budgets();
        for provider in &self.providers {
            if !budgets.contains_key(provider.adapter()) {
                return Err(Error::Config(format!(
                    "Lane '{}' uses adapter '{}' which has no [[providers]] entry",
                    provider.name,
                    provider.adapter()
                )));
            }
        }

        for lane in &scheduler.refresh_lanes {
            if !names.contains(lane.as_str()) {
                return Err(Error::Config(format!("Refresh lane '{}' is not a configured provider", lane)));
            }
        }

        if self.discovery.enabled {
            if !names.contains(self.discovery.lane.as_str()) {
                return Err(Error::Config(format!(
                    "Discovery lane '{}' is not a configured provider",
                    self.discovery.lane
                )));
            }
            if self.discovery.interval_secs == 0 {
                return Err(Error::Config("discovery.interval_secs must be positive".to_string()));
            }
        }

        Ok(())
    }

    /// Rate budget per adapter
    pub fn budgets(&self) -> HashMap<String, BudgetConfig> {
        self.providers
            .iter()
            .filter(|p| p.owns_budget())
            .filter_map(|p| {
                Some((
                    p.name.clone(),
                    BudgetConfig {
                        capacity: p.capacity?,
                        refill_rate: p.refill_per_sec?,
                    },
                ))
            })
            .collect()
    }

    pub fn lanes(&self) -> Vec<LaneConfig> {
        self.providers
            .iter()
            .map(|p| LaneConfig {
                name: p.name.clone(),
                adapter: p.adapter().to_string(),
                concurrency: p.concurrency,
                queue_capacity: p.queue_capacity,
            })
            .collect()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            jitter_ratio: self.retry.jitter_ratio,
            ..BackoffPolicy::new(
                Duration::from_millis(self.retry.backoff_base_ms),
                Duration::from_millis(self.retry.backoff_cap_ms),
            )
        }
    }

    /// Permanent failures keep an entity out of selection for one threshold
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            lanes: self.lanes(),
            retry_ceiling: self.retry.ceiling,
            backoff: self.backoff(),
            permanent_block: self.staleness_threshold(),
        }
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.scheduler.staleness_threshold_secs)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.retry.rate_limit_wait_secs)
    }

    pub fn query_spacing(&self) -> Duration {
        Duration::from_millis(self.discovery.query_spacing_ms)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_secs(self.scheduler.tick_interval_secs),
            discovery_interval: Duration::from_secs(self.discovery.interval_secs),
            maintenance_interval: Duration::from_secs(self.scheduler.maintenance_interval_secs),
            refresh_lanes: self.scheduler.refresh_lanes.clone(),
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
        }
    }

    pub fn upsert_retry(&self) -> UpsertRetry {
        UpsertRetry {
            max_attempts: self.retry.upsert_attempts,
            base_delay: Duration::from_millis(self.retry.upsert_base_ms),
        }
    }
}

/// Resolve the SerpApi key
///
/// **Priority:** ENV → TOML
pub fn resolve_serpapi_key(config: &RefreshToml) -> Result<String> {
    let env_key = env_non_empty(SERPAPI_KEY_ENV);
    let toml_key = config
        .serpapi
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());

    if env_key.is_some() && toml_key.is_some() {
        warn!("SerpApi key found in environment and TOML. Using environment (highest priority).");
    }

    if let Some(key) = env_key {
        info!("SerpApi key loaded from environment variable");
        return Ok(key.trim().to_string());
    }

    if let Some(key) = toml_key {
        info!("SerpApi key loaded from TOML config");
        return Ok(key.to_string());
    }

    Err(Error::Config(format!(
        "SerpApi key not configured. Please configure using one of:\n\
         1. Environment: {}=your-key-here\n\
         2. TOML config: [serpapi] api_key = \"your-key\" in {}.toml",
        SERPAPI_KEY_ENV, MODULE_NAME
    )))
}
