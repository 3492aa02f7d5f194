//! scout-refresh - Profile Refresh Scheduler
//!
//! **Module Identity:**
//! - Name: scout-refresh
//! - Default port: 5790
//!
//! Keeps company and founder profiles fresh by re-fetching stale entities from
//! SerpApi and Nitter under per-provider rate budgets, and discovers new
//! entities with periodic broad searches.

use anyhow::{Context, Result};
use clap::Parser;
use scout_common::config::{
    config_file_path, database_path, load_toml_or_default, resolve_data_folder, write_toml,
};
use scout_common::events::EventBus;
use scout_refresh::config::{resolve_serpapi_key, RefreshToml, MODULE_NAME};
use scout_refresh::db::{EntityStore, ScoringSink, SqliteEntityStore, SqliteScoringQueue};
use scout_refresh::providers::{
    http_client, NitterProvider, ProviderRegistry, SerpApiClient, SerpDiscoverySource, SerpProvider,
};
use scout_refresh::services::{
    DiscoveryLane, RateLimiter, Scheduler, StalenessSelector, Telemetry, UpsertPipeline, WorkerPool,
};
use scout_refresh::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Event bus capacity; slow SSE clients skip events beyond this
const EVENT_BUS_CAPACITY: usize = 1000;

#[derive(Parser, Debug)]
#[command(name = "scout-refresh", version, about = "Profile refresh scheduler")]
struct Args {
    /// HTTP port for the admin API
    #[arg(short, long, env = "SCOUT_REFRESH_PORT")]
    port: Option<u16>,

    /// Folder holding scout.db
    #[arg(short, long, env = "SCOUT_DATA_FOLDER")]
    data_folder: Option<PathBuf>,

    /// Path of scout-refresh.toml
    #[arg(short, long, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Write the compiled default configuration to this path and exit
    #[arg(long)]
    write_default_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.write_default_config {
        write_toml(&RefreshToml::default(), path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let config_path = args.config.clone().or_else(|| config_file_path(MODULE_NAME));
    let config: RefreshToml = load_toml_or_default(config_path.as_deref())?;

    init_tracing(&config)?;

    info!("Starting {} (Profile Refresh Scheduler)", MODULE_NAME);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Config: {}", path.display()),
        None => warn!("No config file found, using compiled defaults"),
    }

    config.validate()?;

    // Step 1: Database
    let data_folder = resolve_data_folder(args.data_folder.as_deref(), config.data_folder.as_deref());
    let db_path = database_path(&data_folder);
    info!("Database: {}", db_path.display());
    let db = scout_common::db::init_database(&db_path).await?;
    info!("Database connection established");

    // Step 2: Providers
    let serpapi_key = resolve_serpapi_key(&config)?;
    let serp_http = http_client(Duration::from_secs(config.serpapi.timeout_secs))
        .context("Failed to build SerpApi HTTP client")?;
    let nitter_http = http_client(Duration::from_secs(config.nitter.timeout_secs))
        .context("Failed to build Nitter HTTP client")?;

    let serp_client = Arc::new(
        SerpApiClient::new(serp_http, &config.serpapi.base_url, serpapi_key)
            .with_results_per_query(config.serpapi.results_per_query),
    );

    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(SerpProvider::new(
        Arc::clone(&serp_client),
        config.affiliation.rule(),
    )));
    providers.register(Arc::new(NitterProvider::new(
        nitter_http,
        &config.nitter.base_url,
        config.nitter.max_posts,
    )));
    info!("Providers registered: {}", providers.names().join(", "));

    // Step 3: Services
    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);
    let telemetry = Telemetry::new(event_bus);

    let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.clone()));
    let scoring: Arc<dyn ScoringSink> = Arc::new(SqliteScoringQueue::new(db.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(config.budgets(), config.rate_limit_wait()));
    let upsert = Arc::new(UpsertPipeline::new(
        Arc::clone(&store),
        scoring,
        config.upsert_retry(),
    ));

    let pool = Arc::new(WorkerPool::new(
        config.pool_config(),
        Arc::clone(&rate_limiter),
        providers,
        upsert,
        telemetry.clone(),
    )?);

    let selector = StalenessSelector::new(
        Arc::clone(&store),
        config.staleness_threshold(),
        config.scheduler.batch_size,
    );

    let discovery = if config.discovery.enabled {
        info!(
            queries = config.discovery.queries.len(),
            lane = %config.discovery.lane,
            "Discovery enabled"
        );
        Some(DiscoveryLane::new(
            Arc::new(SerpDiscoverySource::new(Arc::clone(&serp_client))),
            Arc::clone(&store),
            Arc::clone(&rate_limiter),
            config.discovery.queries.clone(),
            config.discovery.lane.clone(),
            config.query_spacing(),
        ))
    } else {
        info!("Discovery disabled");
        None
    };

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler_config(),
        store,
        selector,
        pool,
        discovery,
        telemetry.clone(),
    ));
    let shutdown = scheduler.shutdown_token();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run());

    // Step 4: Admin API
    let state = AppState::new(Arc::clone(&scheduler), rate_limiter, telemetry);
    let app = scout_refresh::build_router(state);

    let port = args.port.unwrap_or(config.port);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    info!("Listening on http://127.0.0.1:{}", port);
    info!("Health check: http://127.0.0.1:{}/health", port);

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!("HTTP server exited with error: {}", e);
    }

    // Step 5: Drain workers, then close the database
    info!("Shutting down scheduler");
    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    db.close().await;
    info!("{} stopped", MODULE_NAME);

    Ok(())
}

/// RUST_LOG wins over the TOML `logging.level`
fn init_tracing(config: &RefreshToml) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("Invalid logging.level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}
