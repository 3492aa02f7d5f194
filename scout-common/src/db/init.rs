//! Database initialization
//!
//! Opens (or creates) the shared SQLite database and applies the schema.
//! Every statement is idempotent, so calling this on an existing database is
//! safe. Timestamps are stored as unix milliseconds (INTEGER) so ordering and
//! equality comparisons are exact.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // WAL lets the selector read while an upsert transaction writes
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and dry runs
///
/// Each SQLite in-memory connection is a separate database, so the pool is
/// pinned to a single connection.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_entities_table(pool).await?;
    create_company_founders_table(pool).await?;
    create_refresh_failures_table(pool).await?;
    create_scoring_queue_table(pool).await?;
    create_scheduler_runs_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind(crate::time::now_millis().timestamp_millis())
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Companies and founders share one table; `kind` tells them apart
async fn create_entities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('company', 'founder')),
            name TEXT NOT NULL,
            summary TEXT,
            industry TEXT,
            location TEXT,
            founded TEXT,
            funding_stage TEXT,
            title TEXT,
            current_company TEXT,
            twitter_handle TEXT,
            linkedin_handle TEXT,
            twitter_summary TEXT,
            source_links TEXT NOT NULL DEFAULT '[]',
            affiliation_status TEXT NOT NULL DEFAULT 'unknown'
                CHECK (affiliation_status IN ('unknown', 'confirmed', 'rejected')),
            relevance_score REAL,
            last_refreshed_at INTEGER,
            refresh_blocked_until INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_kind_name ON entities (kind, name COLLATE NOCASE)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_staleness ON entities (last_refreshed_at, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Founder ↔ company links keyed by natural identity, not insertion order
async fn create_company_founders_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS company_founders (
            company_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            founder_name TEXT NOT NULL COLLATE NOCASE,
            title TEXT,
            PRIMARY KEY (company_id, founder_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_refresh_failures_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS refresh_failures (
            entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            provider TEXT NOT NULL,
            cause TEXT NOT NULL,
            failed_at INTEGER NOT NULL,
            blocked_until INTEGER NOT NULL,
            PRIMARY KEY (entity_id, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_scoring_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scoring_queue (
            entity_id INTEGER PRIMARY KEY REFERENCES entities(id) ON DELETE CASCADE,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_scheduler_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            selected INTEGER NOT NULL DEFAULT 0,
            enqueued INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
