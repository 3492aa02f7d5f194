//! Entity persistence for the refresh scheduler
//!
//! All timestamps are unix milliseconds. `last_refreshed_at` only moves
//! forward and only through [`EntityStore::upsert_entity`].

use crate::models::{
    payload::merge_links, AffiliationStatus, Entity, EntityKind, EntityPayload, EntityRef,
    FounderLink,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scout_common::time::{from_millis, to_chrono};
use scout_common::{Error, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// One completed scheduler run (tick, discovery, maintenance)
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerRun {
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub selected: usize,
    pub enqueued: usize,
}

/// Persistence operations the scheduler depends on
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Entities whose data is older than `threshold` at `now`
    ///
    /// Null timestamps first, then oldest first, ties by id. Entities in
    /// `exclude` or under an unexpired permanent-failure block are skipped.
    async fn load_entities_needing_refresh(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
        limit: usize,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<EntityRef>>;

    /// Merge `payload` into entity `id` inside one transaction
    async fn upsert_entity(
        &self,
        id: i64,
        payload: &EntityPayload,
        refreshed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Block the entity from selection until `blocked_until`
    async fn mark_refresh_failed_permanent(
        &self,
        id: i64,
        provider: &str,
        cause: &str,
        failed_at: DateTime<Utc>,
        blocked_until: DateTime<Utc>,
    ) -> Result<()>;

    /// Insert a newly discovered entity; `None` when the name is already known
    async fn insert_discovered(
        &self,
        kind: EntityKind,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntityRef>>;

    /// Drop failure records whose block has expired; returns rows removed
    async fn clear_expired_failures(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn record_run(&self, run: &SchedulerRun) -> Result<()>;

    /// Start time of the most recent run of `kind`
    async fn last_run_started(&self, kind: &str) -> Result<Option<DateTime<Utc>>>;

    /// Delete runs of `kind` that started before `before`
    async fn prune_runs(&self, kind: &str, before: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed [`EntityStore`]
#[derive(Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert an entity directly (admin seeding and tests)
    pub async fn insert_entity(&self, kind: EntityKind, name: &str, now: DateTime<Utc>) -> Result<i64> {
        let name = normalize_name(name)?;
        let result = sqlx::query(
            "INSERT INTO entities (kind, name, created_at) VALUES (?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Load the full record, founders included
    pub async fn load_entity(&self, id: i64) -> Result<Option<Entity>> {
        let row = sqlx::query(
            r#"
            SELECT id, kind, name, summary, industry, location, founded, funding_stage,
                   title, current_company, twitter_handle, linkedin_handle, twitter_summary,
                   source_links, affiliation_status, relevance_score, last_refreshed_at,
                   refresh_blocked_until, created_at
            FROM entities
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let founders = sqlx::query(
            "SELECT founder_name, title FROM company_founders WHERE company_id = ? ORDER BY founder_name",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| FounderLink {
            name: r.get("founder_name"),
            title: r.get("title"),
        })
        .collect();

        let source_links: String = row.get("source_links");
        let kind: String = row.get("kind");
        let affiliation: String = row.get("affiliation_status");

        Ok(Some(Entity {
            id: row.get("id"),
            kind: kind.parse()?,
            name: row.get("name"),
            summary: row.get("summary"),
            industry: row.get("industry"),
            location: row.get("location"),
            founded: row.get("founded"),
            funding_stage: row.get("funding_stage"),
            title: row.get("title"),
            current_company: row.get("current_company"),
            twitter_handle: row.get("twitter_handle"),
            linkedin_handle: row.get("linkedin_handle"),
            twitter_summary: row.get("twitter_summary"),
            source_links: parse_links(&source_links),
            affiliation_status: affiliation.parse()?,
            relevance_score: row.get("relevance_score"),
            last_refreshed_at: millis_column(&row, "last_refreshed_at"),
            refresh_blocked_until: millis_column(&row, "refresh_blocked_until"),
            created_at: millis_column(&row, "created_at").unwrap_or_default(),
            founders,
        }))
    }

    /// Failure record for (entity, provider), if any: (cause, blocked_until)
    pub async fn load_failure(
        &self,
        id: i64,
        provider: &str,
    ) -> Result<Option<(String, DateTime<Utc>)>> {
        let row = sqlx::query(
            "SELECT cause, blocked_until FROM refresh_failures WHERE entity_id = ? AND provider = ?",
        )
        .bind(id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let cause: String = r.get("cause");
            millis_column(&r, "blocked_until").map(|until| (cause, until))
        }))
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn load_entities_needing_refresh(
        &self,
        now: DateTime<Utc>,
        threshold: Duration,
        limit: usize,
        exclude: &HashSet<i64>,
    ) -> Result<Vec<EntityRef>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let cutoff = (now - to_chrono(threshold)).timestamp_millis();
        // Over-fetch by the exclusion count so excluded rows never shrink the batch
        let fetch_limit = limit.saturating_add(exclude.len()).min(i64::MAX as usize) as i64;

        let rows = sqlx::query(
            r#"
            SELECT id, kind, name, last_refreshed_at, twitter_handle
            FROM entities
            WHERE (last_refreshed_at IS NULL OR last_refreshed_at < ?)
              AND (refresh_blocked_until IS NULL OR refresh_blocked_until <= ?)
            ORDER BY last_refreshed_at IS NOT NULL, last_refreshed_at ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(now.timestamp_millis())
        .bind(fetch_limit)
        .fetch_all(&self.pool)
        .await?;

        let mut selected = Vec::with_capacity(limit.min(rows.len()));
        for row in &rows {
            let id: i64 = row.get("id");
            if exclude.contains(&id) {
                continue;
            }
            selected.push(entity_ref_from_row(row)?);
            if selected.len() == limit {
                break;
            }
        }

        debug!(
            candidates = rows.len(),
            selected = selected.len(),
            excluded = exclude.len(),
            "Loaded stale entities"
        );

        Ok(selected)
    }

    async fn upsert_entity(
        &self,
        id: i64,
        payload: &EntityPayload,
        refreshed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT kind, name, affiliation_status, source_links FROM entities WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("entity {}", id)))?;

        let kind: EntityKind = current.get::<String, _>("kind").parse()?;
        let affiliation: AffiliationStatus =
            current.get::<String, _>("affiliation_status").parse()?;
        let existing_links = parse_links(&current.get::<String, _>("source_links"));

        let merged_links = merge_links(&existing_links, &payload.source_links);
        let links_json = serde_json::to_string(&merged_links)
            .map_err(|e| Error::Internal(format!("encode source links: {}", e)))?;
        let mut name = payload
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty());

        // A rename onto another entity's name keeps the stored name
        if let Some(new_name) = name {
            let taken: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM entities WHERE kind = ? AND name = ? COLLATE NOCASE AND id != ?",
            )
            .bind(kind.as_str())
            .bind(new_name)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(other) = taken {
                debug!(id, other, name = new_name, "Name belongs to another entity, not renaming");
                name = None;
            }
        }
        let current_name = name
            .map(str::to_string)
            .unwrap_or_else(|| current.get::<String, _>("name"));

        sqlx::query(
            r#"
            UPDATE entities SET
                name = COALESCE(?, name),
                summary = COALESCE(?, summary),
                industry = COALESCE(?, industry),
                location = COALESCE(?, location),
                founded = COALESCE(?, founded),
                funding_stage = COALESCE(?, funding_stage),
                title = COALESCE(?, title),
                current_company = COALESCE(?, current_company),
                twitter_handle = COALESCE(?, twitter_handle),
                linkedin_handle = COALESCE(?, linkedin_handle),
                twitter_summary = COALESCE(?, twitter_summary),
                source_links = ?,
                affiliation_status = ?,
                last_refreshed_at = MAX(COALESCE(last_refreshed_at, 0), ?),
                refresh_blocked_until = NULL
            WHERE id = ?
            "#,
        )
        .bind(name)
        .bind(&payload.summary)
        .bind(&payload.industry)
        .bind(&payload.location)
        .bind(&payload.founded)
        .bind(&payload.funding_stage)
        .bind(&payload.title)
        .bind(&payload.current_company)
        .bind(&payload.twitter_handle)
        .bind(&payload.linkedin_handle)
        .bind(&payload.twitter_summary)
        .bind(links_json)
        .bind(affiliation.merge(payload.affiliation_status).as_str())
        .bind(refreshed_at.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if kind == EntityKind::Company {
            for founder in &payload.founders {
                let founder_name = founder.name.trim();
                if founder_name.is_empty() {
                    continue;
                }
                sqlx::query(
                    r#"
                    INSERT INTO company_founders (company_id, founder_name, title)
                    VALUES (?, ?, ?)
                    ON CONFLICT(company_id, founder_name) DO UPDATE SET
                        title = COALESCE(excluded.title, company_founders.title)
                    "#,
                )
                .bind(id)
                .bind(founder_name)
                .bind(&founder.title)
                .execute(&mut *tx)
                .await?;

                // Founders are tracked entities in their own right
                sqlx::query(
                    r#"
                    INSERT INTO entities (kind, name, title, current_company, created_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT DO NOTHING
                    "#,
                )
                .bind(EntityKind::Founder.as_str())
                .bind(founder_name)
                .bind(&founder.title)
                .bind(&current_name)
                .bind(refreshed_at.timestamp_millis())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_refresh_failed_permanent(
        &self,
        id: i64,
        provider: &str,
        cause: &str,
        failed_at: DateTime<Utc>,
        blocked_until: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE entities
            SET refresh_blocked_until = MAX(COALESCE(refresh_blocked_until, 0), ?)
            WHERE id = ?
            "#,
        )
        .bind(blocked_until.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::NotFound(format!("entity {}", id)));
        }

        sqlx::query(
            r#"
            INSERT INTO refresh_failures (entity_id, provider, cause, failed_at, blocked_until)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_id, provider) DO UPDATE SET
                cause = excluded.cause,
                failed_at = excluded.failed_at,
                blocked_until = excluded.blocked_until
            "#,
        )
        .bind(id)
        .bind(provider)
        .bind(cause)
        .bind(failed_at.timestamp_millis())
        .bind(blocked_until.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_discovered(
        &self,
        kind: EntityKind,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EntityRef>> {
        let name = normalize_name(name)?;
        let result = sqlx::query(
            "INSERT INTO entities (kind, name, created_at) VALUES (?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(name)
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(EntityRef {
            id: result.last_insert_rowid(),
            kind,
            name: name.to_string(),
            last_refreshed_at: None,
            twitter_handle: None,
        }))
    }

    async fn clear_expired_failures(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_failures WHERE blocked_until <= ?")
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn record_run(&self, run: &SchedulerRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_runs (kind, started_at, finished_at, selected, enqueued)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.kind)
        .bind(run.started_at.timestamp_millis())
        .bind(run.finished_at.timestamp_millis())
        .bind(run.selected as i64)
        .bind(run.enqueued as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn last_run_started(&self, kind: &str) -> Result<Option<DateTime<Utc>>> {
        let started: Option<i64> =
            sqlx::query_scalar("SELECT MAX(started_at) FROM scheduler_runs WHERE kind = ?")
                .bind(kind)
                .fetch_one(&self.pool)
                .await?;

        Ok(started.and_then(from_millis))
    }

    async fn prune_runs(&self, kind: &str, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM scheduler_runs WHERE kind = ? AND started_at < ?")
            .bind(kind)
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn normalize_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("entity name must not be empty".to_string()));
    }
    Ok(trimmed)
}

fn parse_links(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn millis_column(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
    row.get::<Option<i64>, _>(column).and_then(from_millis)
}

fn entity_ref_from_row(row: &SqliteRow) -> Result<EntityRef> {
    let kind: String = row.get("kind");
    Ok(EntityRef {
        id: row.get("id"),
        kind: kind.parse()?,
        name: row.get("name"),
        last_refreshed_at: millis_column(row, "last_refreshed_at"),
        twitter_handle: row.get("twitter_handle"),
    })
}
