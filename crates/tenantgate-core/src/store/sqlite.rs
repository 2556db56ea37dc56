// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed entity store.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use super::{
    AccessCount, AccessEvent, AuditEntry, Ban, BanKind, BudgetSettings, DomainBinding, EventQuery,
    ExportArtifact, ExportJob, ExportKind, ExportSubscription, IdempotencyRecord, MemberRole,
    NewAccessEvent, NewVersion, Quota, QuotaMutation, RangePage, RuntimeExecution, Session, Store,
    TaskEntry, UsageEvent, Workspace, WorkspaceMember, WorkspaceVersion,
};
use crate::error::{Error, Result};
use crate::time::truncate as ts;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a database file, creating it and its parent directory if needed,
    /// and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Open a `sqlite:` URL, or a plain file path, and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        if !url.starts_with("sqlite:") {
            return Box::pin(Self::from_path(url)).await;
        }
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store with migrations applied.
    ///
    /// The connection is never recycled, since closing it drops the database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn create_workspace(&self, ws: &Workspace) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workspaces (
                id, slug, name, owner_user_id, plan, region, access_mode, data_classification,
                rate_limit, allowed_origins, require_captcha, delete_stage, delete_deadline,
                current_version_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ws.id)
        .bind(&ws.slug)
        .bind(&ws.name)
        .bind(ws.owner_user_id)
        .bind(ws.plan.as_ref())
        .bind(&ws.region)
        .bind(ws.access_mode.as_ref())
        .bind(ws.data_classification.as_ref())
        .bind(Json(&ws.rate_limit))
        .bind(Json(&ws.allowed_origins))
        .bind(ws.require_captcha)
        .bind(ws.delete_stage.as_ref())
        .bind(ws.delete_deadline.map(ts))
        .bind(ws.current_version_id)
        .bind(ts(ws.created_at))
        .bind(ts(ws.updated_at))
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(Error::InvalidState(format!(
                    "slug '{}' is already taken",
                    ws.slug
                )));
            }
            return Err(e.into());
        }

        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, permissions, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, user_id)
            DO UPDATE SET role = excluded.role, permissions = excluded.permissions
            "#,
        )
        .bind(ws.id)
        .bind(ws.owner_user_id)
        .bind(MemberRole::Owner.as_ref())
        .bind(MemberRole::Owner.permissions())
        .bind(ts(ws.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>> {
        let ws = sqlx::query_as::<_, Workspace>(
            "SELECT * FROM workspaces WHERE id = ? AND delete_stage = 'active'",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ws)
    }

    async fn get_workspace_by_slug(&self, slug: &str) -> Result<Option<Workspace>> {
        let ws = sqlx::query_as::<_, Workspace>(
            "SELECT * FROM workspaces WHERE slug = ? AND delete_stage = 'active'",
        )
        .bind(slug.trim().to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(ws)
    }

    async fn update_workspace(&self, ws: &Workspace) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workspaces
            SET name = ?, plan = ?, region = ?, access_mode = ?, data_classification = ?,
                rate_limit = ?, allowed_origins = ?, require_captcha = ?, updated_at = ?
            WHERE id = ? AND delete_stage = 'active'
            "#,
        )
        .bind(&ws.name)
        .bind(ws.plan.as_ref())
        .bind(&ws.region)
        .bind(ws.access_mode.as_ref())
        .bind(ws.data_classification.as_ref())
        .bind(Json(&ws.rate_limit))
        .bind(Json(&ws.allowed_origins))
        .bind(ws.require_captcha)
        .bind(ts(ws.updated_at))
        .bind(ws.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn schedule_workspace_deletion(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET delete_stage = 'pending_delete', delete_deadline = ?, updated_at = ?
            WHERE id = ? AND delete_stage = 'active'
            "#,
        )
        .bind(ts(deadline))
        .bind(ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn workspaces_due_for_purge(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM workspaces
            WHERE delete_stage = 'pending_delete' AND delete_deadline <= ?
            ORDER BY delete_deadline
            LIMIT ?
            "#,
        )
        .bind(ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn purge_workspace(&self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "workspace_members",
            "sessions",
            "access_events",
            "bans",
            "quotas",
            "budget_settings",
            "usage_events",
            "runtime_executions",
            "domain_bindings",
            "export_subscriptions",
            "export_jobs",
            "audit_logs",
            "workspace_versions",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE workspace_id = ?"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE workspaces
            SET delete_stage = 'purged', current_version_id = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ts(now))
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn publish_version(
        &self,
        workspace_id: Uuid,
        version: &NewVersion,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceVersion> {
        let mut tx = self.pool.begin().await?;

        // Writing first takes the database write lock before the version number is read.
        let touched = sqlx::query(
            "UPDATE workspaces SET updated_at = ? WHERE id = ? AND delete_stage = 'active'",
        )
        .bind(ts(now))
        .bind(workspace_id)
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(Error::WorkspaceNotFound);
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM workspace_versions WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_one(&mut *tx)
        .await?;

        let row = WorkspaceVersion {
            id: Uuid::new_v4(),
            workspace_id,
            version: next,
            ui_schema: version.ui_schema.clone(),
            db_schema: version.db_schema.clone(),
            config: version.config.clone(),
            workflow_id: version.workflow_id,
            changelog: version.changelog.clone(),
            created_by,
            created_at: ts(now),
        };

        sqlx::query(
            r#"
            INSERT INTO workspace_versions (
                id, workspace_id, version, ui_schema, db_schema, config,
                workflow_id, changelog, created_by, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(row.id)
        .bind(row.workspace_id)
        .bind(row.version)
        .bind(Json(&row.ui_schema))
        .bind(Json(&row.db_schema))
        .bind(Json(&row.config))
        .bind(row.workflow_id)
        .bind(&row.changelog)
        .bind(row.created_by)
        .bind(row.created_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE workspaces SET current_version_id = ? WHERE id = ?")
            .bind(row.id)
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn get_version(&self, id: Uuid) -> Result<Option<WorkspaceVersion>> {
        let version =
            sqlx::query_as::<_, WorkspaceVersion>("SELECT * FROM workspace_versions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    async fn list_versions(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceVersion>> {
        let versions = sqlx::query_as::<_, WorkspaceVersion>(
            "SELECT * FROM workspace_versions WHERE workspace_id = ? ORDER BY version",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }

    async fn upsert_member(&self, member: &WorkspaceMember) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, permissions, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, user_id)
            DO UPDATE SET role = excluded.role, permissions = excluded.permissions
            "#,
        )
        .bind(member.workspace_id)
        .bind(member.user_id)
        .bind(member.role.as_ref())
        .bind(member.permissions)
        .bind(ts(member.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceMember>> {
        let member = sqlx::query_as::<_, WorkspaceMember>(
            "SELECT * FROM workspace_members WHERE workspace_id = ? AND user_id = ?",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(member)
    }

    async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>> {
        let members = sqlx::query_as::<_, WorkspaceMember>(
            "SELECT * FROM workspace_members WHERE workspace_id = ? ORDER BY created_at, user_id",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM workspace_members WHERE workspace_id = ? AND user_id = ? AND role <> 'owner'",
        )
        .bind(workspace_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_domain(&self, binding: &DomainBinding) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO domain_bindings (domain, workspace_id, status, verified, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (domain) DO UPDATE
            SET status = excluded.status, verified = excluded.verified, updated_at = excluded.updated_at
            WHERE domain_bindings.workspace_id = excluded.workspace_id
            "#,
        )
        .bind(&binding.domain)
        .bind(binding.workspace_id)
        .bind(binding.status.as_ref())
        .bind(binding.verified)
        .bind(ts(binding.created_at))
        .bind(ts(binding.updated_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::InvalidState(format!(
                "domain '{}' is bound to another workspace",
                binding.domain
            )));
        }
        Ok(())
    }

    async fn get_domain(&self, domain: &str) -> Result<Option<DomainBinding>> {
        let binding =
            sqlx::query_as::<_, DomainBinding>("SELECT * FROM domain_bindings WHERE domain = ?")
                .bind(domain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(binding)
    }

    async fn list_domains(&self, workspace_id: Uuid) -> Result<Vec<DomainBinding>> {
        let bindings = sqlx::query_as::<_, DomainBinding>(
            "SELECT * FROM domain_bindings WHERE workspace_id = ? ORDER BY domain",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bindings)
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, workspace_id, user_id, first_seen_ip, last_seen_ip, user_agent_hash,
                state, blocked_reason, blocked_until, created_at, last_active_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id)
        .bind(session.workspace_id)
        .bind(session.user_id)
        .bind(&session.first_seen_ip)
        .bind(&session.last_seen_ip)
        .bind(&session.user_agent_hash)
        .bind(session.state.as_ref())
        .bind(&session.blocked_reason)
        .bind(session.blocked_until.map(ts))
        .bind(ts(session.created_at))
        .bind(ts(session.last_active_at))
        .bind(ts(session.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(session)
    }

    async fn touch_session(
        &self,
        id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET last_seen_ip = ?, last_active_at = ?, expires_at = ? WHERE id = ?",
        )
        .bind(ip)
        .bind(ts(now))
        .bind(ts(expires_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn block_session(&self, id: Uuid, reason: &str, until: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET state = 'blocked', blocked_reason = ?, blocked_until = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(until.map(ts))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unblock_session(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET state = 'active', blocked_reason = NULL, blocked_until = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ? AND state = 'active'")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_access_event(&self, event: &NewAccessEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO access_events (workspace_id, session_id, ip, event_type, path, captcha_provided, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.workspace_id)
        .bind(event.session_id)
        .bind(&event.ip)
        .bind(event.event_type.as_ref())
        .bind(&event.path)
        .bind(event.captcha_provided)
        .bind(ts(event.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_access_events(
        &self,
        workspace_id: Uuid,
        ip: &str,
        session_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<AccessCount> {
        let since = ts(since);
        let (by_ip, by_session): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM access_events
                 WHERE workspace_id = ? AND ip = ? AND occurred_at >= ?
                   AND event_type IN ('entry', 'schema', 'execute')),
                (SELECT COUNT(*) FROM access_events
                 WHERE workspace_id = ? AND session_id = ? AND occurred_at >= ?
                   AND event_type IN ('entry', 'schema', 'execute'))
            "#,
        )
        .bind(workspace_id)
        .bind(ip)
        .bind(since)
        .bind(workspace_id)
        .bind(session_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(AccessCount { by_ip, by_session })
    }

    async fn list_access_events(&self, query: &EventQuery) -> Result<Vec<AccessEvent>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM access_events WHERE workspace_id = ");
        qb.push_bind(query.workspace_id);
        if let Some(from) = query.from {
            qb.push(" AND occurred_at >= ").push_bind(ts(from));
        }
        if let Some(to) = query.to {
            qb.push(" AND occurred_at < ").push_bind(ts(to));
        }
        if !query.event_types.is_empty() {
            qb.push(" AND event_type IN (");
            let mut types = qb.separated(", ");
            for event_type in &query.event_types {
                types.push_bind(event_type.as_ref().to_string());
            }
            types.push_unseparated(")");
        }
        qb.push(" ORDER BY occurred_at, id LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let events = qb
            .build_query_as::<AccessEvent>()
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn delete_access_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM access_events WHERE occurred_at < ?")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_ban(&self, ban: &Ban) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bans (workspace_id, kind, value, reason, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id, kind, value)
            DO UPDATE SET reason = excluded.reason, created_at = excluded.created_at,
                          expires_at = excluded.expires_at
            "#,
        )
        .bind(ban.workspace_id)
        .bind(ban.kind.as_ref())
        .bind(&ban.value)
        .bind(&ban.reason)
        .bind(ts(ban.created_at))
        .bind(ban.expires_at.map(ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active_ban(
        &self,
        workspace_id: Uuid,
        kind: BanKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ban>> {
        let ban = sqlx::query_as::<_, Ban>(
            r#"
            SELECT * FROM bans
            WHERE workspace_id = ? AND kind = ? AND value = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(workspace_id)
        .bind(kind.as_ref())
        .bind(value)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await?;
        Ok(ban)
    }

    async fn get_quota(&self, workspace_id: Uuid, period_start: DateTime<Utc>) -> Result<Option<Quota>> {
        let quota = sqlx::query_as::<_, Quota>(
            "SELECT * FROM quotas WHERE workspace_id = ? AND period_start = ?",
        )
        .bind(workspace_id)
        .bind(ts(period_start))
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota)
    }

    async fn list_quotas(&self, workspace_id: Uuid) -> Result<Vec<Quota>> {
        let quotas = sqlx::query_as::<_, Quota>(
            "SELECT * FROM quotas WHERE workspace_id = ? ORDER BY period_start",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(quotas)
    }

    async fn update_quota(&self, initial: &Quota, mutate: QuotaMutation<'_>) -> Result<Quota> {
        let mut tx = self.pool.begin().await?;

        // The insert is the transaction's first statement, so the write lock is
        // held before the row is read. Dropping `tx` rolls everything back.
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO quotas (
                workspace_id, period_start, period_end, plan, limits, usage,
                cost_to_date, alerted_thresholds, spend_blocked, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(initial.workspace_id)
        .bind(ts(initial.period_start))
        .bind(ts(initial.period_end))
        .bind(initial.plan.as_ref())
        .bind(Json(&initial.limits))
        .bind(Json(&initial.usage))
        .bind(initial.cost_to_date)
        .bind(Json(&initial.alerted_thresholds))
        .bind(initial.spend_blocked)
        .bind(ts(initial.updated_at))
        .execute(&mut *tx)
        .await?;

        let current = sqlx::query_as::<_, Quota>(
            "SELECT * FROM quotas WHERE workspace_id = ? AND period_start = ?",
        )
        .bind(initial.workspace_id)
        .bind(ts(initial.period_start))
        .fetch_one(&mut *tx)
        .await?;

        let budget = sqlx::query_as::<_, BudgetSettings>(
            "SELECT * FROM budget_settings WHERE workspace_id = ?",
        )
        .bind(initial.workspace_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(write) = mutate(&current, budget.as_ref())? else {
            tx.commit().await?;
            return Ok(current);
        };

        sqlx::query(
            r#"
            UPDATE quotas
            SET limits = ?, usage = ?, cost_to_date = ?, alerted_thresholds = ?,
                spend_blocked = ?, updated_at = ?
            WHERE workspace_id = ? AND period_start = ?
            "#,
        )
        .bind(Json(&write.quota.limits))
        .bind(Json(&write.quota.usage))
        .bind(write.quota.cost_to_date)
        .bind(Json(&write.quota.alerted_thresholds))
        .bind(write.quota.spend_blocked)
        .bind(ts(write.quota.updated_at))
        .bind(current.workspace_id)
        .bind(ts(current.period_start))
        .execute(&mut *tx)
        .await?;

        if let Some(event) = &write.event {
            sqlx::query(
                r#"
                INSERT INTO usage_events (id, workspace_id, usage, cost, currency, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.id)
            .bind(event.workspace_id)
            .bind(Json(&event.usage))
            .bind(event.cost)
            .bind(&event.currency)
            .bind(ts(event.recorded_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(write.quota)
    }

    async fn get_budget(&self, workspace_id: Uuid) -> Result<Option<BudgetSettings>> {
        let budget = sqlx::query_as::<_, BudgetSettings>(
            "SELECT * FROM budget_settings WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(budget)
    }

    async fn put_budget(&self, budget: &BudgetSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO budget_settings (
                workspace_id, monthly_budget, currency, thresholds, spend_limit,
                spend_limit_enabled, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (workspace_id) DO UPDATE
            SET monthly_budget = excluded.monthly_budget, currency = excluded.currency,
                thresholds = excluded.thresholds, spend_limit = excluded.spend_limit,
                spend_limit_enabled = excluded.spend_limit_enabled, updated_at = excluded.updated_at
            "#,
        )
        .bind(budget.workspace_id)
        .bind(budget.monthly_budget)
        .bind(&budget.currency)
        .bind(Json(&budget.thresholds))
        .bind(budget.spend_limit)
        .bind(budget.spend_limit_enabled)
        .bind(ts(budget.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_usage_events(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<UsageEvent>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM usage_events WHERE workspace_id = ");
        qb.push_bind(workspace_id);
        push_range(&mut qb, "recorded_at", page, "recorded_at, id");
        let events = qb
            .build_query_as::<UsageEvent>()
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn insert_execution(&self, execution: &RuntimeExecution) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO runtime_executions (
                execution_id, workspace_id, version_id, workflow_id, user_id, session_id,
                trigger_type, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.execution_id)
        .bind(execution.workspace_id)
        .bind(execution.version_id)
        .bind(execution.workflow_id)
        .bind(execution.user_id)
        .bind(execution.session_id)
        .bind(&execution.trigger_type)
        .bind(&execution.status)
        .bind(ts(execution.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_executions(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<RuntimeExecution>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT * FROM runtime_executions WHERE workspace_id = ");
        qb.push_bind(workspace_id);
        push_range(&mut qb, "created_at", page, "created_at, execution_id");
        let executions = qb
            .build_query_as::<RuntimeExecution>()
            .fetch_all(&self.pool)
            .await?;
        Ok(executions)
    }

    async fn insert_export_job(&self, job: &ExportJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id, workspace_id, kind, status, requested_by, format, options,
                range_start, range_end, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(job.workspace_id)
        .bind(job.kind.as_ref())
        .bind(job.status.as_ref())
        .bind(job.requested_by)
        .bind(&job.format)
        .bind(Json(&job.options))
        .bind(job.range_start.map(ts))
        .bind(job.range_end.map(ts))
        .bind(ts(job.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_export_job(&self, id: Uuid) -> Result<Option<ExportJob>> {
        let job = sqlx::query_as::<_, ExportJob>("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn list_export_jobs(
        &self,
        workspace_id: Uuid,
        kinds: &[ExportKind],
        limit: i64,
    ) -> Result<Vec<ExportJob>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM export_jobs WHERE workspace_id = ");
        qb.push_bind(workspace_id);
        if !kinds.is_empty() {
            qb.push(" AND kind IN (");
            let mut list = qb.separated(", ");
            for kind in kinds {
                list.push_bind(kind.as_ref().to_string());
            }
            list.push_unseparated(")");
        }
        qb.push(" ORDER BY created_at DESC, id LIMIT ").push_bind(limit);
        let jobs = qb.build_query_as::<ExportJob>().fetch_all(&self.pool).await?;
        Ok(jobs)
    }

    async fn start_export_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'running', started_at = ?, error = NULL
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_export_job(
        &self,
        id: Uuid,
        artifact: &ExportArtifact,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'completed', file_path = ?, file_name = ?, file_size = ?,
                record_count = ?, error = NULL, completed_at = ?, expires_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(&artifact.file_path)
        .bind(&artifact.file_name)
        .bind(artifact.file_size)
        .bind(artifact.record_count)
        .bind(ts(now))
        .bind(ts(expires_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_export_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'failed', error = ?, completed_at = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(error)
        .bind(ts(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_export_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'queued', error = NULL, started_at = NULL, completed_at = NULL
            WHERE id = ? AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn expired_export_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExportJob>> {
        let jobs = sqlx::query_as::<_, ExportJob>(
            r#"
            SELECT * FROM export_jobs
            WHERE status = 'completed' AND expires_at <= ?
            ORDER BY expires_at
            LIMIT ?
            "#,
        )
        .bind(ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn mark_export_expired(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE export_jobs SET status = 'expired' WHERE id = ? AND status = 'completed'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_export_job(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM export_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_subscription(&self, sub: &ExportSubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO export_subscriptions (
                id, workspace_id, cron, format, event_types, created_by, active,
                last_run_at, next_run_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sub.id)
        .bind(sub.workspace_id)
        .bind(&sub.cron)
        .bind(&sub.format)
        .bind(Json(&sub.event_types))
        .bind(sub.created_by)
        .bind(sub.active)
        .bind(sub.last_run_at.map(ts))
        .bind(ts(sub.next_run_at))
        .bind(ts(sub.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<ExportSubscription>> {
        let subs = sqlx::query_as::<_, ExportSubscription>(
            "SELECT * FROM export_subscriptions WHERE workspace_id = ? ORDER BY created_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn delete_subscription(&self, workspace_id: Uuid, id: Uuid) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM export_subscriptions WHERE workspace_id = ? AND id = ?")
                .bind(workspace_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn due_subscriptions(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExportSubscription>> {
        let subs = sqlx::query_as::<_, ExportSubscription>(
            r#"
            SELECT * FROM export_subscriptions
            WHERE active = 1 AND next_run_at <= ?
            ORDER BY next_run_at
            LIMIT ?
            "#,
        )
        .bind(ts(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn advance_subscription(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE export_subscriptions SET last_run_at = ?, next_run_at = ? WHERE id = ?")
            .bind(ts(last_run_at))
            .bind(ts(next_run_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue_task(&self, task: &TaskEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_queue (
                task_id, queue_name, payload, state, attempts, max_attempts,
                available_at, lease_expires_at, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id)
        .bind(&task.queue_name)
        .bind(Json(&task.payload))
        .bind(task.state.as_ref())
        .bind(task.attempts)
        .bind(task.max_attempts)
        .bind(ts(task.available_at))
        .bind(task.lease_expires_at.map(ts))
        .bind(&task.last_error)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_task(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<TaskEntry>> {
        let now = ts(now);
        let task = sqlx::query_as::<_, TaskEntry>(
            r#"
            UPDATE task_queue
            SET state = 'in_flight', attempts = attempts + 1, lease_expires_at = ?, updated_at = ?
            WHERE task_id = (
                SELECT task_id FROM task_queue
                WHERE queue_name = ?
                  AND ((state = 'pending' AND available_at <= ?)
                       OR (state = 'in_flight' AND lease_expires_at <= ?))
                ORDER BY available_at, created_at
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(ts(lease_until))
        .bind(now)
        .bind(queue_name)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskEntry>> {
        let task = sqlx::query_as::<_, TaskEntry>("SELECT * FROM task_queue WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    async fn complete_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'succeeded', lease_expires_at = NULL, last_error = NULL, updated_at = ?
            WHERE task_id = ? AND state = 'in_flight'
            "#,
        )
        .bind(ts(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_task(
        &self,
        task_id: Uuid,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'pending', available_at = ?, lease_expires_at = NULL,
                last_error = ?, updated_at = ?
            WHERE task_id = ? AND state = 'in_flight'
            "#,
        )
        .bind(ts(available_at))
        .bind(error)
        .bind(ts(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bury_task(&self, task_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'dead', lease_expires_at = NULL, last_error = ?, updated_at = ?
            WHERE task_id = ? AND state IN ('pending', 'in_flight')
            "#,
        )
        .bind(error)
        .bind(ts(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dead_tasks(&self, queue_name: Option<&str>, offset: i64, limit: i64) -> Result<Vec<TaskEntry>> {
        let tasks = sqlx::query_as::<_, TaskEntry>(
            r#"
            SELECT * FROM task_queue
            WHERE state = 'dead' AND (? IS NULL OR queue_name = ?)
            ORDER BY updated_at, task_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(queue_name)
        .bind(queue_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn revive_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE task_queue
            SET state = 'pending', attempts = 0, available_at = ?, lease_expires_at = NULL,
                updated_at = ?
            WHERE task_id = ? AND state = 'dead'
            "#,
        )
        .bind(ts(now))
        .bind(ts(now))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_dead_task(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM task_queue WHERE task_id = ? AND state = 'dead'")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO audit_logs (
                id, workspace_id, action, actor_user_id, target_type, target_id,
                metadata, ip, user_agent, occurred_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id)
        .bind(entry.workspace_id)
        .bind(&entry.action)
        .bind(entry.actor_user_id)
        .bind(&entry.target_type)
        .bind(&entry.target_id)
        .bind(Json(&entry.metadata))
        .bind(&entry.ip)
        .bind(&entry.user_agent)
        .bind(ts(entry.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<AuditEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM audit_logs WHERE workspace_id = ");
        qb.push_bind(workspace_id);
        push_range(&mut qb, "occurred_at", page, "occurred_at, id");
        let entries = qb
            .build_query_as::<AuditEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn begin_idempotency(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM idempotency_keys WHERE scope = ? AND key = ? AND expires_at <= ?")
            .bind(scope)
            .bind(key)
            .bind(ts(now))
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO idempotency_keys (scope, key, request_hash, state, created_at, expires_at)
            VALUES (?, ?, ?, 'in_progress', ?, ?)
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(request_hash)
        .bind(ts(now))
        .bind(ts(expires_at))
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        let existing = if inserted {
            None
        } else {
            sqlx::query_as::<_, IdempotencyRecord>(
                "SELECT * FROM idempotency_keys WHERE scope = ? AND key = ?",
            )
            .bind(scope)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(existing)
    }

    async fn complete_idempotency(
        &self,
        scope: &str,
        key: &str,
        status: u16,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET state = 'completed', response_status = ?, response_headers = ?, response_body = ?
            WHERE scope = ? AND key = ?
            "#,
        )
        .bind(i64::from(status))
        .bind(serde_json::to_string(headers)?)
        .bind(body)
        .bind(scope)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_idempotency(&self, scope: &str, key: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM idempotency_keys WHERE scope = ? AND key = ? AND state = 'in_progress'",
        )
        .bind(scope)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= ?")
            .bind(ts(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Append a `[from, to)` filter on `column`, ordering and paging.
fn push_range(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, page: RangePage, order_by: &str) {
    if let Some(from) = page.from {
        qb.push(format!(" AND {column} >= ")).push_bind(ts(from));
    }
    if let Some(to) = page.to {
        qb.push(format!(" AND {column} < ")).push_bind(ts(to));
    }
    qb.push(format!(" ORDER BY {order_by} LIMIT "))
        .push_bind(page.limit)
        .push(" OFFSET ")
        .push_bind(page.offset);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        AccessEventType, AccessMode, DataClassification, DeleteStage, ExportStatus, Plan,
        RateLimitConfig, TaskState,
    };
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn workspace(slug: &str) -> Workspace {
        let now = crate::time::now();
        Workspace {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: format!("{slug} app"),
            owner_user_id: Uuid::new_v4(),
            plan: Plan::Free,
            region: "eu".to_string(),
            access_mode: AccessMode::PublicAnonymous,
            data_classification: DataClassification::Public,
            rate_limit: RateLimitConfig::default(),
            allowed_origins: vec![],
            require_captcha: false,
            delete_stage: DeleteStage::Active,
            delete_deadline: None,
            current_version_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn task(queue: &str, available_at: DateTime<Utc>) -> TaskEntry {
        TaskEntry {
            task_id: Uuid::new_v4(),
            queue_name: queue.to_string(),
            payload: json!({"job_id": Uuid::new_v4()}),
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: 3,
            available_at,
            lease_expires_at: None,
            last_error: None,
            created_at: available_at,
            updated_at: available_at,
        }
    }

    #[tokio::test]
    async fn test_create_workspace_writes_owner_member() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ws = workspace("demo");
        store.create_workspace(&ws).await.unwrap();

        let loaded = store.get_workspace_by_slug("Demo").await.unwrap().unwrap();
        assert_eq!(loaded.id, ws.id);
        assert_eq!(loaded.access_mode, AccessMode::PublicAnonymous);

        let owner = store
            .get_member(ws.id, ws.owner_user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(owner.role, MemberRole::Owner);
        assert!(!store.remove_member(ws.id, ws.owner_user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_slug_is_rejected() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_workspace(&workspace("demo")).await.unwrap();
        let err = store.create_workspace(&workspace("demo")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_state");
    }

    #[tokio::test]
    async fn test_publish_version_is_monotonic_and_current() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ws = workspace("demo");
        store.create_workspace(&ws).await.unwrap();

        let now = crate::time::now();
        let v1 = store
            .publish_version(ws.id, &NewVersion::default(), ws.owner_user_id, now)
            .await
            .unwrap();
        let v2 = store
            .publish_version(ws.id, &NewVersion::default(), ws.owner_user_id, now)
            .await
            .unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let loaded = store.get_workspace(ws.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_version_id, Some(v2.id));
    }

    #[tokio::test]
    async fn test_soft_deleted_workspace_is_hidden_and_purged() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ws = workspace("gone");
        store.create_workspace(&ws).await.unwrap();
        let now = crate::time::now();

        assert!(store.schedule_workspace_deletion(ws.id, now, now).await.unwrap());
        assert!(store.get_workspace(ws.id).await.unwrap().is_none());

        let due = store.workspaces_due_for_purge(now, 10).await.unwrap();
        assert_eq!(due, vec![ws.id]);
        store.purge_workspace(ws.id, now).await.unwrap();
        assert!(store.list_members(ws.id).await.unwrap().is_empty());

        // The slug is free again once purged.
        store.create_workspace(&workspace("gone")).await.unwrap();
    }

    #[tokio::test]
    async fn test_access_event_counts_by_ip_and_session() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ws = Uuid::new_v4();
        let session = Uuid::new_v4();
        let now = crate::time::now();

        for (ip, sid, age) in [
            ("10.0.0.1", Some(session), 5),
            ("10.0.0.1", None, 10),
            ("10.0.0.2", Some(session), 20),
            ("10.0.0.1", Some(session), 120),
        ] {
            store
                .insert_access_event(&NewAccessEvent {
                    workspace_id: ws,
                    session_id: sid,
                    ip: ip.to_string(),
                    event_type: AccessEventType::Entry,
                    path: "/runtime/demo".to_string(),
                    captcha_provided: false,
                    occurred_at: now - ChronoDuration::seconds(age),
                })
                .await
                .unwrap();
        }

        let count = store
            .count_access_events(ws, "10.0.0.1", Some(session), now - ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(count, AccessCount { by_ip: 2, by_session: 2 });

        let no_session = store
            .count_access_events(ws, "10.0.0.1", None, now - ChronoDuration::seconds(60))
            .await
            .unwrap();
        assert_eq!(no_session.by_session, 0);
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_respects_available_at() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let later = task("q", now + ChronoDuration::seconds(30));
        let first = task("q", now - ChronoDuration::seconds(10));
        let second = task("q", now - ChronoDuration::seconds(5));
        for t in [&later, &second, &first] {
            assert!(store.enqueue_task(t).await.unwrap());
        }
        assert!(!store.enqueue_task(&first).await.unwrap());

        let lease = now + ChronoDuration::seconds(60);
        let a = store.claim_task("q", now, lease).await.unwrap().unwrap();
        let b = store.claim_task("q", now, lease).await.unwrap().unwrap();
        assert_eq!(a.task_id, first.task_id);
        assert_eq!(a.attempts, 1);
        assert_eq!(a.state, TaskState::InFlight);
        assert_eq!(b.task_id, second.task_id);
        assert!(store.claim_task("q", now, lease).await.unwrap().is_none());
        assert!(store.claim_task("other", now, lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let t = task("q", now);
        store.enqueue_task(&t).await.unwrap();

        store
            .claim_task("q", now, now + ChronoDuration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert!(
            store
                .claim_task("q", now + ChronoDuration::seconds(10), now + ChronoDuration::seconds(40))
                .await
                .unwrap()
                .is_none()
        );

        let after = now + ChronoDuration::seconds(31);
        let again = store
            .claim_task("q", after, after + ChronoDuration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.task_id, t.task_id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_dead_task_revive_resets_attempts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let t = task("q", now);
        store.enqueue_task(&t).await.unwrap();
        store
            .claim_task("q", now, now + ChronoDuration::seconds(30))
            .await
            .unwrap();
        store.bury_task(t.task_id, "io timeout", now).await.unwrap();

        let dead = store.list_dead_tasks(Some("q"), 0, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("io timeout"));

        assert!(store.revive_task(t.task_id, now).await.unwrap());
        assert!(!store.revive_task(t.task_id, now).await.unwrap());
        let revived = store.get_task(t.task_id).await.unwrap().unwrap();
        assert_eq!(revived.state, TaskState::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.available_at, now);
        assert!(!store.delete_dead_task(t.task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_quota_rolls_back_on_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let (start, end) = crate::time::month_period(now);
        let initial = Quota {
            workspace_id: Uuid::new_v4(),
            period_start: start,
            period_end: end,
            plan: Plan::Free,
            limits: [("requests".to_string(), 10.0)].into_iter().collect(),
            usage: Default::default(),
            cost_to_date: 0.0,
            alerted_thresholds: vec![],
            spend_blocked: false,
            updated_at: now,
        };

        let err = store
            .update_quota(&initial, Box::new(|_, _| Err(Error::Internal("boom".into()))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "internal");
        assert!(store.get_quota(initial.workspace_id, start).await.unwrap().is_none());

        let saved = store
            .update_quota(
                &initial,
                Box::new(|q, _| {
                    let mut next = q.clone();
                    next.usage.insert("requests".to_string(), 3.0);
                    Ok(Some(crate::store::QuotaWrite {
                        quota: next,
                        event: None,
                    }))
                }),
            )
            .await
            .unwrap();
        assert_eq!(saved.usage["requests"], 3.0);
        let loaded = store
            .get_quota(initial.workspace_id, start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.usage["requests"], 3.0);
    }

    #[tokio::test]
    async fn test_idempotency_reservation() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let exp = now + ChronoDuration::hours(1);

        assert!(
            store
                .begin_idempotency("execute", "k1", "h1", now, exp)
                .await
                .unwrap()
                .is_none()
        );
        let held = store
            .begin_idempotency("execute", "k1", "h1", now, exp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.state, crate::store::IdempotencyState::InProgress);

        store
            .complete_idempotency(
                "execute",
                "k1",
                200,
                &BTreeMap::from([("x-workspace-session-id".to_string(), "s-1".to_string())]),
                "{\"ok\":true}",
            )
            .await
            .unwrap();
        let done = store
            .begin_idempotency("execute", "k1", "h1", now, exp)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.response_status, Some(200));
        assert_eq!(done.stored_headers()["x-workspace-session-id"], "s-1");

        // Expired records are replaced.
        assert!(
            store
                .begin_idempotency("execute", "k1", "h2", exp, exp + ChronoDuration::hours(1))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_export_job_lifecycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = crate::time::now();
        let job = ExportJob {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            kind: ExportKind::AnalyticsExport,
            status: ExportStatus::Queued,
            requested_by: Uuid::new_v4(),
            format: "csv".to_string(),
            options: json!({}),
            range_start: None,
            range_end: None,
            file_path: None,
            file_name: None,
            file_size: None,
            record_count: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            expires_at: None,
        };
        store.insert_export_job(&job).await.unwrap();
        assert!(store.start_export_job(job.id, now).await.unwrap());
        store
            .complete_export_job(
                job.id,
                &ExportArtifact {
                    file_path: "exports/a/b/c.csv".into(),
                    file_name: "c.csv".into(),
                    file_size: 12,
                    record_count: 1,
                },
                now,
                now + ChronoDuration::seconds(5),
            )
            .await
            .unwrap();

        let expired = store
            .expired_export_jobs(now + ChronoDuration::seconds(5), 10)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        store.mark_export_expired(job.id).await.unwrap();
        let loaded = store.get_export_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExportStatus::Expired);
        assert!(!store.start_export_job(job.id, now).await.unwrap());
    }
}
