// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity store: persistent state of workspaces and everything they own.
//!
//! The [`Store`] trait is the only path to persisted state. Every query is
//! scoped by `workspace_id`; the few cross-workspace operations (purge,
//! reaping, the task queue, DLQ administration) are named as such.
//! Soft-deleted workspaces are filtered out of lookups.
//!
//! Time-dependent operations take `now` from the caller so that workers and
//! tests control the clock.

mod records;
pub mod sqlite;

pub use self::records::*;
pub use self::sqlite::SqliteStore;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;

/// Mutation applied to the current period's quota inside the consume transaction.
///
/// Receives the locked quota row and the workspace's budget settings. Returning
/// `Some` persists the new quota (and usage event); `None` leaves the row as is.
pub type QuotaMutation<'a> =
    Box<dyn FnOnce(&Quota, Option<&BudgetSettings>) -> Result<Option<QuotaWrite>> + Send + 'a>;

/// Result of a [`QuotaMutation`] that should be persisted.
#[derive(Debug, Clone)]
pub struct QuotaWrite {
    /// New quota row.
    pub quota: Quota,
    /// Ledger entry for the consume.
    pub event: Option<UsageEvent>,
}

/// Hit counts inside a rate window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCount {
    /// Events from the IP.
    pub by_ip: i64,
    /// Events from the session.
    pub by_session: i64,
}

/// Paged, filtered read of access events.
#[derive(Debug, Clone)]
pub struct EventQuery {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    /// Event types; empty means all.
    pub event_types: Vec<AccessEventType>,
    /// Rows to skip.
    pub offset: i64,
    /// Page size.
    pub limit: i64,
}

/// Paged read over a time range.
#[derive(Debug, Clone, Copy)]
pub struct RangePage {
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    /// Rows to skip.
    pub offset: i64,
    /// Page size.
    pub limit: i64,
}

impl RangePage {
    /// Unbounded range.
    pub fn all(offset: i64, limit: i64) -> Self {
        Self {
            from: None,
            to: None,
            offset,
            limit,
        }
    }
}

/// Produced artifact of an export job.
#[derive(Debug, Clone)]
pub struct ExportArtifact {
    /// Object-store path.
    pub file_path: String,
    /// Download file name.
    pub file_name: String,
    /// Size in bytes.
    pub file_size: i64,
    /// Records written.
    pub record_count: i64,
}

/// Persistent storage for the gateway.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ---- workspaces ----

    /// Insert a workspace and its owner member row atomically.
    async fn create_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// Live workspace by id.
    async fn get_workspace(&self, id: Uuid) -> Result<Option<Workspace>>;

    /// Live workspace by slug.
    async fn get_workspace_by_slug(&self, slug: &str) -> Result<Option<Workspace>>;

    /// Persist access settings and name of a workspace.
    async fn update_workspace(&self, workspace: &Workspace) -> Result<()>;

    /// Move a live workspace to `pending_delete`.
    async fn schedule_workspace_deletion(
        &self,
        id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Workspaces pending deletion whose deadline passed.
    async fn workspaces_due_for_purge(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>>;

    /// Delete all owned rows and mark the workspace purged.
    async fn purge_workspace(&self, id: Uuid, now: DateTime<Utc>) -> Result<()>;

    // ---- versions ----

    /// Write the next version and make it current.
    async fn publish_version(
        &self,
        workspace_id: Uuid,
        version: &NewVersion,
        created_by: Uuid,
        now: DateTime<Utc>,
    ) -> Result<WorkspaceVersion>;

    /// Version by id.
    async fn get_version(&self, id: Uuid) -> Result<Option<WorkspaceVersion>>;

    /// All versions of a workspace, oldest first.
    async fn list_versions(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceVersion>>;

    // ---- members ----

    /// Insert or replace a member row.
    async fn upsert_member(&self, member: &WorkspaceMember) -> Result<()>;

    /// Member row.
    async fn get_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<WorkspaceMember>>;

    /// All members.
    async fn list_members(&self, workspace_id: Uuid) -> Result<Vec<WorkspaceMember>>;

    /// Remove a member. Returns whether a row was deleted.
    async fn remove_member(&self, workspace_id: Uuid, user_id: Uuid) -> Result<bool>;

    // ---- domains ----

    /// Insert or replace a domain binding.
    async fn upsert_domain(&self, binding: &DomainBinding) -> Result<()>;

    /// Binding for a lowercase host.
    async fn get_domain(&self, domain: &str) -> Result<Option<DomainBinding>>;

    /// Bindings of a workspace.
    async fn list_domains(&self, workspace_id: Uuid) -> Result<Vec<DomainBinding>>;

    // ---- sessions ----

    /// Insert a session.
    async fn insert_session(&self, session: &Session) -> Result<()>;

    /// Session by id.
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>>;

    /// Refresh activity and expiry.
    async fn touch_session(
        &self,
        id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Block a session until `until`.
    async fn block_session(&self, id: Uuid, reason: &str, until: Option<DateTime<Utc>>) -> Result<()>;

    /// Lift a block.
    async fn unblock_session(&self, id: Uuid) -> Result<()>;

    /// Delete sessions past their expiry.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64>;

    // ---- access events and bans ----

    /// Append an access event.
    async fn insert_access_event(&self, event: &NewAccessEvent) -> Result<()>;

    /// Count inbound hits (entry, schema, execute) by IP and by session since `since`.
    async fn count_access_events(
        &self,
        workspace_id: Uuid,
        ip: &str,
        session_id: Option<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<AccessCount>;

    /// Paged access events in occurrence order.
    async fn list_access_events(&self, query: &EventQuery) -> Result<Vec<AccessEvent>>;

    /// Delete events older than `cutoff`.
    async fn delete_access_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Insert or replace a ban.
    async fn upsert_ban(&self, ban: &Ban) -> Result<()>;

    /// Ban in force for the subject at `now`.
    async fn active_ban(
        &self,
        workspace_id: Uuid,
        kind: BanKind,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Ban>>;

    // ---- billing ----

    /// Quota row for a period.
    async fn get_quota(&self, workspace_id: Uuid, period_start: DateTime<Utc>) -> Result<Option<Quota>>;

    /// All quota rows of a workspace.
    async fn list_quotas(&self, workspace_id: Uuid) -> Result<Vec<Quota>>;

    /// Read-modify-write of the period's quota under the workspace write lock.
    ///
    /// `initial` is inserted when the period has no row yet. Returns the row
    /// as it stands after the transaction.
    async fn update_quota(&self, initial: &Quota, mutate: QuotaMutation<'_>) -> Result<Quota>;

    /// Budget settings.
    async fn get_budget(&self, workspace_id: Uuid) -> Result<Option<BudgetSettings>>;

    /// Insert or replace budget settings.
    async fn put_budget(&self, budget: &BudgetSettings) -> Result<()>;

    /// Usage ledger page, newest last.
    async fn list_usage_events(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<UsageEvent>>;

    // ---- executions ----

    /// Record a handoff.
    async fn insert_execution(&self, execution: &RuntimeExecution) -> Result<()>;

    /// Paged executions in creation order.
    async fn list_executions(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<RuntimeExecution>>;

    // ---- exports ----

    /// Insert a job.
    async fn insert_export_job(&self, job: &ExportJob) -> Result<()>;

    /// Job by id.
    async fn get_export_job(&self, id: Uuid) -> Result<Option<ExportJob>>;

    /// Jobs of a workspace of the given kinds, newest first.
    async fn list_export_jobs(
        &self,
        workspace_id: Uuid,
        kinds: &[ExportKind],
        limit: i64,
    ) -> Result<Vec<ExportJob>>;

    /// Move a queued or running job to running.
    async fn start_export_job(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Record the artifact and complete the job.
    async fn complete_export_job(
        &self,
        id: Uuid,
        artifact: &ExportArtifact,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Fail a job.
    async fn fail_export_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Reset a failed job to queued for an admin replay.
    async fn requeue_export_job(&self, id: Uuid) -> Result<bool>;

    /// Completed jobs past retention.
    async fn expired_export_jobs(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExportJob>>;

    /// Mark a completed job expired.
    async fn mark_export_expired(&self, id: Uuid) -> Result<()>;

    /// Delete a job row.
    async fn delete_export_job(&self, id: Uuid) -> Result<bool>;

    // ---- export subscriptions ----

    /// Insert a subscription.
    async fn insert_subscription(&self, subscription: &ExportSubscription) -> Result<()>;

    /// Subscriptions of a workspace.
    async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<ExportSubscription>>;

    /// Delete a subscription.
    async fn delete_subscription(&self, workspace_id: Uuid, id: Uuid) -> Result<bool>;

    /// Active subscriptions due at `now`.
    async fn due_subscriptions(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ExportSubscription>>;

    /// Record a scheduler run.
    async fn advance_subscription(
        &self,
        id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    ) -> Result<()>;

    // ---- task queue ----

    /// Insert a task unless one with the same id exists. Returns whether it was inserted.
    async fn enqueue_task(&self, task: &TaskEntry) -> Result<bool>;

    /// Lease the oldest available task of a queue.
    ///
    /// Pending tasks whose `available_at` passed and in-flight tasks whose
    /// lease expired are both claimable. The claim increments `attempts`.
    async fn claim_task(
        &self,
        queue_name: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<TaskEntry>>;

    /// Task by id.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskEntry>>;

    /// Ack a successful run.
    async fn complete_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<()>;

    /// Return a task to pending after a retryable failure.
    async fn release_task(
        &self,
        task_id: Uuid,
        error: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Dead-letter a task.
    async fn bury_task(&self, task_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Dead tasks, optionally of one queue, oldest first.
    async fn list_dead_tasks(&self, queue_name: Option<&str>, offset: i64, limit: i64) -> Result<Vec<TaskEntry>>;

    /// Move a dead task back to pending with attempts reset.
    async fn revive_task(&self, task_id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Delete a dead task.
    async fn delete_dead_task(&self, task_id: Uuid) -> Result<bool>;

    // ---- audit ----

    /// Append an audit entry; an existing id is ignored.
    async fn insert_audit(&self, entry: &AuditEntry) -> Result<()>;

    /// Paged audit entries in occurrence order.
    async fn list_audit(&self, workspace_id: Uuid, page: RangePage) -> Result<Vec<AuditEntry>>;

    // ---- idempotency ----

    /// Reserve an idempotency key.
    ///
    /// Returns `None` when the key was free (or expired) and is now held by
    /// the caller; otherwise the existing record.
    async fn begin_idempotency(
        &self,
        scope: &str,
        key: &str,
        request_hash: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Store the final response of a held key.
    async fn complete_idempotency(
        &self,
        scope: &str,
        key: &str,
        status: u16,
        headers: &BTreeMap<String, String>,
        body: &str,
    ) -> Result<()>;

    /// Drop a held key so the request can be retried.
    async fn release_idempotency(&self, scope: &str, key: &str) -> Result<()>;

    /// Delete expired idempotency records.
    async fn delete_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64>;

    // ---- health ----

    /// Round-trip to the database.
    async fn ping(&self) -> Result<()>;
}
