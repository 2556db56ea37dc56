// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Records persisted by the entity store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// Implements `TryFrom<String>` so text columns decode through `#[sqlx(try_from = "String")]`.
macro_rules! text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = strum::ParseError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )+
    };
}

/// Billing plan of a workspace.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Plan {
    /// Free tier, hard caps.
    Free,
    /// Paid tier, overage charged.
    Pro,
    /// Contract tier, unlimited.
    Enterprise,
}

/// Who may invoke a workspace's runtime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessMode {
    /// Owner only.
    Private,
    /// Owner and members.
    WorkspaceMembers,
    /// Any authenticated user.
    Authenticated,
    /// Anyone, tracked through anonymous sessions.
    PublicAnonymous,
}

/// Sensitivity of the data a workspace handles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataClassification {
    /// No extra requirement.
    Public,
    /// Requires an authenticated caller.
    Internal,
    /// Requires the owner or a member.
    Confidential,
    /// Requires the owner or an admin member.
    Restricted,
}

/// Soft-delete stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeleteStage {
    /// Live.
    Active,
    /// Hidden, purged after the deadline.
    PendingDelete,
    /// Owned rows removed.
    Purged,
}

/// Per-workspace rate-limit document.
///
/// `requests_per_minute` is accepted as an alias of `soft_limit`. When
/// `hard_limit` is absent it is `soft_limit + burst`, or twice the soft limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in seconds.
    #[serde(alias = "window")]
    pub window_seconds: Option<u64>,
    /// Hits per window before CAPTCHA is required.
    #[serde(alias = "requests_per_minute", alias = "max_requests")]
    pub soft_limit: Option<u32>,
    /// Hits per window before requests are refused.
    pub hard_limit: Option<u32>,
    /// Extra hits between soft and hard.
    pub burst: Option<u32>,
    /// IPs refused outright.
    #[serde(alias = "blacklist", alias = "denylist")]
    pub blocked_ips: Vec<String>,
    /// IPs with tightened thresholds and mandatory CAPTCHA.
    pub graylist: Vec<String>,
}

/// Tenant boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    /// Unique id.
    pub id: Uuid,
    /// Unique lowercase slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Owner user id.
    pub owner_user_id: Uuid,
    /// Billing plan.
    #[sqlx(try_from = "String")]
    pub plan: Plan,
    /// Region code.
    pub region: String,
    /// Runtime access mode.
    #[sqlx(try_from = "String")]
    pub access_mode: AccessMode,
    /// Data classification.
    #[sqlx(try_from = "String")]
    pub data_classification: DataClassification,
    /// Rate-limit document.
    #[sqlx(json)]
    pub rate_limit: RateLimitConfig,
    /// Allowed origin host patterns.
    #[sqlx(json)]
    pub allowed_origins: Vec<String>,
    /// Always require CAPTCHA.
    pub require_captcha: bool,
    /// Soft-delete stage.
    #[sqlx(try_from = "String")]
    pub delete_stage: DeleteStage,
    /// Purge deadline once pending deletion.
    pub delete_deadline: Option<DateTime<Utc>>,
    /// Published version.
    pub current_version_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of a workspace's runtime assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceVersion {
    /// Unique id.
    pub id: Uuid,
    /// Owning workspace.
    pub workspace_id: Uuid,
    /// Monotonic number within the workspace.
    pub version: i64,
    /// Raw UI schema document.
    #[sqlx(json)]
    pub ui_schema: Value,
    /// DB schema document.
    #[sqlx(json)]
    pub db_schema: Value,
    /// Config document.
    #[sqlx(json)]
    pub config: Value,
    /// Bound workflow.
    pub workflow_id: Option<Uuid>,
    /// Release notes.
    pub changelog: Option<String>,
    /// Publisher.
    pub created_by: Uuid,
    /// Publish time.
    pub created_at: DateTime<Utc>,
}

/// Input for publishing a version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewVersion {
    /// Raw UI schema document.
    #[serde(default)]
    pub ui_schema: Value,
    /// DB schema document.
    #[serde(default)]
    pub db_schema: Value,
    /// Config document.
    #[serde(default)]
    pub config: Value,
    /// Bound workflow.
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    /// Release notes.
    #[serde(default)]
    pub changelog: Option<String>,
}

/// Permission bits carried by member roles.
pub mod permissions {
    /// Read workspace data.
    pub const READ: i64 = 1;
    /// Modify workspace settings and publish versions.
    pub const WRITE: i64 = 1 << 1;
    /// Manage members and domains.
    pub const ADMIN: i64 = 1 << 2;
    /// Manage budget and consume usage.
    pub const BILLING: i64 = 1 << 3;
    /// Request and download exports.
    pub const EXPORT: i64 = 1 << 4;
    /// Every bit.
    pub const ALL: i64 = READ | WRITE | ADMIN | BILLING | EXPORT;
}

/// Workspace role.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemberRole {
    /// Workspace owner.
    Owner,
    /// Administrator.
    Admin,
    /// Editor.
    Editor,
    /// Read-only viewer.
    Viewer,
}

impl MemberRole {
    /// Permission bitset materialised for the role.
    pub fn permissions(self) -> i64 {
        use permissions::*;
        match self {
            Self::Owner => ALL,
            Self::Admin => ALL,
            Self::Editor => READ | WRITE | EXPORT,
            Self::Viewer => READ,
        }
    }
}

/// Membership row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkspaceMember {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Member.
    pub user_id: Uuid,
    /// Role.
    #[sqlx(try_from = "String")]
    pub role: MemberRole,
    /// Permission bitset.
    pub permissions: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl WorkspaceMember {
    /// Whether the member holds every bit of `mask`.
    pub fn has(&self, mask: i64) -> bool {
        self.permissions & mask == mask
    }
}

/// Custom domain binding status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainStatus {
    /// Awaiting verification.
    Pending,
    /// Serving traffic.
    Active,
    /// Refused.
    Blocked,
}

/// Custom domain binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DomainBinding {
    /// Lowercase host name.
    pub domain: String,
    /// Bound workspace.
    pub workspace_id: Uuid,
    /// Binding status.
    #[sqlx(try_from = "String")]
    pub status: DomainStatus,
    /// DNS ownership verified.
    pub verified: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Session state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Usable.
    Active,
    /// Refused until the cooldown ends.
    Blocked,
}

/// Per-workspace caller handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    /// Unique id.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Authenticated user, if any.
    pub user_id: Option<Uuid>,
    /// IP of the first request.
    pub first_seen_ip: String,
    /// IP of the latest request.
    pub last_seen_ip: String,
    /// SHA-256 of the user agent.
    pub user_agent_hash: String,
    /// State.
    #[sqlx(try_from = "String")]
    pub state: SessionState,
    /// Why the session was blocked.
    pub blocked_reason: Option<String>,
    /// End of the block cooldown.
    pub blocked_until: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Latest access.
    pub last_active_at: DateTime<Utc>,
    /// Inactivity expiry.
    pub expires_at: DateTime<Utc>,
}

/// Runtime event type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AccessEventType {
    /// Runtime entry.
    Entry,
    /// Schema read.
    Schema,
    /// Execute attempt.
    Execute,
    /// Handoff failed.
    ExecuteFailed,
    /// Handoff succeeded.
    ExecuteSuccess,
}

/// Immutable runtime hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessEvent {
    /// Row id.
    pub id: i64,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Session, if attributed.
    pub session_id: Option<Uuid>,
    /// Client IP.
    pub ip: String,
    /// Event type.
    #[sqlx(try_from = "String")]
    pub event_type: AccessEventType,
    /// Request path.
    pub path: String,
    /// Whether a CAPTCHA token accompanied the request.
    pub captcha_provided: bool,
    /// Event time.
    pub occurred_at: DateTime<Utc>,
}

/// Event to append.
#[derive(Debug, Clone)]
pub struct NewAccessEvent {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Session, if attributed.
    pub session_id: Option<Uuid>,
    /// Client IP.
    pub ip: String,
    /// Event type.
    pub event_type: AccessEventType,
    /// Request path.
    pub path: String,
    /// Whether a CAPTCHA token accompanied the request.
    pub captcha_provided: bool,
    /// Event time.
    pub occurred_at: DateTime<Utc>,
}

/// Subject of a ban.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BanKind {
    /// Client IP.
    Ip,
    /// Session id.
    Session,
}

/// Workspace-scoped ban.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ban {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Subject kind.
    #[sqlx(try_from = "String")]
    pub kind: BanKind,
    /// IP or session id.
    pub value: String,
    /// Reason.
    pub reason: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// End of the ban; permanent when absent.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-period usage accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Quota {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Period start (inclusive).
    pub period_start: DateTime<Utc>,
    /// Period end (exclusive).
    pub period_end: DateTime<Utc>,
    /// Plan the limits were taken from.
    #[sqlx(try_from = "String")]
    pub plan: Plan,
    /// Limit per dimension. Negative means unlimited.
    #[sqlx(json)]
    pub limits: BTreeMap<String, f64>,
    /// Usage per dimension.
    #[sqlx(json)]
    pub usage: BTreeMap<String, f64>,
    /// Period-to-date cost.
    pub cost_to_date: f64,
    /// Budget thresholds already alerted this period.
    #[sqlx(json)]
    pub alerted_thresholds: Vec<f64>,
    /// Spend limit reached; block-policy consumes are refused until rollover.
    pub spend_blocked: bool,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BudgetSettings {
    /// Workspace.
    pub workspace_id: Uuid,
    /// Monthly budget.
    pub monthly_budget: f64,
    /// Currency.
    pub currency: String,
    /// Ascending fractions in (0, 1].
    #[sqlx(json)]
    pub thresholds: Vec<f64>,
    /// Hard spend limit.
    pub spend_limit: Option<f64>,
    /// Whether the spend limit is enforced.
    pub spend_limit_enabled: bool,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Accepted consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    /// Unique id.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Consumed amounts.
    #[sqlx(json)]
    pub usage: BTreeMap<String, f64>,
    /// Cost delta.
    pub cost: f64,
    /// Currency.
    pub currency: String,
    /// Record time.
    pub recorded_at: DateTime<Utc>,
}

/// Execution handed off to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RuntimeExecution {
    /// Engine execution id.
    pub execution_id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Published version used.
    pub version_id: Uuid,
    /// Workflow.
    pub workflow_id: Uuid,
    /// Authenticated caller.
    pub user_id: Option<Uuid>,
    /// Session.
    pub session_id: Option<Uuid>,
    /// Trigger type.
    pub trigger_type: String,
    /// Status reported at handoff.
    pub status: String,
    /// Handoff time.
    pub created_at: DateTime<Utc>,
}

/// Export or archive kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportKind {
    /// All owned rows of a workspace.
    WorkspaceExport,
    /// Access events in a range.
    AnalyticsExport,
    /// Runtime executions in a range.
    ExecutionLogArchive,
    /// Audit entries in a range.
    AuditLogArchive,
}

impl ExportKind {
    /// Whether the artifact is a replayable log archive.
    pub fn is_archive(self) -> bool {
        matches!(self, Self::ExecutionLogArchive | Self::AuditLogArchive)
    }
}

/// Export job status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExportStatus {
    /// Waiting for a worker.
    Queued,
    /// Being produced.
    Running,
    /// Artifact available.
    Completed,
    /// Gave up.
    Failed,
    /// Artifact reaped.
    Expired,
}

/// Export or archive job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExportJob {
    /// Unique id, also the task id of its queue entry.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Kind.
    #[sqlx(try_from = "String")]
    pub kind: ExportKind,
    /// Status.
    #[sqlx(try_from = "String")]
    pub status: ExportStatus,
    /// Requesting user.
    pub requested_by: Uuid,
    /// Output format (`jsonl`, `csv`, `zip`).
    pub format: String,
    /// Kind-specific options.
    #[sqlx(json)]
    pub options: Value,
    /// Range start (inclusive).
    pub range_start: Option<DateTime<Utc>>,
    /// Range end (exclusive).
    pub range_end: Option<DateTime<Utc>>,
    /// Object-store path.
    pub file_path: Option<String>,
    /// Download file name.
    pub file_name: Option<String>,
    /// Artifact size in bytes.
    pub file_size: Option<i64>,
    /// Records written.
    pub record_count: Option<i64>,
    /// Failure message.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Start of the latest run.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// End of retention.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Scheduled analytics export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExportSubscription {
    /// Unique id.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Cron expression.
    pub cron: String,
    /// Output format.
    pub format: String,
    /// Event type filter; empty means all.
    #[sqlx(json)]
    pub event_types: Vec<String>,
    /// Creator, recorded as requester of spawned jobs.
    pub created_by: Uuid,
    /// Whether the scheduler considers it.
    pub active: bool,
    /// Last time a job was enqueued.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time.
    pub next_run_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Task state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskState {
    /// Claimable once `available_at` passes.
    Pending,
    /// Leased by a worker.
    InFlight,
    /// Done.
    Succeeded,
    /// Dead-lettered.
    Dead,
}

/// Durable queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskEntry {
    /// Unique id.
    pub task_id: Uuid,
    /// Queue (one per job kind).
    pub queue_name: String,
    /// Kind-specific payload.
    #[sqlx(json)]
    pub payload: Value,
    /// State.
    #[sqlx(try_from = "String")]
    pub state: TaskState,
    /// Claims so far.
    pub attempts: i64,
    /// Claims allowed before dead-lettering.
    pub max_attempts: i64,
    /// Earliest claim time.
    pub available_at: DateTime<Utc>,
    /// End of the current lease.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Latest failure.
    pub last_error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    /// Unique id; re-inserts with the same id are ignored.
    pub id: Uuid,
    /// Workspace.
    pub workspace_id: Uuid,
    /// Action name.
    pub action: String,
    /// Acting user.
    pub actor_user_id: Option<Uuid>,
    /// Target type.
    pub target_type: String,
    /// Target id.
    pub target_id: Option<String>,
    /// Free-form metadata.
    #[sqlx(json)]
    pub metadata: Value,
    /// Client IP at recording time.
    pub ip: String,
    /// User agent at recording time.
    pub user_agent: String,
    /// Event time.
    pub occurred_at: DateTime<Utc>,
}

/// Idempotency record state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IdempotencyState {
    /// First request still running.
    InProgress,
    /// Response stored.
    Completed,
}

/// Stored idempotent response.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IdempotencyRecord {
    /// Operation scope.
    pub scope: String,
    /// Client key.
    pub key: String,
    /// SHA-256 of the request.
    pub request_hash: String,
    /// State.
    #[sqlx(try_from = "String")]
    pub state: IdempotencyState,
    /// Stored status code.
    pub response_status: Option<i64>,
    /// Stored response body.
    pub response_body: Option<String>,
    /// Stored response headers, a JSON object of name to value.
    pub response_headers: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Headers to replay with the stored response. Unreadable values yield none.
    pub fn stored_headers(&self) -> BTreeMap<String, String> {
        self.response_headers
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

text_enum!(
    Plan,
    AccessMode,
    DataClassification,
    DeleteStage,
    MemberRole,
    DomainStatus,
    SessionState,
    AccessEventType,
    BanKind,
    ExportKind,
    ExportStatus,
    TaskState,
    IdempotencyState,
);
