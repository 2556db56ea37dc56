// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace exports, log archives and export subscriptions.

use std::collections::BTreeMap;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

use tenantgate_core::Error;
use tenantgate_core::jobs::ReplayQuery;
use tenantgate_core::jobs::service::{ExportRequest, SubscriptionRequest};
use tenantgate_core::store::permissions::EXPORT;
use tenantgate_core::store::{ExportJob, ExportKind, ExportStatus};

use super::extract::{Ctx, json_body, parse_id};
use super::response::{ApiResult, created, envelope_with_meta, ok};
use super::workspaces::authorize;
use crate::state::AppState;

const EXPORT_KINDS: &[ExportKind] = &[ExportKind::WorkspaceExport, ExportKind::AnalyticsExport];
const ARCHIVE_KINDS: &[ExportKind] = &[ExportKind::ExecutionLogArchive, ExportKind::AuditLogArchive];
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Job as returned to clients.
#[derive(Serialize)]
struct JobView {
    #[serde(flatten)]
    job: ExportJob,
    #[serde(skip_serializing_if = "Option::is_none")]
    download_url: Option<String>,
}

impl JobView {
    fn new(job: ExportJob) -> Self {
        let download_url = (job.status == ExportStatus::Completed).then(|| {
            let collection = if job.kind.is_archive() { "log-archives" } else { "exports" };
            format!("/api/v1/workspaces/{}/{collection}/{}/download", job.workspace_id, job.id)
        });
        Self { job, download_url }
    }
}

fn export_kind(raw: Option<&str>) -> Result<ExportKind, Error> {
    match raw.map(str::trim).unwrap_or("workspace") {
        "workspace" | "workspace_export" => Ok(ExportKind::WorkspaceExport),
        "analytics" | "analytics_export" => Ok(ExportKind::AnalyticsExport),
        other => Err(Error::InvalidRequest(format!("unknown export_type '{other}'"))),
    }
}

fn archive_kind(raw: &str) -> Result<ExportKind, Error> {
    match raw.trim() {
        "execution_logs" | "executions" | "execution_log_archive" => Ok(ExportKind::ExecutionLogArchive),
        "audit_logs" | "audit" | "audit_log_archive" => Ok(ExportKind::AuditLogArchive),
        other => Err(Error::InvalidRequest(format!("unknown archive_type '{other}'"))),
    }
}

fn list_limit(query: &BTreeMap<String, String>) -> Result<i64, Error> {
    query
        .get("limit")
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| Error::InvalidRequest(format!("limit '{raw}' is not a number")))
        })
        .transpose()
        .map(|limit| limit.unwrap_or(DEFAULT_LIST_LIMIT))
}

fn query_time(query: &BTreeMap<String, String>, name: &str) -> Result<Option<DateTime<Utc>>, Error> {
    query
        .get(name)
        .map(|raw| raw.trim())
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| Error::InvalidRequest(format!("{name} '{raw}' is not an RFC 3339 time")))
        })
        .transpose()
}

/// Replay filters from the query string. Every parameter other than the
/// cursor and range keys is a field filter.
fn replay_query(mut query: BTreeMap<String, String>) -> Result<ReplayQuery, Error> {
    let from = query_time(&query, "from")?;
    let to = query_time(&query, "to")?;
    let offset = match query.get("offset") {
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| Error::InvalidRequest(format!("offset '{raw}' is not a number")))?
            .max(0),
        None => 0,
    };
    let limit = query
        .get("limit")
        .map(|raw| {
            raw.parse::<i64>()
                .map_err(|_| Error::InvalidRequest(format!("limit '{raw}' is not a number")))
        })
        .transpose()?;
    for key in ["from", "to", "offset", "limit", "dataset"] {
        query.remove(key);
    }
    query.retain(|_, v| !v.trim().is_empty());
    Ok(ReplayQuery {
        filters: query,
        from,
        to,
        offset,
        limit,
    })
}

/// Stream an artifact from disk.
fn attachment(download: tenantgate_core::jobs::service::Download) -> Response {
    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.file_name.replace(['"', '\\'], "_")
    );
    let mut response = Body::from_stream(ReaderStream::new(download.file)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(download.content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(download.size));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

async fn list_jobs(
    state: &AppState,
    ctx: &Ctx,
    workspace_id: &str,
    kinds: &[ExportKind],
    query: &BTreeMap<String, String>,
) -> ApiResult<Response> {
    let workspace = authorize(state, ctx, workspace_id, EXPORT).await?;
    let limit = list_limit(query)?;
    let jobs: Vec<JobView> = state
        .exports
        .list(workspace.id, kinds, limit)
        .await?
        .into_iter()
        .map(JobView::new)
        .collect();
    let count = jobs.len();
    Ok(axum::Json(envelope_with_meta(jobs, json!({ "count": count, "limit": limit }))).into_response())
}

async fn job_of_kind(
    state: &AppState,
    ctx: &Ctx,
    workspace_id: &str,
    job_id: &str,
    kinds: &[ExportKind],
) -> Result<(uuid::Uuid, ExportJob), Error> {
    let workspace = authorize(state, ctx, workspace_id, EXPORT).await?;
    let job_id = parse_id(job_id, "job id")?;
    let job = state.exports.get(workspace.id, job_id).await?;
    if !kinds.contains(&job.kind) {
        return Err(Error::not_found("export", job_id));
    }
    Ok((workspace.id, job))
}

// ---- exports ----

#[derive(Debug, Deserialize)]
struct NewExport {
    #[serde(default)]
    export_type: Option<String>,
    #[serde(flatten)]
    request: ExportRequest,
}

/// `POST /workspaces/{id}/exports`
pub async fn request_export(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, EXPORT).await?;
    let input: NewExport = json_body(&body)?;
    let kind = export_kind(input.export_type.as_deref())?;
    let job = state.exports.request(&ctx, &workspace, kind, input.request).await?;
    Ok(created(JobView::new(job)))
}

/// `GET /workspaces/{id}/exports`
pub async fn list_exports(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    list_jobs(&state, &ctx, &id, EXPORT_KINDS, &query).await
}

/// `GET /workspaces/{id}/exports/{export_id}`
pub async fn get_export(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, export_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (_, job) = job_of_kind(&state, &ctx, &id, &export_id, EXPORT_KINDS).await?;
    Ok(ok(JobView::new(job)))
}

/// `GET /workspaces/{id}/exports/{export_id}/download`
pub async fn download_export(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, export_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (workspace_id, job) = job_of_kind(&state, &ctx, &id, &export_id, EXPORT_KINDS).await?;
    Ok(attachment(state.exports.download(workspace_id, job.id).await?))
}

/// `DELETE /workspaces/{id}/exports/{export_id}`
pub async fn delete_export(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, export_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (workspace_id, job) = job_of_kind(&state, &ctx, &id, &export_id, EXPORT_KINDS).await?;
    state.exports.delete(&ctx, workspace_id, job.id).await?;
    Ok(ok(json!({ "deleted": true })))
}

// ---- log archives ----

#[derive(Debug, Deserialize)]
struct NewArchive {
    archive_type: String,
    #[serde(flatten)]
    request: ExportRequest,
}

/// `POST /workspaces/{id}/log-archives`
pub async fn request_archive(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, EXPORT).await?;
    let input: NewArchive = json_body(&body)?;
    let kind = archive_kind(&input.archive_type)?;
    let job = state.exports.request(&ctx, &workspace, kind, input.request).await?;
    Ok(created(JobView::new(job)))
}

/// `GET /workspaces/{id}/log-archives`
pub async fn list_archives(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    Query(query): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    list_jobs(&state, &ctx, &id, ARCHIVE_KINDS, &query).await
}

/// `GET /workspaces/{id}/log-archives/{archive_id}`
pub async fn get_archive(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, archive_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (_, job) = job_of_kind(&state, &ctx, &id, &archive_id, ARCHIVE_KINDS).await?;
    Ok(ok(JobView::new(job)))
}

/// `GET /workspaces/{id}/log-archives/{archive_id}/download`
pub async fn download_archive(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, archive_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (workspace_id, job) = job_of_kind(&state, &ctx, &id, &archive_id, ARCHIVE_KINDS).await?;
    Ok(attachment(state.exports.download(workspace_id, job.id).await?))
}

/// `GET /workspaces/{id}/log-archives/{archive_id}/replay`
pub async fn replay_archive(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, archive_id)): Path<(String, String)>,
    Query(query): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    let (workspace_id, job) = job_of_kind(&state, &ctx, &id, &archive_id, ARCHIVE_KINDS).await?;
    let query = replay_query(query)?;
    let page = state.exports.replay(workspace_id, job.id, &query).await?;
    Ok(ok(page))
}

/// `DELETE /workspaces/{id}/log-archives/{archive_id}`
pub async fn delete_archive(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, archive_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let (workspace_id, job) = job_of_kind(&state, &ctx, &id, &archive_id, ARCHIVE_KINDS).await?;
    state.exports.delete(&ctx, workspace_id, job.id).await?;
    Ok(ok(json!({ "deleted": true })))
}

// ---- subscriptions ----

/// `GET /workspaces/{id}/export-subscriptions`
pub async fn list_subscriptions(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, EXPORT).await?;
    Ok(ok(state.exports.list_subscriptions(workspace.id).await?))
}

/// `POST /workspaces/{id}/export-subscriptions`
pub async fn create_subscription(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, EXPORT).await?;
    let input: SubscriptionRequest = json_body(&body)?;
    let subscription = state.exports.create_subscription(&ctx, &workspace, input).await?;
    Ok(created(subscription))
}

/// `DELETE /workspaces/{id}/export-subscriptions/{subscription_id}`
pub async fn delete_subscription(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, subscription_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, EXPORT).await?;
    let subscription_id = parse_id(&subscription_id, "subscription id")?;
    state
        .exports
        .delete_subscription(&ctx, workspace.id, subscription_id)
        .await?;
    Ok(ok(json!({ "deleted": true })))
}
