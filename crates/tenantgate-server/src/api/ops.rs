// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform operations: dead-letter queue and domain activation.
//!
//! Every route here requires a platform administrator token.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use tenantgate_core::Error;
use tenantgate_core::audit::AuditRecord;
use tenantgate_core::store::DomainStatus;

use super::extract::{Ctx, json_body, parse_id};
use super::response::{ApiResult, envelope_with_meta, ok};
use crate::state::AppState;

const DEAD_PAGE_LIMIT: i64 = 50;

fn require_admin(ctx: &Ctx) -> Result<(), Error> {
    if ctx.require_principal()?.is_admin {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

fn page_param(query: &BTreeMap<String, String>, name: &str, default: i64) -> Result<i64, Error> {
    match query.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("{name} '{raw}' is not a number"))),
        None => Ok(default),
    }
}

/// `GET /ops/dead-tasks?queue=&offset=&limit=`
pub async fn list_dead_tasks(
    State(state): State<AppState>,
    ctx: Ctx,
    Query(query): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    require_admin(&ctx)?;
    let offset = page_param(&query, "offset", 0)?;
    let limit = page_param(&query, "limit", DEAD_PAGE_LIMIT)?;
    let queue = query.get("queue").map(String::as_str).filter(|q| !q.is_empty());
    let tasks = state.exports.list_dead(queue, offset, limit).await?;
    let count = tasks.len();
    Ok(axum::Json(envelope_with_meta(
        tasks,
        json!({ "count": count, "offset": offset.max(0), "limit": limit }),
    ))
    .into_response())
}

/// `POST /ops/dead-tasks/{task_id}/retry`
pub async fn retry_dead_task(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&ctx)?;
    let task_id = parse_id(&task_id, "task id")?;
    Ok(ok(state.exports.retry_dead(&ctx, task_id).await?))
}

/// `DELETE /ops/dead-tasks/{task_id}`
pub async fn delete_dead_task(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(task_id): Path<String>,
) -> ApiResult<Response> {
    require_admin(&ctx)?;
    let task_id = parse_id(&task_id, "task id")?;
    state.exports.delete_dead(task_id).await?;
    Ok(ok(json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
struct DomainUpdate {
    status: DomainStatus,
    #[serde(default)]
    verified: Option<bool>,
}

/// `PUT /ops/domains/{domain}`
///
/// Records the outcome of ownership verification for a binding.
pub async fn update_domain(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(domain): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    require_admin(&ctx)?;
    let update: DomainUpdate = json_body(&body)?;
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let mut binding = state
        .store
        .get_domain(&domain)
        .await?
        .ok_or(Error::DomainNotFound)?;

    binding.status = update.status;
    binding.verified = update
        .verified
        .unwrap_or(binding.verified || update.status == DomainStatus::Active);
    binding.updated_at = tenantgate_core::time::now();
    state.store.upsert_domain(&binding).await?;

    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(binding.workspace_id, "domain_status_changed", "domain")
                .target(&binding.domain)
                .metadata(json!({ "status": binding.status, "verified": binding.verified })),
        )
        .await;
    info!(domain = %binding.domain, status = %binding.status, "Domain binding updated");
    Ok(ok(binding))
}
