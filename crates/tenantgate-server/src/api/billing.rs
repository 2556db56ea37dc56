// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Billing endpoints: consume, quota, budget, estimate and the catalog.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;

use tenantgate_core::billing::BudgetInput;
use tenantgate_core::store::permissions::{BILLING, READ};
use tenantgate_core::store::{Plan, RangePage};

use super::extract::{Ctx, json_body};
use super::idempotency::idempotent;
use super::response::{ApiError, ApiResult, ok};
use super::workspaces::authorize;
use crate::state::AppState;

const USAGE_PAGE_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
struct UsageBody {
    usage: BTreeMap<String, f64>,
}

/// `POST /workspaces/{id}/billing/consume`
///
/// A refusal is `403 quota_exceeded` or `403 spend_limit`; usage is left
/// unchanged.
pub async fn consume(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, BILLING).await?;
    let input: UsageBody = json_body(&body)?;
    let operation = format!("consume:{}", workspace.id);
    idempotent(&state, &ctx, &operation, &body, || async {
        let result = state
            .billing
            .consume(&ctx, &workspace, &input.usage)
            .await?
            .into_allowed()?;
        Ok::<_, ApiError>(ok(result))
    })
    .await
}

/// `POST /workspaces/{id}/billing/estimate`
pub async fn estimate(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    let input: UsageBody = json_body(&body)?;
    Ok(ok(state.billing.estimate(&workspace, &input.usage).await?))
}

/// `GET /workspaces/{id}/billing/quota`
pub async fn quota(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    let quota = state.billing.quota_snapshot(&workspace).await?;
    let budget = state.billing.budget_summary(&workspace).await?;
    Ok(ok(json!({
        "plan": workspace.plan,
        "quota": quota,
        "budget": budget,
    })))
}

/// `GET /workspaces/{id}/billing/budget`
pub async fn get_budget(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    let settings = state.store.get_budget(workspace.id).await?;
    let summary = state.billing.budget_summary(&workspace).await?;
    Ok(ok(json!({ "settings": settings, "summary": summary })))
}

/// `PUT /workspaces/{id}/billing/budget`
pub async fn put_budget(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, BILLING).await?;
    let input: BudgetInput = json_body(&body)?;
    Ok(ok(state.billing.put_budget(&ctx, &workspace, input).await?))
}

/// `GET /workspaces/{id}/billing/usage`
pub async fn usage_events(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    Query(page): Query<BTreeMap<String, String>>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    let offset = page
        .get("offset")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0)
        .max(0);
    let limit = page
        .get("limit")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(USAGE_PAGE_LIMIT)
        .clamp(1, USAGE_PAGE_LIMIT);
    let events = state
        .store
        .list_usage_events(workspace.id, RangePage::all(offset, limit))
        .await?;
    Ok(ok(events))
}

/// `GET /billing/catalog`
pub async fn catalog(State(state): State<AppState>) -> Response {
    let catalog = state.billing.catalog();
    let dimensions: Vec<_> = catalog.dimensions().collect();
    let plans: Vec<_> = [Plan::Free, Plan::Pro, Plan::Enterprise]
        .into_iter()
        .map(|plan| catalog.plan_terms(plan))
        .collect();
    ok(json!({
        "currency": catalog.currency(),
        "dimensions": dimensions,
        "plans": plans,
    }))
}
