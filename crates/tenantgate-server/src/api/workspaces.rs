// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace management: workspaces, versions, domains and members.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::Response;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use tenantgate_core::audit::AuditRecord;
use tenantgate_core::store::permissions::{ADMIN, READ, WRITE};
use tenantgate_core::store::{
    AccessMode, DataClassification, DeleteStage, DomainBinding, DomainStatus, MemberRole,
    NewVersion, Plan, RangePage, RateLimitConfig, Workspace, WorkspaceMember,
};
use tenantgate_core::{Error, time, ui_schema};

use super::extract::{Ctx, json_body, parse_id};
use super::idempotency::idempotent;
use super::response::{ApiError, ApiResult, created, ok};
use crate::state::AppState;

/// Days between a delete request and the purge.
const DELETION_GRACE_DAYS: i64 = 30;

const DEFAULT_REGION: &str = "eu";

const AUDIT_PAGE_LIMIT: i64 = 200;

/// Load a workspace the caller holds `mask` on.
///
/// Platform admins and the owner hold every permission.
pub async fn authorize(
    state: &AppState,
    ctx: &Ctx,
    workspace_id: &str,
    mask: i64,
) -> Result<Workspace, Error> {
    let principal = ctx.require_principal()?;
    let id = parse_id(workspace_id, "workspace id")?;
    let workspace = state
        .store
        .get_workspace(id)
        .await?
        .ok_or(Error::WorkspaceNotFound)?;
    if principal.is_admin || workspace.owner_user_id == principal.user_id {
        return Ok(workspace);
    }
    match state.store.get_member(id, principal.user_id).await? {
        Some(member) if member.has(mask) => Ok(workspace),
        _ => Err(Error::Unauthorized),
    }
}

fn validate_slug(slug: &str) -> Result<String, Error> {
    let slug = slug.trim().to_ascii_lowercase();
    let valid = (3..=63).contains(&slug.len())
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !slug.starts_with('-')
        && !slug.ends_with('-');
    if !valid {
        return Err(Error::InvalidRequest(format!(
            "slug '{slug}' must be 3-63 characters of a-z, 0-9 and inner '-'"
        )));
    }
    Ok(slug)
}

fn normalize_domain(raw: &str) -> Result<String, Error> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && domain.contains('.')
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        });
    if !valid {
        return Err(Error::InvalidRequest(format!("'{raw}' is not a host name")));
    }
    Ok(domain)
}

#[derive(Debug, Deserialize)]
struct CreateWorkspace {
    slug: String,
    name: String,
    #[serde(default)]
    plan: Option<Plan>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    access_mode: Option<AccessMode>,
    #[serde(default)]
    data_classification: Option<DataClassification>,
    #[serde(default)]
    rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    allowed_origins: Vec<String>,
    #[serde(default)]
    require_captcha: bool,
}

/// `POST /workspaces`
pub async fn create_workspace(State(state): State<AppState>, ctx: Ctx, body: Bytes) -> ApiResult<Response> {
    let owner = ctx.require_principal()?.user_id;
    let input: CreateWorkspace = json_body(&body)?;
    let slug = validate_slug(&input.slug)?;
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::InvalidRequest("name must not be empty".to_string()).into());
    }

    idempotent(&state, &ctx, "create_workspace", &body, || async {
        if state.store.get_workspace_by_slug(&slug).await?.is_some() {
            return Err(Error::InvalidState(format!("slug '{slug}' is taken")).into());
        }
        let now = time::now();
        let workspace = Workspace {
            id: Uuid::new_v4(),
            slug,
            name,
            owner_user_id: owner,
            plan: input.plan.unwrap_or(Plan::Free),
            region: input.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            access_mode: input.access_mode.unwrap_or(AccessMode::Private),
            data_classification: input.data_classification.unwrap_or(DataClassification::Internal),
            rate_limit: input.rate_limit.unwrap_or_default(),
            allowed_origins: input.allowed_origins,
            require_captcha: input.require_captcha,
            delete_stage: DeleteStage::Active,
            delete_deadline: None,
            current_version_id: None,
            created_at: now,
            updated_at: now,
        };
        state.store.create_workspace(&workspace).await?;
        state
            .audit
            .record(
                &ctx,
                AuditRecord::new(workspace.id, "workspace_created", "workspace")
                    .target(workspace.id)
                    .metadata(json!({ "slug": workspace.slug, "plan": workspace.plan })),
            )
            .await;
        info!(workspace_id = %workspace.id, slug = %workspace.slug, "Workspace created");
        Ok::<_, ApiError>(created(workspace))
    })
    .await
}

/// `GET /workspaces/{id}`
pub async fn get_workspace(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    Ok(ok(workspace))
}

/// `DELETE /workspaces/{id}`
///
/// Schedules the purge; the maintenance worker removes the data once the
/// grace period ends.
pub async fn delete_workspace(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let principal = ctx.require_principal()?;
    let workspace = authorize(&state, &ctx, &id, ADMIN).await?;
    if !principal.is_admin && workspace.owner_user_id != principal.user_id {
        return Err(Error::Unauthorized.into());
    }
    let now = time::now();
    let deadline = now + TimeDelta::days(DELETION_GRACE_DAYS);
    if !state
        .store
        .schedule_workspace_deletion(workspace.id, deadline, now)
        .await?
    {
        return Err(Error::WorkspaceNotFound.into());
    }
    state.dispatcher.vm_pool().invalidate(workspace.id).await;
    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "workspace_delete_scheduled", "workspace")
                .target(workspace.id)
                .metadata(json!({ "delete_deadline": deadline })),
        )
        .await;
    Ok(ok(json!({
        "id": workspace.id,
        "delete_stage": DeleteStage::PendingDelete,
        "delete_deadline": deadline,
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccessUpdate {
    access_mode: Option<AccessMode>,
    data_classification: Option<DataClassification>,
    rate_limit: Option<RateLimitConfig>,
    allowed_origins: Option<Vec<String>>,
    require_captcha: Option<bool>,
}

/// `PUT /workspaces/{id}/access`
pub async fn update_access(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let mut workspace = authorize(&state, &ctx, &id, WRITE).await?;
    let update: AccessUpdate = json_body(&body)?;

    if let Some(mode) = update.access_mode {
        workspace.access_mode = mode;
    }
    if let Some(classification) = update.data_classification {
        workspace.data_classification = classification;
    }
    if let Some(rate_limit) = update.rate_limit {
        workspace.rate_limit = rate_limit;
    }
    if let Some(origins) = update.allowed_origins {
        workspace.allowed_origins = origins
            .into_iter()
            .map(|o| o.trim().to_ascii_lowercase())
            .filter(|o| !o.is_empty())
            .collect();
    }
    if let Some(require) = update.require_captcha {
        workspace.require_captcha = require;
    }
    workspace.updated_at = time::now();
    state.store.update_workspace(&workspace).await?;

    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "access_updated", "workspace")
                .target(workspace.id)
                .metadata(json!({
                    "access_mode": workspace.access_mode,
                    "data_classification": workspace.data_classification,
                    "require_captcha": workspace.require_captcha,
                })),
        )
        .await;
    Ok(ok(workspace))
}

/// `GET /workspaces/{id}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    Ok(ok(state.store.list_versions(workspace.id).await?))
}

/// `POST /workspaces/{id}/versions`
///
/// The new version becomes current; the workspace's isolate is dropped so
/// the next VM request loads the new app code.
pub async fn publish_version(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, WRITE).await?;
    let publisher = ctx.require_principal()?.user_id;
    let input: NewVersion = json_body(&body)?;
    ui_schema::normalize(&input.ui_schema)?;

    let version = state
        .store
        .publish_version(workspace.id, &input, publisher, time::now())
        .await?;
    let dropped = state.dispatcher.vm_pool().invalidate(workspace.id).await;

    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "version_published", "workspace_version")
                .target(version.id)
                .metadata(json!({ "version": version.version, "changelog": input.changelog })),
        )
        .await;
    info!(
        workspace_id = %workspace.id,
        version = version.version,
        isolate_dropped = dropped,
        "Version published"
    );
    Ok(created(version))
}

#[derive(Debug, Deserialize)]
struct BindDomain {
    domain: String,
}

/// `GET /workspaces/{id}/domains`
pub async fn list_domains(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    Ok(ok(state.store.list_domains(workspace.id).await?))
}

/// `POST /workspaces/{id}/domains`
///
/// New bindings start `pending` and unverified; they serve traffic once an
/// operator activates them.
pub async fn bind_domain(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, ADMIN).await?;
    let input: BindDomain = json_body(&body)?;
    let domain = normalize_domain(&input.domain)?;
    if state.dispatcher.is_base_host(&domain) {
        return Err(Error::InvalidRequest(format!("'{domain}' is a platform host")).into());
    }

    if let Some(existing) = state.store.get_domain(&domain).await? {
        if existing.workspace_id != workspace.id {
            return Err(Error::InvalidState(format!("domain '{domain}' is bound to another workspace")).into());
        }
        return Ok(ok(existing));
    }

    let now = time::now();
    let binding = DomainBinding {
        domain,
        workspace_id: workspace.id,
        status: DomainStatus::Pending,
        verified: false,
        created_at: now,
        updated_at: now,
    };
    state.store.upsert_domain(&binding).await?;
    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "domain_bound", "domain").target(&binding.domain),
        )
        .await;
    Ok(created(binding))
}

#[derive(Debug, Deserialize)]
struct AddMember {
    user_id: Uuid,
    role: MemberRole,
}

/// `GET /workspaces/{id}/members`
pub async fn list_members(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, READ).await?;
    Ok(ok(state.store.list_members(workspace.id).await?))
}

/// `POST /workspaces/{id}/members`
pub async fn add_member(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, ADMIN).await?;
    let input: AddMember = json_body(&body)?;
    if input.role == MemberRole::Owner || input.user_id == workspace.owner_user_id {
        return Err(Error::InvalidRequest("ownership cannot be assigned through membership".to_string()).into());
    }

    let member = WorkspaceMember {
        workspace_id: workspace.id,
        user_id: input.user_id,
        role: input.role,
        permissions: input.role.permissions(),
        created_at: time::now(),
    };
    state.store.upsert_member(&member).await?;
    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "member_added", "member")
                .target(member.user_id)
                .metadata(json!({ "role": member.role })),
        )
        .await;
    Ok(created(member))
}

/// `DELETE /workspaces/{id}/members/{user_id}`
pub async fn remove_member(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, ADMIN).await?;
    let user_id = parse_id(&user_id, "user id")?;
    if user_id == workspace.owner_user_id {
        return Err(Error::InvalidState("the owner cannot be removed".to_string()).into());
    }
    if !state.store.remove_member(workspace.id, user_id).await? {
        return Err(Error::not_found("member", user_id).into());
    }
    state
        .audit
        .record(
            &ctx,
            AuditRecord::new(workspace.id, "member_removed", "member").target(user_id),
        )
        .await;
    Ok(ok(json!({ "removed": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    offset: i64,
    limit: Option<i64>,
}

/// `GET /workspaces/{id}/audit-logs`
pub async fn list_audit(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Response> {
    let workspace = authorize(&state, &ctx, &id, ADMIN).await?;
    let page = RangePage {
        from: query.from,
        to: query.to,
        offset: query.offset.max(0),
        limit: query.limit.unwrap_or(AUDIT_PAGE_LIMIT).clamp(1, AUDIT_PAGE_LIMIT),
    };
    Ok(ok(state.store.list_audit(workspace.id, page).await?))
}
