// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime dispatcher.
//!
//! Resolves an inbound runtime request to a live workspace and its published
//! version, then composes the access controller, CAPTCHA, UI-schema engine
//! and billing engine before routing to the execution engine or the
//! workspace's VM isolate.
//!
//! Routing is decided by host: a request whose host is not one of the
//! deployment's base hosts is treated as a custom domain and resolved through
//! its domain binding; otherwise the slug path segment names the workspace.
//!
//! CAPTCHA handling differs per operation. Entry and schema reads only
//! signal the requirement through `access_policy.require_captcha` and verify
//! a token when one is presented. Execute and VM dispatch refuse without a
//! valid token, before any quota is consumed.
//!
//! The dispatcher never assigns transport status codes. It records the
//! resolved workspace on the [`RequestContext`] so the HTTP boundary can label
//! runtime metrics.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{AccessController, AccessRequest, AccessResult, Thresholds};
use crate::audit::{AuditRecord, AuditSink};
use crate::billing::BillingEngine;
use crate::billing::catalog::REQUESTS;
use crate::captcha::{self, CaptchaVerifier};
use crate::config::{Config, RuntimeSettings, Timeouts};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::execution::{DEFAULT_TRIGGER_TYPE, ExecutionHandoff, ExecutionRequest};
use crate::store::{
    AccessEventType, AccessMode, DataClassification, DomainStatus, NewAccessEvent, RuntimeExecution,
    Session, Store, Workspace, WorkspaceVersion,
};
use crate::ui_schema;
use crate::vm::{self, AppIdentity, VmPool, VmRequest, VmResponse};

/// Hosts that always count as base hosts.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Config keys never exposed through the schema endpoint.
const PRIVATE_CONFIG_KEYS: &[&str] = &["app_code"];

// ============================================================================
// Host resolution
// ============================================================================

/// Host a request was addressed to.
///
/// Prefers `X-Forwarded-Host`, then the `host=` pair of `Forwarded`, then
/// `Host`. Takes the first comma-separated value, strips the port and a
/// trailing dot, and lowercases.
pub fn request_host(
    x_forwarded_host: Option<&str>,
    forwarded: Option<&str>,
    host: Option<&str>,
) -> Option<String> {
    let raw = x_forwarded_host
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| forwarded.and_then(forwarded_host))
        .or_else(|| host.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string))?;
    clean_host(&raw)
}

/// `host=` value of the first element of a `Forwarded` header.
fn forwarded_host(value: &str) -> Option<String> {
    let first = value.split(',').next()?.trim();
    first.split(';').find_map(|pair| {
        let (key, val) = pair.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("host") {
            return None;
        }
        let host = val.trim().trim_matches('"').trim();
        (!host.is_empty()).then(|| host.to_string())
    })
}

fn clean_host(raw: &str) -> Option<String> {
    let first = raw.split(',').next()?.trim();
    let host = strip_port(first).trim().to_ascii_lowercase();
    let host = host.trim_end_matches('.');
    (!host.is_empty()).then(|| host.to_string())
}

fn strip_port(raw: &str) -> &str {
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split_once(']').map(|(h, _)| h).unwrap_or(rest);
    }
    match raw.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => raw,
    }
}

/// Host part of a configured base URL. Accepts bare host names too.
pub fn base_url_host(value: &str) -> Option<String> {
    let trimmed = value.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed
    } else {
        format!("http://{trimmed}")
    };
    let parsed = url::Url::parse(&with_scheme).ok()?;
    let host = parsed.host_str()?.trim_start_matches('[').trim_end_matches(']');
    clean_host(host)
}

/// Base hosts of a deployment: the primary and regional base URLs plus the
/// loopback names.
pub fn base_hosts<'a>(base_url: &'a str, regions: impl IntoIterator<Item = &'a String>) -> HashSet<String> {
    let mut hosts: HashSet<String> = std::iter::once(base_url)
        .chain(regions.into_iter().map(String::as_str))
        .filter_map(base_url_host)
        .collect();
    hosts.extend(LOCAL_HOSTS.iter().map(|h| h.to_string()));
    hosts
}

// ============================================================================
// Schema caching
// ============================================================================

/// Whether a `cache` query value asks for a cacheable schema.
pub fn cache_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y"))
}

/// Whether an `If-None-Match` header matches `etag`. Handles lists, `*`
/// and weak validators.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    let target = etag.trim().trim_matches('"');
    if if_none_match.trim().is_empty() || target.is_empty() {
        return false;
    }
    if_none_match.split(',').any(|candidate| {
        let candidate = candidate.trim();
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == target
    })
}

/// Strong ETag over the schema payload and the fields that change what the
/// payload means to a client.
/// ETag over the full response body plus the version and workspace stamps.
fn schema_etag(body: &SchemaBody, workspace: &Workspace, version: &WorkspaceVersion) -> Result<String> {
    let document = json!({
        "body": body,
        "workspace_id": workspace.id,
        "workspace_updated_at": workspace.updated_at,
        "access_mode": workspace.access_mode,
        "data_classification": workspace.data_classification,
        "version_id": version.id,
        "version_created_at": version.created_at,
    });
    let digest = Sha256::digest(serde_json::to_vec(&document)?);
    Ok(format!("\"{}\"", hex::encode(digest)))
}

fn cache_control(settings: &RuntimeSettings, cacheable: bool) -> String {
    let ttl = settings.schema_cache_ttl.as_secs();
    if !cacheable || ttl == 0 {
        return "no-store".to_string();
    }
    let mut value = format!("public, max-age={ttl}, s-maxage={ttl}");
    let stale = settings.schema_stale_ttl.as_secs();
    if stale > 0 {
        value.push_str(&format!(", stale-while-revalidate={stale}"));
    }
    value
}

// ============================================================================
// Request and response shapes
// ============================================================================

/// Transport-neutral description of a runtime request.
#[derive(Debug, Clone, Default)]
pub struct RuntimeCall {
    /// Resolved request host, see [`request_host`].
    pub host: Option<String>,
    /// Slug path segment.
    pub slug: String,
    /// Request path, recorded on access events.
    pub path: String,
    /// Presented session id.
    pub session_id: Option<Uuid>,
    /// `Origin` header.
    pub origin: Option<String>,
    /// CAPTCHA token from header or query.
    pub captcha_token: Option<String>,
}

/// Public view of a workspace on runtime responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeWorkspace {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub region: String,
    pub access_mode: AccessMode,
    pub data_classification: DataClassification,
    pub current_version_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Workspace> for RuntimeWorkspace {
    fn from(ws: &Workspace) -> Self {
        Self {
            id: ws.id,
            slug: ws.slug.clone(),
            name: ws.name.clone(),
            region: ws.region.clone(),
            access_mode: ws.access_mode,
            data_classification: ws.data_classification,
            current_version_id: ws.current_version_id,
            updated_at: ws.updated_at,
        }
    }
}

/// Effective rate thresholds, as shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RatePolicy {
    pub window_seconds: u64,
    pub soft_limit: u32,
    pub hard_limit: u32,
}

/// Access policy returned with every runtime response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessPolicy {
    pub access_mode: AccessMode,
    pub data_classification: DataClassification,
    pub rate_limit: RatePolicy,
    pub allowed_origins: Vec<String>,
    pub require_captcha: bool,
}

/// Response of the entry operation.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeEntry {
    pub workspace: RuntimeWorkspace,
    pub access_policy: AccessPolicy,
    pub session_id: Option<Uuid>,
}

/// Published version as served to runtime clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaPayload {
    pub ui_schema: Value,
    pub db_schema: Value,
    pub config: Value,
    pub version: i64,
    pub workflow_id: Option<Uuid>,
    pub version_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub changelog: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<Value>,
}

/// Body of a schema response.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaBody {
    #[serde(flatten)]
    pub entry: RuntimeEntry,
    pub schema: SchemaPayload,
}

/// Response of the schema operation, with cache directives.
#[derive(Debug, Clone)]
pub struct RuntimeSchema {
    pub body: SchemaBody,
    /// Set only on cacheable responses.
    pub etag: Option<String>,
    pub cache_control: String,
    /// The presented `If-None-Match` matched; answer without a body.
    pub not_modified: bool,
}

/// Body of an execute request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecuteBody {
    pub inputs: Value,
    pub trigger_type: Option<String>,
    pub captcha_token: Option<String>,
}

/// Response of the execute operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeExecuteResult {
    pub execution_id: Uuid,
    pub status: String,
    pub workflow_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub session_id: Option<Uuid>,
    pub message: String,
}

/// Request forwarded to a workspace isolate.
#[derive(Debug, Clone, Default)]
pub struct VmCall {
    pub method: String,
    /// Path below `/api`.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// End user resolved from an app-session token.
    pub user: Option<AppIdentity>,
}

/// Answer of a VM dispatch.
#[derive(Debug, Clone)]
pub struct VmDispatch {
    pub response: VmResponse,
    pub session_id: Option<Uuid>,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Collaborators composed by the [`Dispatcher`].
pub struct RuntimeServices {
    pub store: Arc<dyn Store>,
    pub access: Arc<AccessController>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub billing: Arc<BillingEngine>,
    pub handoff: Arc<dyn ExecutionHandoff>,
    pub vm: Arc<VmPool>,
    pub audit: AuditSink,
}

/// Runtime request path.
pub struct Dispatcher {
    services: RuntimeServices,
    settings: RuntimeSettings,
    timeouts: Timeouts,
    base_hosts: HashSet<String>,
}

/// Whether the captcha must be verified for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptchaMode {
    /// Verify when presented; a missing token is only signalled.
    Signal,
    /// A valid token is mandatory.
    Enforce,
}

impl Dispatcher {
    pub fn new(services: RuntimeServices, config: &Config) -> Self {
        Self {
            services,
            settings: config.runtime.clone(),
            timeouts: config.timeouts,
            base_hosts: config.base_hosts(),
        }
    }

    pub fn vm_pool(&self) -> &Arc<VmPool> {
        &self.services.vm
    }

    /// Whether `host` is served by slug rather than by domain binding.
    pub fn is_base_host(&self, host: &str) -> bool {
        self.base_hosts.contains(host)
    }

    /// Resolve the workspace a call points at.
    pub async fn resolve(&self, call: &RuntimeCall) -> Result<Workspace> {
        let store = &self.services.store;
        let workspace = match call.host.as_deref().filter(|h| !self.is_base_host(h)) {
            Some(domain) => {
                let binding = store.get_domain(domain).await?.ok_or(Error::DomainNotFound)?;
                if binding.status == DomainStatus::Blocked {
                    return Err(Error::DomainBlocked);
                }
                if !binding.verified || binding.status != DomainStatus::Active {
                    return Err(Error::DomainNotActive);
                }
                debug!(domain = %domain, workspace_id = %binding.workspace_id, "Resolved custom domain");
                store.get_workspace(binding.workspace_id).await?
            }
            None => {
                let slug = call.slug.trim();
                if slug.is_empty() {
                    return Err(Error::InvalidRequest("workspace slug is required".into()));
                }
                store.get_workspace_by_slug(slug).await?
            }
        };
        workspace.ok_or(Error::WorkspaceNotFound)
    }

    /// Published version of `workspace`.
    async fn current_version(&self, workspace: &Workspace) -> Result<WorkspaceVersion> {
        let id = workspace.current_version_id.ok_or(Error::VersionRequired)?;
        self.services
            .store
            .get_version(id)
            .await?
            .filter(|v| v.workspace_id == workspace.id)
            .ok_or(Error::VersionNotFound)
    }

    fn access_policy(&self, workspace: &Workspace, require_captcha: bool) -> AccessPolicy {
        let thresholds = Thresholds::resolve(&workspace.rate_limit, self.services.access.settings());
        AccessPolicy {
            access_mode: workspace.access_mode,
            data_classification: workspace.data_classification,
            rate_limit: RatePolicy {
                window_seconds: thresholds.window.as_secs(),
                soft_limit: thresholds.soft,
                hard_limit: thresholds.hard,
            },
            allowed_origins: workspace.allowed_origins.clone(),
            require_captcha,
        }
    }

    /// Run the access controller and the CAPTCHA check. Returns the access
    /// result and whether CAPTCHA is required.
    #[allow(clippy::too_many_arguments)]
    async fn admit(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        call: &RuntimeCall,
        event_type: AccessEventType,
        skip_session: bool,
        captcha_token: Option<&str>,
        mode: CaptchaMode,
    ) -> Result<(AccessResult, bool)> {
        let token = captcha_token.map(str::trim).filter(|t| !t.is_empty());
        let access = self
            .services
            .access
            .authorize(
                ctx,
                workspace,
                &AccessRequest {
                    event_type,
                    path: call.path.clone(),
                    session_id: call.session_id,
                    origin: call.origin.clone(),
                    captcha_provided: token.is_some(),
                    skip_session,
                },
            )
            .await?;

        let required = workspace.require_captcha || access.decision.require_captcha;
        let enforce = required && (mode == CaptchaMode::Enforce || token.is_some());
        captcha::ensure(self.services.captcha.as_ref(), enforce, token, &ctx.ip).await?;
        Ok((access, required))
    }

    async fn record_anonymous(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        session: Option<&Session>,
        event_type: &str,
    ) {
        if workspace.access_mode != AccessMode::PublicAnonymous || ctx.principal.is_some() {
            return;
        }
        let mut metadata = Map::new();
        metadata.insert("event_type".into(), json!(event_type));
        metadata.insert("access_mode".into(), json!(workspace.access_mode));
        if let Some(session) = session {
            metadata.insert("session_id".into(), json!(session.id));
        }
        self.services
            .audit
            .record(
                ctx,
                AuditRecord::new(workspace.id, "anonymous_access", "workspace")
                    .target(workspace.id)
                    .metadata(Value::Object(metadata)),
            )
            .await;
    }

    // ------------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------------

    /// Resolve and admit a runtime entry hit.
    pub async fn entry(&self, ctx: &RequestContext, call: &RuntimeCall) -> Result<RuntimeEntry> {
        ctx.guard("entry", self.timeouts.entry, self.entry_inner(ctx, call))
            .await
    }

    async fn entry_inner(&self, ctx: &RequestContext, call: &RuntimeCall) -> Result<RuntimeEntry> {
        let workspace = self.resolve(call).await?;
        ctx.observe_workspace(workspace.id);

        let (access, require_captcha) = self
            .admit(
                ctx,
                &workspace,
                call,
                AccessEventType::Entry,
                false,
                call.captcha_token.as_deref(),
                CaptchaMode::Signal,
            )
            .await?;
        self.record_anonymous(ctx, &workspace, access.session.as_ref(), "runtime_entry")
            .await;

        Ok(RuntimeEntry {
            workspace: RuntimeWorkspace::from(&workspace),
            access_policy: self.access_policy(&workspace, require_captcha),
            session_id: access.session.map(|s| s.id),
        })
    }

    // ------------------------------------------------------------------------
    // Schema
    // ------------------------------------------------------------------------

    /// Serve the published schema.
    ///
    /// With `cache` set, no presented session and a `public_anonymous`
    /// workspace the response is cacheable: it carries an ETag and public
    /// cache directives, runs without a session and records no access event.
    pub async fn schema(
        &self,
        ctx: &RequestContext,
        call: &RuntimeCall,
        cache: bool,
        if_none_match: Option<&str>,
    ) -> Result<RuntimeSchema> {
        ctx.guard(
            "schema",
            self.timeouts.schema,
            self.schema_inner(ctx, call, cache, if_none_match),
        )
        .await
    }

    async fn schema_inner(
        &self,
        ctx: &RequestContext,
        call: &RuntimeCall,
        cache: bool,
        if_none_match: Option<&str>,
    ) -> Result<RuntimeSchema> {
        let workspace = self.resolve(call).await?;
        ctx.observe_workspace(workspace.id);

        let skip_session = cache && call.session_id.is_none();
        let (access, require_captcha) = self
            .admit(
                ctx,
                &workspace,
                call,
                AccessEventType::Schema,
                skip_session,
                call.captcha_token.as_deref(),
                CaptchaMode::Signal,
            )
            .await?;
        self.record_anonymous(ctx, &workspace, access.session.as_ref(), "runtime_schema")
            .await;

        let version = self.current_version(&workspace).await?;
        let body = SchemaBody {
            entry: RuntimeEntry {
                workspace: RuntimeWorkspace::from(&workspace),
                access_policy: self.access_policy(&workspace, require_captcha),
                session_id: access.session.map(|s| s.id),
            },
            schema: schema_payload(&version)?,
        };

        // A caller-specific CAPTCHA signal must not reach shared caches.
        let cacheable = skip_session
            && workspace.access_mode == AccessMode::PublicAnonymous
            && require_captcha == workspace.require_captcha;
        let etag = if cacheable {
            Some(schema_etag(&body, &workspace, &version)?)
        } else {
            None
        };
        let not_modified = match (&etag, if_none_match) {
            (Some(etag), Some(header)) => etag_matches(header, etag),
            _ => false,
        };

        Ok(RuntimeSchema {
            body,
            etag,
            cache_control: cache_control(&self.settings, cacheable),
            not_modified,
        })
    }

    // ------------------------------------------------------------------------
    // Execute
    // ------------------------------------------------------------------------

    /// Validate inputs, consume one request and start the bound workflow.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        call: &RuntimeCall,
        body: ExecuteBody,
    ) -> Result<RuntimeExecuteResult> {
        ctx.guard("execute", self.timeouts.execute, self.execute_inner(ctx, call, body))
            .await
    }

    async fn execute_inner(
        &self,
        ctx: &RequestContext,
        call: &RuntimeCall,
        body: ExecuteBody,
    ) -> Result<RuntimeExecuteResult> {
        let workspace = self.resolve(call).await?;
        ctx.observe_workspace(workspace.id);

        let token = call.captcha_token.as_deref().or(body.captcha_token.as_deref());
        let (access, _) = self
            .admit(
                ctx,
                &workspace,
                call,
                AccessEventType::Execute,
                false,
                token,
                CaptchaMode::Enforce,
            )
            .await?;
        let session_id = access.session.as_ref().map(|s| s.id);
        self.record_anonymous(ctx, &workspace, access.session.as_ref(), "runtime_execute")
            .await;

        let version = self.current_version(&workspace).await?;
        let workflow_id = version.workflow_id.ok_or(Error::WorkflowRequired)?;

        let schema = ui_schema::normalize(&version.ui_schema)?;
        let inputs = ui_schema::map_inputs(&schema, &body.inputs).into_result()?;

        let usage = BTreeMap::from([(REQUESTS.to_string(), 1.0)]);
        self.services
            .billing
            .consume(ctx, &workspace, &usage)
            .await?
            .into_allowed()?;

        let trigger_type = body
            .trigger_type
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TRIGGER_TYPE.to_string());
        let trigger_data = trigger_data(&workspace, &version, workflow_id, session_id);

        let started = self
            .services
            .handoff
            .start(ExecutionRequest {
                workflow_id,
                user_id: workspace.owner_user_id,
                inputs,
                trigger_type: trigger_type.clone(),
                trigger_data,
            })
            .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    workspace_id = %workspace.id,
                    workflow_id = %workflow_id,
                    error = %e,
                    "Execution handoff failed"
                );
                self.record_event(ctx, &workspace, session_id, AccessEventType::ExecuteFailed, call)
                    .await;
                return Err(e);
            }
        };

        self.record_event(ctx, &workspace, session_id, AccessEventType::ExecuteSuccess, call)
            .await;
        let execution = RuntimeExecution {
            execution_id: handle.execution_id,
            workspace_id: workspace.id,
            version_id: version.id,
            workflow_id,
            user_id: ctx.user_id(),
            session_id,
            trigger_type,
            status: handle.status.clone(),
            created_at: ctx.received_at,
        };
        if let Err(e) = self.services.store.insert_execution(&execution).await {
            warn!(execution_id = %handle.execution_id, error = %e, "Failed to record runtime execution");
        }
        info!(
            workspace_id = %workspace.id,
            execution_id = %handle.execution_id,
            workflow_id = %workflow_id,
            "Runtime execution started"
        );

        Ok(RuntimeExecuteResult {
            execution_id: handle.execution_id,
            status: handle.status,
            workflow_id,
            started_at: handle.started_at,
            session_id,
            message: "Execution started".to_string(),
        })
    }

    /// Best-effort access event for the handoff outcome.
    async fn record_event(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        session_id: Option<Uuid>,
        event_type: AccessEventType,
        call: &RuntimeCall,
    ) {
        let event = NewAccessEvent {
            workspace_id: workspace.id,
            session_id,
            ip: ctx.ip.clone(),
            event_type,
            path: call.path.clone(),
            captcha_provided: false,
            occurred_at: ctx.received_at,
        };
        if let Err(e) = self.services.store.insert_access_event(&event).await {
            warn!(workspace_id = %workspace.id, event_type = %event_type, error = %e, "Failed to record access event");
        }
    }

    // ------------------------------------------------------------------------
    // VM dispatch
    // ------------------------------------------------------------------------

    /// Forward a request to the workspace's isolate.
    ///
    /// Admission counts as an execute hit. The isolate's own deadline is
    /// whatever remains of the VM deadline after admission.
    pub async fn dispatch_vm(&self, ctx: &RequestContext, call: &RuntimeCall, vm_call: VmCall) -> Result<VmDispatch> {
        let started = Instant::now();
        let deadline = self.timeouts.vm;
        let (version, request, session_id) = ctx
            .guard("vm", deadline, self.vm_admit(ctx, call, vm_call))
            .await?;

        let remaining = deadline.saturating_sub(started.elapsed()).max(Duration::from_millis(1));
        let response = ctx
            .cancellable(self.services.vm.handle(&version, &request, remaining))
            .await?;
        Ok(VmDispatch {
            response,
            session_id,
        })
    }

    async fn vm_admit(
        &self,
        ctx: &RequestContext,
        call: &RuntimeCall,
        vm_call: VmCall,
    ) -> Result<(WorkspaceVersion, VmRequest, Option<Uuid>)> {
        let workspace = self.resolve(call).await?;
        ctx.observe_workspace(workspace.id);

        let (access, _) = self
            .admit(
                ctx,
                &workspace,
                call,
                AccessEventType::Execute,
                false,
                call.captcha_token.as_deref(),
                CaptchaMode::Enforce,
            )
            .await?;
        self.record_anonymous(ctx, &workspace, access.session.as_ref(), "runtime_vm")
            .await;

        let version = self.current_version(&workspace).await?;
        vm::app_code(&version)?;
        let request = VmRequest::from_parts(
            &vm_call.method,
            &vm_call.path,
            vm_call.query,
            vm_call.headers,
            &vm_call.body,
            vm_call.user,
        )?;

        let usage = BTreeMap::from([(REQUESTS.to_string(), 1.0)]);
        self.services
            .billing
            .consume(ctx, &workspace, &usage)
            .await?
            .into_allowed()?;

        Ok((version, request, access.session.map(|s| s.id)))
    }
}

/// Schema payload of a version. Private config keys are removed.
fn schema_payload(version: &WorkspaceVersion) -> Result<SchemaPayload> {
    let ui_schema = ui_schema::normalize(&version.ui_schema)?;
    let mut config = version.config.clone();
    if let Some(map) = config.as_object_mut() {
        for key in PRIVATE_CONFIG_KEYS {
            map.remove(*key);
        }
    }
    let output_schema = config.get("output_schema").cloned();
    let input_mapping = config.get("input_mapping").cloned().or_else(|| {
        let mapping = ui_schema.input_mapping();
        (!mapping.is_empty()).then(|| json!(mapping))
    });

    Ok(SchemaPayload {
        ui_schema: ui_schema.to_value(),
        db_schema: version.db_schema.clone(),
        config,
        version: version.version,
        workflow_id: version.workflow_id,
        version_id: version.id,
        created_at: version.created_at,
        changelog: version.changelog.clone(),
        output_schema,
        input_mapping,
    })
}

fn trigger_data(
    workspace: &Workspace,
    version: &WorkspaceVersion,
    workflow_id: Uuid,
    session_id: Option<Uuid>,
) -> Value {
    let mut data = json!({
        "source": "workspace_runtime",
        "workspace_id": workspace.id,
        "workspace_version_id": version.id,
        "workflow_id": workflow_id,
        "access_mode": workspace.access_mode,
    });
    if let Some(session_id) = session_id {
        data["session_id"] = json!(session_id);
    }
    data
}
