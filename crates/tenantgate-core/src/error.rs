// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for tenantgate-core.
//!
//! Every failure the core can report is one variant of [`Error`]. The variant
//! names the error kind and its fields carry the structured payload that the
//! HTTP boundary renders as `details`. Transport status codes are not assigned
//! here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ui_schema::FieldError;

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse category of an error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or invalid caller input.
    Input,
    /// Missing or insufficient identity.
    Identity,
    /// Referenced state is missing or conflicting.
    State,
    /// A policy refused the request.
    Policy,
    /// A dependency or feature is unavailable.
    Availability,
    /// Unexpected failure.
    Fatal,
}

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Request shape or parameter is invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An identifier could not be parsed.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Runtime inputs failed schema validation. Carries every failing field.
    #[error("Input validation failed for {} field(s)", .0.len())]
    InvalidInputs(Vec<FieldError>),

    /// Usage map passed to the billing engine is invalid.
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// The operation needs an authenticated principal.
    #[error("Authentication required")]
    AuthRequired,

    /// The bearer or app-session token could not be verified.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// The principal is not allowed to perform the operation.
    #[error("Access denied")]
    Unauthorized,

    /// A CAPTCHA token is required but none was supplied.
    #[error("CAPTCHA verification required")]
    CaptchaRequired,

    /// The supplied CAPTCHA token was rejected.
    #[error("CAPTCHA verification failed")]
    CaptchaInvalid,

    /// No live workspace matches the slug or id.
    #[error("Workspace not found")]
    WorkspaceNotFound,

    /// The referenced version does not exist or belongs to another workspace.
    #[error("Version not found")]
    VersionNotFound,

    /// The workspace has no published version.
    #[error("Workspace has no published version")]
    VersionRequired,

    /// The published version is not bound to a workflow.
    #[error("Published version has no bound workflow")]
    WorkflowRequired,

    /// The published version carries no app code for the VM.
    #[error("Published version has no app code")]
    AppCodeRequired,

    /// The execution engine does not know the bound workflow.
    #[error("Workflow not found")]
    WorkflowNotFound,

    /// A generic resource lookup failed.
    #[error("{resource} '{id}' not found")]
    NotFound {
        /// Resource type.
        resource: &'static str,
        /// Requested identifier.
        id: String,
    },

    /// The resource is in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The idempotency key was used before with a different request body.
    #[error("Idempotency key was reused with a different request")]
    IdempotencyConflict,

    /// The first request with this idempotency key has not finished yet.
    #[error("A request with this idempotency key is still in progress")]
    IdempotencyInProgress,

    /// A `block`-policy dimension would exceed its limit.
    #[error("Quota exceeded for {}", .exceeded.join(", "))]
    QuotaExceeded {
        /// Dimensions that would exceed their limit.
        exceeded: Vec<String>,
        /// Remaining amount per limited dimension.
        remaining: BTreeMap<String, f64>,
    },

    /// The caller hit the hard rate threshold.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Seconds until the window frees up.
        retry_after_secs: u64,
    },

    /// The caller's IP is banned for this workspace.
    #[error("IP address is blocked")]
    IpBlocked,

    /// The caller's session is blocked.
    #[error("Session is blocked")]
    SessionBlocked {
        /// End of the cooldown, if any.
        until: Option<DateTime<Utc>>,
    },

    /// The spend limit for the period was reached.
    #[error("Spend limit reached ({spent:.2} of {limit:.2} {currency})")]
    SpendLimit {
        /// Period-to-date cost.
        spent: f64,
        /// Configured limit.
        limit: f64,
        /// Budget currency.
        currency: String,
    },

    /// No binding exists for the custom domain.
    #[error("Domain not found")]
    DomainNotFound,

    /// The domain binding is unverified or not active.
    #[error("Domain is not active")]
    DomainNotActive,

    /// The domain binding is blocked.
    #[error("Domain is blocked")]
    DomainBlocked,

    /// The request origin is not in the workspace's allow list.
    #[error("Origin '{origin}' is not allowed")]
    OriginMismatch {
        /// Origin header as received.
        origin: String,
    },

    /// A downstream system is shedding load.
    #[error("Service is overloaded")]
    Overloaded,

    /// CAPTCHA is required but no verifier is reachable.
    #[error("CAPTCHA verification is unavailable")]
    CaptchaUnavailable,

    /// Exports are switched off for this deployment.
    #[error("Exports are disabled")]
    ExportDisabled,

    /// The export artifact is not available yet.
    #[error("Export is not ready (status: {status})")]
    ExportNotReady {
        /// Current job status.
        status: String,
    },

    /// The export artifact passed its retention.
    #[error("Export has expired")]
    ExportExpired,

    /// A collaborator is not configured or not reachable.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The workspace isolate crashed, timed out or answered badly.
    #[error("App runtime failure: {0}")]
    VmFailure(String),

    /// The per-operation deadline passed.
    #[error("Deadline exceeded for {operation}")]
    DeadlineExceeded {
        /// Operation name.
        operation: &'static str,
    },

    /// The request was cancelled before completion.
    #[error("Request cancelled")]
    Cancelled,

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Archive writing or reading failed.
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// CSV writing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Other unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable snake_case code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidId(_) => "invalid_id",
            Self::InvalidInputs(_) => "invalid_inputs",
            Self::InvalidUsage(_) => "invalid_usage",
            Self::AuthRequired => "auth_required",
            Self::InvalidToken(_) => "invalid_token",
            Self::Unauthorized => "unauthorized",
            Self::CaptchaRequired => "captcha_required",
            Self::CaptchaInvalid => "captcha_invalid",
            Self::WorkspaceNotFound => "workspace_not_found",
            Self::VersionNotFound => "version_not_found",
            Self::VersionRequired => "version_required",
            Self::WorkflowRequired => "workflow_required",
            Self::AppCodeRequired => "app_code_required",
            Self::WorkflowNotFound => "workflow_not_found",
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::IdempotencyConflict => "idempotency_conflict",
            Self::IdempotencyInProgress => "idempotency_in_progress",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::IpBlocked => "ip_blocked",
            Self::SessionBlocked { .. } => "session_blocked",
            Self::SpendLimit { .. } => "spend_limit",
            Self::DomainNotFound => "domain_not_found",
            Self::DomainNotActive => "domain_not_active",
            Self::DomainBlocked => "domain_blocked",
            Self::OriginMismatch { .. } => "origin_mismatch",
            Self::Overloaded => "overloaded",
            Self::CaptchaUnavailable => "captcha_unavailable",
            Self::ExportDisabled => "export_disabled",
            Self::ExportNotReady { .. } => "export_not_ready",
            Self::ExportExpired => "export_expired",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::VmFailure(_) => "vm_failure",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Archive(_)
            | Self::Csv(_)
            | Self::Internal(_) => "internal",
        }
    }

    /// Category of this error kind.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidId(_)
            | Self::InvalidInputs(_)
            | Self::InvalidUsage(_) => ErrorClass::Input,
            Self::AuthRequired
            | Self::InvalidToken(_)
            | Self::Unauthorized
            | Self::CaptchaRequired
            | Self::CaptchaInvalid => ErrorClass::Identity,
            Self::WorkspaceNotFound
            | Self::VersionNotFound
            | Self::VersionRequired
            | Self::WorkflowRequired
            | Self::AppCodeRequired
            | Self::WorkflowNotFound
            | Self::NotFound { .. }
            | Self::InvalidState(_)
            | Self::IdempotencyConflict
            | Self::IdempotencyInProgress => ErrorClass::State,
            Self::QuotaExceeded { .. }
            | Self::RateLimited { .. }
            | Self::IpBlocked
            | Self::SessionBlocked { .. }
            | Self::SpendLimit { .. }
            | Self::DomainNotFound
            | Self::DomainNotActive
            | Self::DomainBlocked
            | Self::OriginMismatch { .. } => ErrorClass::Policy,
            Self::Overloaded
            | Self::CaptchaUnavailable
            | Self::ExportDisabled
            | Self::ExportNotReady { .. }
            | Self::ExportExpired
            | Self::ServiceUnavailable(_)
            | Self::VmFailure(_)
            | Self::DeadlineExceeded { .. }
            | Self::Cancelled => ErrorClass::Availability,
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Archive(_)
            | Self::Csv(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Structured payload for the error envelope.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::InvalidInputs(errors) => Some(json!(errors)),
            Self::QuotaExceeded {
                exceeded,
                remaining,
            } => Some(json!({ "exceeded": exceeded, "remaining": remaining })),
            Self::RateLimited { retry_after_secs } => {
                Some(json!({ "retry_after_seconds": retry_after_secs }))
            }
            Self::SessionBlocked { until } => Some(json!({ "blocked_until": until })),
            Self::SpendLimit {
                spent,
                limit,
                currency,
            } => Some(json!({
                "spent": spent,
                "limit": limit,
                "remaining": (limit - spent).max(0.0),
                "currency": currency,
            })),
            Self::OriginMismatch { origin } => Some(json!({ "origin": origin })),
            Self::ExportNotReady { status } => Some(json!({ "status": status })),
            Self::DeadlineExceeded { operation } => Some(json!({ "operation": operation })),
            Self::NotFound { resource, id } => Some(json!({ "resource": resource, "id": id })),
            _ => None,
        }
    }

    /// Message safe to show to callers. Fatal errors are not echoed.
    pub fn public_message(&self) -> String {
        match self.class() {
            ErrorClass::Fatal => "internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}
