// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request context passed explicitly through every core operation.
//!
//! Carries the ambient request state (principal, idempotency key, real IP,
//! user agent) together with the cancellation token issued at the HTTP
//! boundary. Nothing in the core reads this state from globals.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User id from the verified token.
    pub user_id: Uuid,
    /// Whether the token grants platform administration.
    pub is_admin: bool,
}

/// Per-request state.
#[derive(Debug)]
pub struct RequestContext {
    /// Correlation id for logs.
    pub request_id: Uuid,
    /// Authenticated caller, if any.
    pub principal: Option<Principal>,
    /// Value of the `Idempotency-Key` header.
    pub idempotency_key: Option<String>,
    /// Real client IP.
    pub ip: String,
    /// Raw `User-Agent`.
    pub user_agent: String,
    /// When the request was received (second resolution).
    pub received_at: DateTime<Utc>,
    cancel: CancellationToken,
    observed_workspace: OnceLock<Uuid>,
}

impl RequestContext {
    /// Create a context for an inbound request.
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            principal: None,
            idempotency_key: None,
            ip: ip.into(),
            user_agent: user_agent.into(),
            received_at: crate::time::now(),
            cancel: CancellationToken::new(),
            observed_workspace: OnceLock::new(),
        }
    }

    /// Context for work started by background workers.
    pub fn system() -> Self {
        Self::new("", "tenantgate-worker")
    }

    /// Attach the authenticated caller.
    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    /// Attach the idempotency key.
    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.trim().is_empty());
        self
    }

    /// Use a cancellation token derived from the server's root token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Id of the authenticated caller.
    pub fn user_id(&self) -> Option<Uuid> {
        self.principal.as_ref().map(|p| p.user_id)
    }

    /// Whether the caller is a platform administrator.
    pub fn is_admin(&self) -> bool {
        self.principal.as_ref().is_some_and(|p| p.is_admin)
    }

    /// The request's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record the workspace the request resolved to (first call wins).
    pub fn observe_workspace(&self, workspace_id: Uuid) {
        let _ = self.observed_workspace.set(workspace_id);
    }

    /// Workspace the request resolved to, for metric labels.
    pub fn observed_workspace(&self) -> Option<Uuid> {
        self.observed_workspace.get().copied()
    }

    /// Run `fut` under this request's cancellation token and a deadline.
    ///
    /// Cancellation wins over completion when both are ready. A deadline
    /// breach yields [`Error::DeadlineExceeded`].
    pub async fn guard<T, F>(&self, operation: &'static str, deadline: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(deadline, fut) => match outcome {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded { operation }),
            },
        }
    }

    /// Run `fut` under this request's cancellation token only.
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }
}
