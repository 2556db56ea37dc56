// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only audit sink.
//!
//! Writes are best-effort: a failed insert never fails the originating
//! request. The entry is handed to the `audit_retry` queue instead and
//! re-inserted by the job pipeline under the same id.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{error, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::Result;
use crate::jobs::queue::{AUDIT_RETRY_QUEUE, new_task};
use crate::store::{AuditEntry, Store};

/// What happened, to which target, by whom.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub workspace_id: Uuid,
    pub action: String,
    pub target_type: String,
    pub target_id: Option<String>,
    pub metadata: Value,
}

impl AuditRecord {
    pub fn new(workspace_id: Uuid, action: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            workspace_id,
            action: action.into(),
            target_type: target_type.into(),
            target_id: None,
            metadata: json!({}),
        }
    }

    pub fn target(mut self, id: impl ToString) -> Self {
        self.target_id = Some(id.to_string());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Audit writer shared by the request path and workers.
#[derive(Clone)]
pub struct AuditSink {
    store: Arc<dyn Store>,
    retry_attempts: u32,
}

impl AuditSink {
    pub fn new(store: Arc<dyn Store>, retry_attempts: u32) -> Self {
        Self {
            store,
            retry_attempts,
        }
    }

    /// Record an entry, enriched with the context's IP, user agent and principal.
    pub async fn record(&self, ctx: &RequestContext, record: AuditRecord) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            workspace_id: record.workspace_id,
            action: record.action,
            actor_user_id: ctx.user_id(),
            target_type: record.target_type,
            target_id: record.target_id,
            metadata: record.metadata,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            occurred_at: crate::time::now(),
        };

        if let Err(e) = self.store.insert_audit(&entry).await {
            warn!(
                error = %e,
                workspace_id = %entry.workspace_id,
                action = %entry.action,
                "Audit write failed, queueing retry"
            );
            if let Err(e) = self.enqueue_retry(&entry).await {
                error!(
                    error = %e,
                    audit_id = %entry.id,
                    "Failed to queue audit retry, entry dropped"
                );
            }
        }
    }

    async fn enqueue_retry(&self, entry: &AuditEntry) -> Result<()> {
        let task = new_task(
            AUDIT_RETRY_QUEUE,
            entry.id,
            json!({ "entry": entry }),
            self.retry_attempts,
            crate::time::now(),
        );
        self.store.enqueue_task(&task).await?;
        Ok(())
    }
}
