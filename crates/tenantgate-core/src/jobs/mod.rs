// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asynchronous job pipeline.
//!
//! One durable queue per job kind lives in the store's `task_queue` table.
//! [`worker::JobWorker`] leases tasks with a visibility timeout, runs the
//! handler registered for the queue and acks, releases with backoff, or
//! dead-letters. A crashed worker leaves its lease to expire, so every
//! handler must be idempotent under its task id:
//!
//! - export jobs use the job id as task id and write to a key derived from it
//! - audit retries re-insert the entry under its original id
//!
//! [`service::ExportService`] is the management surface on top: requesting
//! exports and archives, downloads, replay, subscriptions and DLQ admin.

pub mod backoff;
pub mod exports;
pub mod maintenance;
pub mod object_store;
pub mod queue;
pub mod replay;
pub mod service;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use self::exports::ExportHandler;
pub use self::maintenance::MaintenanceWorker;
pub use self::object_store::LocalObjectStore;
pub use self::replay::{ReplayPage, ReplayQuery};
pub use self::service::ExportService;
pub use self::worker::JobWorker;

use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::store::{AuditEntry, ExportKind, Store, TaskEntry};

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;
/// Version of the record layout inside artifacts.
pub const SCHEMA_VERSION: u32 = 1;

/// Time range covered by an artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Description of an export artifact, written next to (or inside) it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub workspace_id: Uuid,
    pub kind: ExportKind,
    pub format: String,
    pub ranges: ManifestRange,
    /// Records per dataset.
    pub counts: BTreeMap<String, i64>,
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
}

impl Manifest {
    pub fn new(workspace_id: Uuid, kind: ExportKind, format: &str, ranges: ManifestRange) -> Self {
        Self {
            version: MANIFEST_VERSION,
            workspace_id,
            kind,
            format: format.to_string(),
            ranges,
            counts: BTreeMap::new(),
            schema_version: SCHEMA_VERSION,
            generated_at: crate::time::now(),
        }
    }

    /// Total records over all datasets.
    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

/// Work bound to one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Queue this handler consumes.
    fn queue(&self) -> &'static str;

    /// Run one claimed task. Must be idempotent under `task.task_id`.
    async fn run(&self, ctx: &RequestContext, task: &TaskEntry) -> Result<()>;

    /// Called once a task is dead-lettered.
    async fn on_dead(&self, _task: &TaskEntry, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Re-inserts audit entries whose first write failed.
pub struct AuditRetryHandler {
    store: Arc<dyn Store>,
}

impl AuditRetryHandler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for AuditRetryHandler {
    fn queue(&self) -> &'static str {
        queue::AUDIT_RETRY_QUEUE
    }

    async fn run(&self, _ctx: &RequestContext, task: &TaskEntry) -> Result<()> {
        let entry = task
            .payload
            .get("entry")
            .cloned()
            .ok_or_else(|| Error::InvalidRequest("audit retry payload has no entry".into()))?;
        let entry: AuditEntry = serde_json::from_value(entry)
            .map_err(|e| Error::InvalidRequest(format!("audit retry payload: {e}")))?;
        self.store.insert_audit(&entry).await
    }
}

/// Read an optional string option from a job's options document.
pub(crate) fn option_str<'a>(options: &'a Value, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RangePage, SqliteStore};
    use serde_json::json;

    #[tokio::test]
    async fn test_audit_retry_is_idempotent() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let handler = AuditRetryHandler::new(store.clone());
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            action: "export_requested".into(),
            actor_user_id: None,
            target_type: "export_job".into(),
            target_id: None,
            metadata: json!({}),
            ip: "10.0.0.1".into(),
            user_agent: "ua".into(),
            occurred_at: crate::time::now(),
        };
        let task = queue::new_task(
            queue::AUDIT_RETRY_QUEUE,
            entry.id,
            json!({ "entry": entry }),
            3,
            crate::time::now(),
        );
        let ctx = RequestContext::system();

        handler.run(&ctx, &task).await.unwrap();
        handler.run(&ctx, &task).await.unwrap();

        let rows = store.list_audit(entry.workspace_id, RangePage::all(0, 10)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, entry.id);
    }

    #[tokio::test]
    async fn test_audit_retry_rejects_malformed_payload() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let handler = AuditRetryHandler::new(store);
        let task = queue::new_task(
            queue::AUDIT_RETRY_QUEUE,
            Uuid::new_v4(),
            json!({}),
            3,
            crate::time::now(),
        );
        let err = handler.run(&RequestContext::system(), &task).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
