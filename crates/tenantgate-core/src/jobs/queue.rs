// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue names and task construction.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{ExportKind, TaskEntry, TaskState};

pub const WORKSPACE_EXPORT_QUEUE: &str = "workspace_export";
pub const ANALYTICS_EXPORT_QUEUE: &str = "analytics_export";
pub const EXECUTION_ARCHIVE_QUEUE: &str = "execution_log_archive";
pub const AUDIT_ARCHIVE_QUEUE: &str = "audit_log_archive";
pub const AUDIT_RETRY_QUEUE: &str = "audit_retry";

/// Every queue served by the worker pool.
pub const ALL_QUEUES: [&str; 5] = [
    WORKSPACE_EXPORT_QUEUE,
    ANALYTICS_EXPORT_QUEUE,
    EXECUTION_ARCHIVE_QUEUE,
    AUDIT_ARCHIVE_QUEUE,
    AUDIT_RETRY_QUEUE,
];

/// Queue that carries jobs of an export kind.
pub fn queue_for(kind: ExportKind) -> &'static str {
    match kind {
        ExportKind::WorkspaceExport => WORKSPACE_EXPORT_QUEUE,
        ExportKind::AnalyticsExport => ANALYTICS_EXPORT_QUEUE,
        ExportKind::ExecutionLogArchive => EXECUTION_ARCHIVE_QUEUE,
        ExportKind::AuditLogArchive => AUDIT_ARCHIVE_QUEUE,
    }
}

/// Export kind served by a queue, if it is an export queue.
pub fn kind_for(queue_name: &str) -> Option<ExportKind> {
    match queue_name {
        WORKSPACE_EXPORT_QUEUE => Some(ExportKind::WorkspaceExport),
        ANALYTICS_EXPORT_QUEUE => Some(ExportKind::AnalyticsExport),
        EXECUTION_ARCHIVE_QUEUE => Some(ExportKind::ExecutionLogArchive),
        AUDIT_ARCHIVE_QUEUE => Some(ExportKind::AuditLogArchive),
        _ => None,
    }
}

/// A pending task available at `now`.
pub fn new_task(
    queue_name: &str,
    task_id: Uuid,
    payload: Value,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> TaskEntry {
    TaskEntry {
        task_id,
        queue_name: queue_name.to_string(),
        payload,
        state: TaskState::Pending,
        attempts: 0,
        max_attempts: i64::from(max_attempts.max(1)),
        available_at: now,
        lease_expires_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_queues_round_trip_kinds() {
        for kind in [
            ExportKind::WorkspaceExport,
            ExportKind::AnalyticsExport,
            ExportKind::ExecutionLogArchive,
            ExportKind::AuditLogArchive,
        ] {
            assert_eq!(kind_for(queue_for(kind)), Some(kind));
        }
        assert_eq!(kind_for(AUDIT_RETRY_QUEUE), None);
    }

    #[test]
    fn test_new_task_clamps_attempts() {
        let task = new_task(AUDIT_RETRY_QUEUE, Uuid::new_v4(), Value::Null, 0, crate::time::now());
        assert_eq!(task.max_attempts, 1);
        assert_eq!(task.state, TaskState::Pending);
    }
}
