// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Management surface of the job pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use super::exports::{MANIFEST_FILE, formats_of, parse_event_types};
use super::object_store::LocalObjectStore;
use super::queue::{kind_for, new_task, queue_for};
use super::replay::{self, ReplayPage, ReplayQuery};
use crate::audit::{AuditRecord, AuditSink};
use crate::config::JobSettings;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::store::{
    ExportJob, ExportKind, ExportStatus, ExportSubscription, Store, TaskEntry, TaskState, Workspace,
};

/// Caller input for a new export or archive.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExportRequest {
    pub format: Option<String>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub options: Value,
}

/// Caller input for a scheduled analytics export.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionRequest {
    pub cron: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

/// Artifact ready to be streamed as an attachment.
#[derive(Debug)]
pub struct Download {
    pub file_name: String,
    pub content_type: &'static str,
    pub size: u64,
    pub file: tokio::fs::File,
}

/// Next occurrence of a cron expression strictly after `after`.
pub fn next_run(cron: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = Cron::new(cron)
        .parse()
        .map_err(|e| Error::InvalidRequest(format!("invalid cron expression '{cron}': {e}")))?;
    let next = schedule
        .find_next_occurrence(&after, false)
        .map_err(|e| Error::InvalidRequest(format!("cron expression '{cron}' never fires: {e}")))?;
    Ok(crate::time::truncate(next))
}

fn content_type(format: &str) -> &'static str {
    match format {
        "zip" => "application/zip",
        "csv" => "text/csv",
        _ => "application/x-ndjson",
    }
}

fn resolve_format(kind: ExportKind, requested: Option<&str>) -> Result<String> {
    let allowed = formats_of(kind);
    match requested.map(|f| f.trim().to_ascii_lowercase()) {
        None => Ok(allowed[0].to_string()),
        Some(f) if allowed.contains(&f.as_str()) => Ok(f),
        Some(f) => Err(Error::InvalidRequest(format!(
            "format '{f}' is not supported for {kind} (expected one of: {})",
            allowed.join(", ")
        ))),
    }
}

/// Exports, archives, subscriptions and dead-letter administration.
pub struct ExportService {
    store: Arc<dyn Store>,
    objects: LocalObjectStore,
    audit: AuditSink,
    settings: JobSettings,
}

impl ExportService {
    pub fn new(
        store: Arc<dyn Store>,
        objects: LocalObjectStore,
        audit: AuditSink,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            objects,
            audit,
            settings,
        }
    }

    pub fn objects(&self) -> &LocalObjectStore {
        &self.objects
    }

    /// Create a job and enqueue it. The job id doubles as task id.
    pub async fn request(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        kind: ExportKind,
        request: ExportRequest,
    ) -> Result<ExportJob> {
        if !self.settings.exports_enabled {
            return Err(Error::ExportDisabled);
        }
        let requested_by = ctx.user_id().ok_or(Error::AuthRequired)?;
        let job = self.build_job(workspace.id, kind, requested_by, request)?;
        self.enqueue(&job).await?;

        let action = if kind.is_archive() {
            "log_archive_requested"
        } else {
            "export_requested"
        };
        self.audit
            .record(
                ctx,
                AuditRecord::new(workspace.id, action, "export_job")
                    .target(job.id)
                    .metadata(json!({ "kind": kind, "format": job.format })),
            )
            .await;
        info!(job_id = %job.id, workspace_id = %workspace.id, kind = %kind, "Export queued");
        Ok(job)
    }

    fn build_job(
        &self,
        workspace_id: Uuid,
        kind: ExportKind,
        requested_by: Uuid,
        request: ExportRequest,
    ) -> Result<ExportJob> {
        let format = resolve_format(kind, request.format.as_deref())?;
        let options = if request.options.is_null() {
            json!({})
        } else if request.options.is_object() {
            request.options
        } else {
            return Err(Error::InvalidRequest("options must be an object".into()));
        };
        if kind == ExportKind::AnalyticsExport {
            parse_event_types(&options)?;
        }
        let (range_start, range_end) = match kind {
            ExportKind::WorkspaceExport => (None, None),
            _ => (
                request.range_start.map(crate::time::truncate),
                request.range_end.map(crate::time::truncate),
            ),
        };
        if let (Some(from), Some(to)) = (range_start, range_end)
            && from >= to
        {
            return Err(Error::InvalidRequest("range_start must be before range_end".into()));
        }

        Ok(ExportJob {
            id: Uuid::new_v4(),
            workspace_id,
            kind,
            status: ExportStatus::Queued,
            requested_by,
            format,
            options,
            range_start,
            range_end,
            file_path: None,
            file_name: None,
            file_size: None,
            record_count: None,
            error: None,
            created_at: crate::time::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
        })
    }

    async fn enqueue(&self, job: &ExportJob) -> Result<()> {
        self.store.insert_export_job(job).await?;
        let task = new_task(
            queue_for(job.kind),
            job.id,
            json!({ "job_id": job.id, "workspace_id": job.workspace_id, "kind": job.kind }),
            self.settings.max_attempts,
            job.created_at,
        );
        self.store.enqueue_task(&task).await?;
        Ok(())
    }

    /// Job of `workspace_id` by id.
    pub async fn get(&self, workspace_id: Uuid, job_id: Uuid) -> Result<ExportJob> {
        match self.store.get_export_job(job_id).await? {
            Some(job) if job.workspace_id == workspace_id => Ok(job),
            _ => Err(Error::not_found("export", job_id)),
        }
    }

    /// Newest first.
    pub async fn list(&self, workspace_id: Uuid, kinds: &[ExportKind], limit: i64) -> Result<Vec<ExportJob>> {
        self.store
            .list_export_jobs(workspace_id, kinds, limit.clamp(1, 200))
            .await
    }

    async fn completed(&self, workspace_id: Uuid, job_id: Uuid) -> Result<ExportJob> {
        let job = self.get(workspace_id, job_id).await?;
        match job.status {
            ExportStatus::Completed => {
                if job.expires_at.is_some_and(|at| at <= crate::time::now()) {
                    return Err(Error::ExportExpired);
                }
                Ok(job)
            }
            ExportStatus::Expired => Err(Error::ExportExpired),
            status => Err(Error::ExportNotReady {
                status: status.to_string(),
            }),
        }
    }

    /// Artifact of a completed, unexpired job.
    pub async fn download(&self, workspace_id: Uuid, job_id: Uuid) -> Result<Download> {
        let job = self.completed(workspace_id, job_id).await?;
        let key = job
            .file_path
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("export {} has no file", job.id)))?;
        let (file, size) = self.objects.open(key).await?;
        Ok(Download {
            file_name: job.file_name.clone().unwrap_or_else(|| format!("{}.{}", job.id, job.format)),
            content_type: content_type(&job.format),
            size,
            file,
        })
    }

    /// Cursored read over a completed log archive.
    pub async fn replay(
        &self,
        workspace_id: Uuid,
        job_id: Uuid,
        query: &ReplayQuery,
    ) -> Result<ReplayPage> {
        let job = self.get(workspace_id, job_id).await?;
        if !job.kind.is_archive() {
            return Err(Error::InvalidRequest(format!("{} does not support replay", job.kind)));
        }
        let job = self.completed(workspace_id, job.id).await?;
        let key = job
            .file_path
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("archive {} has no file", job.id)))?;
        let body = self.objects.get(key).await?;
        replay::replay(job.kind, &body, query)
    }

    /// Delete a finished job and its files.
    pub async fn delete(&self, ctx: &RequestContext, workspace_id: Uuid, job_id: Uuid) -> Result<()> {
        let job = self.get(workspace_id, job_id).await?;
        if matches!(job.status, ExportStatus::Queued | ExportStatus::Running) {
            return Err(Error::InvalidState(format!(
                "export {} is still {}",
                job.id, job.status
            )));
        }
        self.remove_files(&job).await?;
        self.store.delete_export_job(job.id).await?;
        self.audit
            .record(
                ctx,
                AuditRecord::new(workspace_id, "export_deleted", "export_job")
                    .target(job.id)
                    .metadata(json!({ "kind": job.kind })),
            )
            .await;
        Ok(())
    }

    /// Remove the artifact and manifest of a job.
    pub async fn remove_files(&self, job: &ExportJob) -> Result<()> {
        if let Some(key) = &job.file_path {
            self.objects.delete(key).await?;
        }
        self.objects
            .delete(&LocalObjectStore::export_key(job.workspace_id, job.id, MANIFEST_FILE))
            .await
    }

    // ---- subscriptions ----

    pub async fn create_subscription(
        &self,
        ctx: &RequestContext,
        workspace: &Workspace,
        request: SubscriptionRequest,
    ) -> Result<ExportSubscription> {
        if !self.settings.exports_enabled {
            return Err(Error::ExportDisabled);
        }
        let created_by = ctx.user_id().ok_or(Error::AuthRequired)?;
        let format = resolve_format(ExportKind::AnalyticsExport, request.format.as_deref())?;
        parse_event_types(&json!({ "event_types": request.event_types }))?;
        let now = crate::time::now();
        let cron = request.cron.trim().to_string();
        let next_run_at = next_run(&cron, now)?;

        let subscription = ExportSubscription {
            id: Uuid::new_v4(),
            workspace_id: workspace.id,
            cron,
            format,
            event_types: request.event_types,
            created_by,
            active: true,
            last_run_at: None,
            next_run_at,
            created_at: now,
        };
        self.store.insert_subscription(&subscription).await?;
        self.audit
            .record(
                ctx,
                AuditRecord::new(workspace.id, "export_subscription_created", "export_subscription")
                    .target(subscription.id)
                    .metadata(json!({ "cron": subscription.cron })),
            )
            .await;
        Ok(subscription)
    }

    pub async fn list_subscriptions(&self, workspace_id: Uuid) -> Result<Vec<ExportSubscription>> {
        self.store.list_subscriptions(workspace_id).await
    }

    pub async fn delete_subscription(
        &self,
        ctx: &RequestContext,
        workspace_id: Uuid,
        id: Uuid,
    ) -> Result<()> {
        if !self.store.delete_subscription(workspace_id, id).await? {
            return Err(Error::not_found("export_subscription", id));
        }
        self.audit
            .record(
                ctx,
                AuditRecord::new(workspace_id, "export_subscription_deleted", "export_subscription")
                    .target(id),
            )
            .await;
        Ok(())
    }

    /// Enqueue an analytics export for every due subscription. Returns the number enqueued.
    pub async fn run_due_subscriptions(&self, now: DateTime<Utc>) -> Result<usize> {
        if !self.settings.exports_enabled {
            return Ok(0);
        }
        let due = self.store.due_subscriptions(now, 100).await?;
        let mut enqueued = 0;
        for sub in due {
            let request = ExportRequest {
                format: Some(sub.format.clone()),
                range_start: Some(sub.last_run_at.unwrap_or(sub.created_at)),
                range_end: Some(now),
                options: json!({ "event_types": sub.event_types, "subscription_id": sub.id }),
            };
            let next = next_run(&sub.cron, now)?;
            match self.build_job(sub.workspace_id, ExportKind::AnalyticsExport, sub.created_by, request) {
                Ok(job) => {
                    self.enqueue(&job).await?;
                    enqueued += 1;
                    info!(
                        subscription_id = %sub.id,
                        job_id = %job.id,
                        workspace_id = %sub.workspace_id,
                        "Subscription export queued"
                    );
                }
                Err(e) => {
                    tracing::warn!(subscription_id = %sub.id, error = %e, "Subscription skipped");
                }
            }
            self.store.advance_subscription(sub.id, now, next).await?;
        }
        Ok(enqueued)
    }

    // ---- dead-letter queue ----

    pub async fn list_dead(&self, queue: Option<&str>, offset: i64, limit: i64) -> Result<Vec<TaskEntry>> {
        self.store
            .list_dead_tasks(queue, offset.max(0), limit.clamp(1, 500))
            .await
    }

    /// Move a dead task back to pending with a fresh attempt budget.
    ///
    /// Retrying a task that is no longer dead returns it unchanged.
    pub async fn retry_dead(&self, ctx: &RequestContext, task_id: Uuid) -> Result<TaskEntry> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        if task.state != TaskState::Dead {
            return Ok(task);
        }

        if kind_for(&task.queue_name).is_some() {
            self.store.requeue_export_job(task.task_id).await?;
        }
        self.store.revive_task(task.task_id, crate::time::now()).await?;
        info!(task_id = %task.task_id, queue = %task.queue_name, "Dead task revived");

        if let Some(job) = self.store.get_export_job(task.task_id).await? {
            self.audit
                .record(
                    ctx,
                    AuditRecord::new(job.workspace_id, "dead_task_retried", "task")
                        .target(task.task_id)
                        .metadata(json!({ "queue": task.queue_name })),
                )
                .await;
        }

        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    pub async fn delete_dead(&self, task_id: Uuid) -> Result<()> {
        if !self.store.delete_dead_task(task_id).await? {
            return Err(Error::not_found("dead_task", task_id));
        }
        info!(task_id = %task_id, "Dead task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_run() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 7, 30).unwrap();
        let next = next_run("*/15 * * * *", at).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 10, 15, 0).unwrap());
        assert!(next_run("not a cron", at).is_err());
    }

    #[test]
    fn test_resolve_format() {
        assert_eq!(resolve_format(ExportKind::AnalyticsExport, None).unwrap(), "jsonl");
        assert_eq!(resolve_format(ExportKind::AnalyticsExport, Some("CSV")).unwrap(), "csv");
        assert!(resolve_format(ExportKind::AuditLogArchive, Some("csv")).is_err());
        assert_eq!(resolve_format(ExportKind::WorkspaceExport, None).unwrap(), "zip");
    }
}
