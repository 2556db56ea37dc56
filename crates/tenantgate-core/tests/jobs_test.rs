// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export pipeline: worker, dead-letter queue, replay and maintenance.

mod common;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::io::AsyncReadExt;

use common::*;
use tenantgate_core::audit::AuditRecord;
use tenantgate_core::jobs::service::{ExportRequest, SubscriptionRequest};
use tenantgate_core::jobs::{
    ExportHandler, JobHandler, JobWorker, LocalObjectStore, MaintenanceWorker, ReplayQuery,
};
use tenantgate_core::store::{ExportKind, ExportStatus, Store, TaskEntry, TaskState};
use tenantgate_core::{Error, RequestContext, Result};

/// Fails with an I/O timeout until switched off.
struct Flaky {
    inner: ExportHandler,
    failing: AtomicBool,
}

#[async_trait]
impl JobHandler for Flaky {
    fn queue(&self) -> &'static str {
        self.inner.queue()
    }

    async fn run(&self, ctx: &RequestContext, task: &TaskEntry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "io timeout",
            )));
        }
        self.inner.run(ctx, task).await
    }

    async fn on_dead(&self, task: &TaskEntry, error: &str) -> Result<()> {
        self.inner.on_dead(task, error).await
    }
}

#[tokio::test]
async fn test_dead_export_retried_and_downloadable() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;

    let flaky = Arc::new(Flaky {
        inner: ExportHandler::new(
            ExportKind::WorkspaceExport,
            gw.store.clone(),
            gw.objects.clone(),
            gw.jobs.export_retention,
        ),
        failing: AtomicBool::new(true),
    });
    let worker = JobWorker::new(gw.store.clone(), gw.jobs.clone(), Duration::from_secs(5))
        .register(flaky.clone());

    let owner = as_user(ws.owner_user_id);
    let job = gw
        .exports
        .request(&owner, &ws, ExportKind::WorkspaceExport, ExportRequest::default())
        .await
        .unwrap();

    for _ in 0..gw.jobs.max_attempts {
        assert_eq!(worker.run_once().await.unwrap(), 1);
    }
    assert_eq!(worker.run_once().await.unwrap(), 0);

    let dead = gw.exports.list_dead(None, 0, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, job.id);
    assert_eq!(dead[0].attempts, i64::from(gw.jobs.max_attempts));
    assert!(dead[0].last_error.as_deref().unwrap().contains("io timeout"));
    let failed = gw.exports.get(ws.id, job.id).await.unwrap();
    assert_eq!(failed.status, ExportStatus::Failed);

    let before = tenantgate_core::time::now();
    let revived = gw.exports.retry_dead(&admin(), job.id).await.unwrap();
    assert_eq!(revived.state, TaskState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.available_at >= before - ChronoDuration::seconds(1));
    assert_eq!(
        gw.exports.get(ws.id, job.id).await.unwrap().status,
        ExportStatus::Queued
    );

    flaky.failing.store(false, Ordering::SeqCst);
    assert_eq!(worker.run_once().await.unwrap(), 1);

    let done = gw.exports.get(ws.id, job.id).await.unwrap();
    assert_eq!(done.status, ExportStatus::Completed);
    let completed_at = done.completed_at.unwrap();
    assert_eq!(
        done.expires_at.unwrap() - completed_at,
        ChronoDuration::from_std(gw.jobs.export_retention).unwrap()
    );

    let mut download = gw.exports.download(ws.id, job.id).await.unwrap();
    assert_eq!(download.content_type, "application/zip");
    assert!(download.file_name.starts_with("workspace-demo-"));
    let mut magic = [0u8; 2];
    download.file.read_exact(&mut magic).await.unwrap();
    assert_eq!(&magic, b"PK");
    assert_eq!(Some(download.size as i64), done.file_size);

    let manifest_key = LocalObjectStore::export_key(ws.id, job.id, "manifest.json");
    assert!(gw.objects.exists(&manifest_key).await.unwrap());
    assert!(gw.exports.list_dead(None, 0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_workspace_fails_without_retry() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    let job = gw
        .exports
        .request(
            &as_user(ws.owner_user_id),
            &ws,
            ExportKind::WorkspaceExport,
            ExportRequest::default(),
        )
        .await
        .unwrap();

    // Deleting the workspace makes the job unrunnable.
    let now = tenantgate_core::time::now();
    gw.store
        .schedule_workspace_deletion(ws.id, now + ChronoDuration::days(30), now)
        .await
        .unwrap();

    let worker = gw.worker();
    worker.run_once().await.unwrap();
    let task = gw.store.get_task(job.id).await.unwrap().unwrap();
    assert_eq!(task.state, TaskState::Dead);
    assert_eq!(task.attempts, 1);

    let failed = gw.store.get_export_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ExportStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Workspace not found"));
}

#[tokio::test]
async fn test_archive_replay_cursor_covers_filtered_set() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    let owner = as_user(ws.owner_user_id);

    for i in 0..7 {
        let action = if i % 2 == 0 { "member_added" } else { "version_published" };
        gw.audit
            .record(
                &owner,
                AuditRecord::new(ws.id, action, "member").target(format!("m{i}")),
            )
            .await;
    }

    let job = gw
        .exports
        .request(&owner, &ws, ExportKind::AuditLogArchive, ExportRequest::default())
        .await
        .unwrap();
    let worker = gw.worker();
    while worker.run_once().await.unwrap() > 0 {}
    assert_eq!(
        gw.exports.get(ws.id, job.id).await.unwrap().status,
        ExportStatus::Completed
    );

    let filters = BTreeMap::from([("action".to_string(), "member_added".to_string())]);
    let mut seen = Vec::new();
    let mut offset = 0;
    loop {
        let page = gw
            .exports
            .replay(
                ws.id,
                job.id,
                &ReplayQuery {
                    filters: filters.clone(),
                    offset,
                    limit: Some(3),
                    ..ReplayQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.dataset, "audit_logs");
        seen.extend(
            page.records
                .iter()
                .map(|r| r["target_id"].as_str().unwrap().to_string()),
        );
        match page.next_offset {
            Some(next) => offset = next,
            None => break,
        }
    }

    let unique: HashSet<_> = seen.iter().cloned().collect();
    assert_eq!(seen.len(), 4);
    assert_eq!(unique, HashSet::from(["m0", "m2", "m4", "m6"].map(String::from)));

    let err = gw
        .exports
        .replay(
            ws.id,
            job.id,
            &ReplayQuery {
                filters: BTreeMap::from([("ip".to_string(), "1.2.3.4".to_string())]),
                ..ReplayQuery::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_export_formats_and_ranges_are_validated() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    let owner = as_user(ws.owner_user_id);

    let err = gw
        .exports
        .request(
            &owner,
            &ws,
            ExportKind::AnalyticsExport,
            ExportRequest {
                format: Some("xml".into()),
                ..ExportRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");

    let now = tenantgate_core::time::now();
    let err = gw
        .exports
        .request(
            &owner,
            &ws,
            ExportKind::ExecutionLogArchive,
            ExportRequest {
                range_start: Some(now),
                range_end: Some(now - ChronoDuration::hours(1)),
                ..ExportRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");

    let err = gw
        .exports
        .request(
            &anonymous("10.0.0.9"),
            &ws,
            ExportKind::WorkspaceExport,
            ExportRequest::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthRequired));
}

#[tokio::test]
async fn test_reaper_expires_artifacts() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    let job = gw
        .exports
        .request(
            &as_user(ws.owner_user_id),
            &ws,
            ExportKind::AnalyticsExport,
            ExportRequest {
                format: Some("csv".into()),
                ..ExportRequest::default()
            },
        )
        .await
        .unwrap();
    gw.worker().run_once().await.unwrap();
    let done = gw.exports.get(ws.id, job.id).await.unwrap();
    let key = done.file_path.clone().unwrap();
    assert!(gw.objects.exists(&key).await.unwrap());

    let maintenance = MaintenanceWorker::new(
        gw.store.clone(),
        gw.exports.clone(),
        gw.access.clone(),
        gw.jobs.maintenance_interval,
    );
    let later = done.expires_at.unwrap() + ChronoDuration::minutes(1);
    assert_eq!(maintenance.reap_exports(later).await.unwrap(), 1);
    assert_eq!(maintenance.reap_exports(later).await.unwrap(), 0);

    assert!(!gw.objects.exists(&key).await.unwrap());
    assert_eq!(
        gw.exports.get(ws.id, job.id).await.unwrap().status,
        ExportStatus::Expired
    );
    let err = gw.exports.download(ws.id, job.id).await.unwrap_err();
    assert!(matches!(err, Error::ExportExpired));
}

#[tokio::test]
async fn test_subscription_enqueues_when_due() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    let subscription = gw
        .exports
        .create_subscription(
            &as_user(ws.owner_user_id),
            &ws,
            SubscriptionRequest {
                cron: "*/5 * * * *".into(),
                format: None,
                event_types: vec!["execute".into()],
            },
        )
        .await
        .unwrap();
    assert_eq!(subscription.format, "jsonl");

    let maintenance = MaintenanceWorker::new(
        gw.store.clone(),
        gw.exports.clone(),
        gw.access.clone(),
        gw.jobs.maintenance_interval,
    );
    let due = subscription.next_run_at + ChronoDuration::seconds(1);
    assert_eq!(maintenance.run_subscriptions(due).await.unwrap(), 1);
    assert_eq!(maintenance.run_subscriptions(due).await.unwrap(), 0);

    let jobs = gw
        .exports
        .list(ws.id, &[ExportKind::AnalyticsExport], 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].options["subscription_id"], subscription.id.to_string());

    let err = gw
        .exports
        .create_subscription(
            &as_user(ws.owner_user_id),
            &ws,
            SubscriptionRequest {
                cron: "not a cron".into(),
                format: None,
                event_types: vec![],
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_request");
}

#[tokio::test]
async fn test_retention_sweep_purges_workspaces_and_sessions() {
    let gw = TestGateway::new().await;
    let ws = gw.published("demo", |_| {}).await;
    gw.dispatcher
        .entry(&anonymous("10.0.0.4"), &call("demo"))
        .await
        .unwrap();

    let now = tenantgate_core::time::now();
    gw.store
        .schedule_workspace_deletion(ws.id, now + ChronoDuration::hours(1), now)
        .await
        .unwrap();

    let maintenance = MaintenanceWorker::new(
        gw.store.clone(),
        gw.exports.clone(),
        gw.access.clone(),
        gw.jobs.maintenance_interval,
    );
    let stats = maintenance
        .sweep_retention(now + ChronoDuration::days(2))
        .await
        .unwrap();
    assert_eq!(stats.workspaces, 1);
    assert_eq!(stats.sessions, 1);
    assert!(gw.store.get_workspace(ws.id).await.unwrap().is_none());
}
