// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic housekeeping.
//!
//! Reaps export artifacts past retention, enqueues due subscriptions and
//! enforces retention on sessions, access events, idempotency records and
//! soft-deleted workspaces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::service::ExportService;
use crate::config::AccessSettings;
use crate::error::Result;
use crate::store::Store;
use crate::time::chrono_duration;

const BATCH: i64 = 100;

/// Counts of a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions: u64,
    pub access_events: u64,
    pub idempotency: u64,
    pub workspaces: u64,
}

pub struct MaintenanceWorker {
    store: Arc<dyn Store>,
    exports: Arc<ExportService>,
    access: AccessSettings,
    interval: std::time::Duration,
    shutdown: Arc<Notify>,
}

impl MaintenanceWorker {
    pub fn new(
        store: Arc<dyn Store>,
        exports: Arc<ExportService>,
        access: AccessSettings,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            exports,
            access,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the maintenance loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Maintenance worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.run_once(crate::time::now()).await;
        }

        info!("Maintenance worker stopped");
    }

    /// One pass over every housekeeping duty. Failures are logged per duty.
    pub async fn run_once(&self, now: DateTime<Utc>) {
        match self.reap_exports(now).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Expired exports reaped"),
            Err(e) => error!(error = %e, "Export reaping failed"),
        }
        match self.run_subscriptions(now).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Subscription exports queued"),
            Err(e) => error!(error = %e, "Subscription scheduling failed"),
        }
        match self.sweep_retention(now).await {
            Ok(stats) => debug!(?stats, "Retention sweep done"),
            Err(e) => error!(error = %e, "Retention sweep failed"),
        }
    }

    /// Delete artifacts of completed jobs past `expires_at` and mark them expired.
    pub async fn reap_exports(&self, now: DateTime<Utc>) -> Result<usize> {
        let jobs = self.store.expired_export_jobs(now, BATCH).await?;
        let mut reaped = 0;
        for job in jobs {
            if let Err(e) = self.exports.remove_files(&job).await {
                warn!(job_id = %job.id, error = %e, "Failed to delete export artifact");
                continue;
            }
            self.store.mark_export_expired(job.id).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    pub async fn run_subscriptions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.exports.run_due_subscriptions(now).await
    }

    /// Delete expired state and purge workspaces past their deletion grace period.
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<SweepStats> {
        let mut stats = SweepStats {
            sessions: self.store.delete_expired_sessions(now).await?,
            ..SweepStats::default()
        };

        let cutoff = now - chrono_duration(self.access.event_retention);
        stats.access_events = self.store.delete_access_events_before(cutoff).await?;
        stats.idempotency = self.store.delete_expired_idempotency(now).await?;

        for workspace_id in self.store.workspaces_due_for_purge(now, BATCH).await? {
            let jobs = self
                .store
                .list_export_jobs(workspace_id, &[], i64::MAX)
                .await?;
            for job in &jobs {
                self.exports.remove_files(job).await?;
            }
            self.store.purge_workspace(workspace_id, now).await?;
            info!(workspace_id = %workspace_id, exports = jobs.len(), "Workspace purged");
            stats.workspaces += 1;
        }
        Ok(stats)
    }
}
