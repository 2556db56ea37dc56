// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Export and archive producers.
//!
//! Rows are read from the store page by page and written straight into the
//! artifact's staging file; a page is dropped before the next one is fetched.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::object_store::LocalObjectStore;
use super::queue::queue_for;
use super::{JobHandler, Manifest, ManifestRange};
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::store::{
    AccessEventType, EventQuery, ExportArtifact, ExportJob, ExportKind, ExportStatus, RangePage,
    Store, TaskEntry, Workspace,
};
use crate::time::chrono_duration;

const PAGE_SIZE: i64 = 500;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Dataset name of an archive kind.
pub fn dataset_of(kind: ExportKind) -> &'static str {
    match kind {
        ExportKind::WorkspaceExport => "workspace",
        ExportKind::AnalyticsExport => "access_events",
        ExportKind::ExecutionLogArchive => "executions",
        ExportKind::AuditLogArchive => "audit_logs",
    }
}

/// Formats accepted per kind; the first is the default.
pub fn formats_of(kind: ExportKind) -> &'static [&'static str] {
    match kind {
        ExportKind::WorkspaceExport => &["zip"],
        ExportKind::AnalyticsExport => &["jsonl", "csv"],
        ExportKind::ExecutionLogArchive | ExportKind::AuditLogArchive => &["jsonl"],
    }
}

/// Parse the `event_types` option of an analytics export.
pub fn parse_event_types(options: &Value) -> Result<Vec<AccessEventType>> {
    let Some(raw) = options.get("event_types") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let items = raw
        .as_array()
        .ok_or_else(|| Error::InvalidRequest("event_types must be an array".into()))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::InvalidRequest(format!("unknown event type {v}")))
        })
        .collect()
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn range_label(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> String {
    format!(
        "{}_{}",
        from.map(stamp).unwrap_or_else(|| "start".into()),
        to.map(stamp).unwrap_or_else(|| "latest".into())
    )
}

/// Download file name of a job.
pub fn file_name_for(job: &ExportJob, workspace_slug: &str) -> String {
    match job.kind {
        ExportKind::WorkspaceExport => {
            format!("workspace-{workspace_slug}-{}.zip", stamp(job.created_at))
        }
        kind => format!(
            "{kind}-{}.{}",
            range_label(job.range_start, job.range_end),
            job.format
        ),
    }
}

fn write_jsonl<W: Write, T: Serialize>(out: &mut W, rows: &[T]) -> Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *out, row)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Write the artifact of `job` for `workspace` to `out` and return its manifest.
pub async fn produce(
    store: &dyn Store,
    job: &ExportJob,
    workspace: &Workspace,
    out: &Path,
) -> Result<Manifest> {
    let ranges = ManifestRange {
        from: job.range_start,
        to: job.range_end,
    };
    let mut manifest = Manifest::new(workspace.id, job.kind, &job.format, ranges);
    let file = File::create(out)?;

    match job.kind {
        ExportKind::WorkspaceExport => workspace_zip(store, workspace, &mut manifest, file).await?,
        ExportKind::AnalyticsExport => analytics(store, job, &mut manifest, file).await?,
        ExportKind::ExecutionLogArchive => {
            let mut out = BufWriter::new(file);
            let mut offset = 0;
            loop {
                let page = RangePage {
                    from: job.range_start,
                    to: job.range_end,
                    offset,
                    limit: PAGE_SIZE,
                };
                let rows = store.list_executions(job.workspace_id, page).await?;
                write_jsonl(&mut out, &rows)?;
                offset += rows.len() as i64;
                if (rows.len() as i64) < PAGE_SIZE {
                    break;
                }
            }
            manifest.counts.insert(dataset_of(job.kind).into(), offset);
            out.flush()?;
        }
        ExportKind::AuditLogArchive => {
            let mut out = BufWriter::new(file);
            let mut offset = 0;
            loop {
                let page = RangePage {
                    from: job.range_start,
                    to: job.range_end,
                    offset,
                    limit: PAGE_SIZE,
                };
                let rows = store.list_audit(job.workspace_id, page).await?;
                write_jsonl(&mut out, &rows)?;
                offset += rows.len() as i64;
                if (rows.len() as i64) < PAGE_SIZE {
                    break;
                }
            }
            manifest.counts.insert(dataset_of(job.kind).into(), offset);
            out.flush()?;
        }
    }

    Ok(manifest)
}

async fn analytics(store: &dyn Store, job: &ExportJob, manifest: &mut Manifest, file: File) -> Result<()> {
    let event_types = parse_event_types(&job.options)?;
    let csv = job.format == "csv";

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BufWriter::new(file));
    if csv {
        writer.write_record([
            "id",
            "workspace_id",
            "session_id",
            "ip",
            "event_type",
            "path",
            "captcha_provided",
            "occurred_at",
        ])?;
    }
    let mut offset = 0;
    loop {
        let rows = store
            .list_access_events(&EventQuery {
                workspace_id: job.workspace_id,
                from: job.range_start,
                to: job.range_end,
                event_types: event_types.clone(),
                offset,
                limit: PAGE_SIZE,
            })
            .await?;
        if csv {
            for row in &rows {
                writer.serialize(row)?;
            }
        } else {
            write_jsonl(writer.get_mut(), &rows)?;
        }
        offset += rows.len() as i64;
        if (rows.len() as i64) < PAGE_SIZE {
            break;
        }
    }
    manifest.counts.insert(dataset_of(job.kind).into(), offset);

    writer.flush()?;
    Ok(())
}

async fn workspace_zip(
    store: &dyn Store,
    workspace: &Workspace,
    manifest: &mut Manifest,
    file: File,
) -> Result<()> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(file);
    let id = workspace.id;

    zip.start_file("workspace.json", options)?;
    serde_json::to_writer_pretty(&mut zip, workspace)?;
    manifest.counts.insert("workspace".into(), 1);

    let versions = store.list_versions(id).await?;
    zip.start_file("versions.jsonl", options)?;
    write_jsonl(&mut zip, &versions)?;
    manifest.counts.insert("versions".into(), versions.len() as i64);

    let members = store.list_members(id).await?;
    zip.start_file("members.jsonl", options)?;
    write_jsonl(&mut zip, &members)?;
    manifest.counts.insert("members".into(), members.len() as i64);

    let domains = store.list_domains(id).await?;
    zip.start_file("domains.jsonl", options)?;
    write_jsonl(&mut zip, &domains)?;
    manifest.counts.insert("domains".into(), domains.len() as i64);

    let quotas = store.list_quotas(id).await?;
    zip.start_file("quotas.jsonl", options)?;
    write_jsonl(&mut zip, &quotas)?;
    manifest.counts.insert("quotas".into(), quotas.len() as i64);

    let budget = store.get_budget(id).await?;
    zip.start_file("budget.json", options)?;
    serde_json::to_writer_pretty(&mut zip, &budget)?;
    manifest
        .counts
        .insert("budget".into(), i64::from(budget.is_some()));

    zip.start_file("access_events.jsonl", options)?;
    let mut offset = 0;
    loop {
        let rows = store
            .list_access_events(&EventQuery {
                workspace_id: id,
                from: None,
                to: None,
                event_types: Vec::new(),
                offset,
                limit: PAGE_SIZE,
            })
            .await?;
        write_jsonl(&mut zip, &rows)?;
        offset += rows.len() as i64;
        if (rows.len() as i64) < PAGE_SIZE {
            break;
        }
    }
    manifest.counts.insert("access_events".into(), offset);

    zip.start_file("audit_logs.jsonl", options)?;
    let mut offset = 0;
    loop {
        let rows = store.list_audit(id, RangePage::all(offset, PAGE_SIZE)).await?;
        write_jsonl(&mut zip, &rows)?;
        offset += rows.len() as i64;
        if (rows.len() as i64) < PAGE_SIZE {
            break;
        }
    }
    manifest.counts.insert("audit_logs".into(), offset);

    zip.start_file(MANIFEST_FILE, options)?;
    serde_json::to_writer_pretty(&mut zip, manifest)?;

    zip.finish()?.sync_all()?;
    Ok(())
}

/// Runs export jobs of one kind.
pub struct ExportHandler {
    kind: ExportKind,
    store: Arc<dyn Store>,
    objects: LocalObjectStore,
    retention: Duration,
}

impl ExportHandler {
    pub fn new(
        kind: ExportKind,
        store: Arc<dyn Store>,
        objects: LocalObjectStore,
        retention: Duration,
    ) -> Self {
        Self {
            kind,
            store,
            objects,
            retention,
        }
    }

    /// One handler per export kind.
    pub fn all(store: Arc<dyn Store>, objects: LocalObjectStore, retention: Duration) -> Vec<Self> {
        [
            ExportKind::WorkspaceExport,
            ExportKind::AnalyticsExport,
            ExportKind::ExecutionLogArchive,
            ExportKind::AuditLogArchive,
        ]
        .into_iter()
        .map(|kind| Self::new(kind, store.clone(), objects.clone(), retention))
        .collect()
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    fn queue(&self) -> &'static str {
        queue_for(self.kind)
    }

    async fn run(&self, ctx: &RequestContext, task: &TaskEntry) -> Result<()> {
        let job = self
            .store
            .get_export_job(task.task_id)
            .await?
            .ok_or_else(|| Error::not_found("export_job", task.task_id))?;

        match job.status {
            ExportStatus::Completed | ExportStatus::Expired => {
                debug!(job_id = %job.id, status = %job.status, "Export already finished");
                return Ok(());
            }
            ExportStatus::Failed => {
                return Err(Error::InvalidState(format!("export {} has failed", job.id)));
            }
            ExportStatus::Queued | ExportStatus::Running => {}
        }

        let workspace = self
            .store
            .get_workspace(job.workspace_id)
            .await?
            .ok_or(Error::WorkspaceNotFound)?;

        if !self.store.start_export_job(job.id, crate::time::now()).await? {
            return Err(Error::InvalidState(format!("export {} cannot start", job.id)));
        }

        let file_name = file_name_for(&job, &workspace.slug);
        let key = LocalObjectStore::export_key(job.workspace_id, job.id, &file_name);
        let staging = self.objects.staging_path(&key).await?;
        let produced = produce(self.store.as_ref(), &job, &workspace, &staging).await;
        let manifest = match produced {
            Ok(manifest) if !ctx.is_cancelled() => manifest,
            outcome => {
                if let Err(e) = self.objects.abort(&key).await {
                    warn!(job_id = %job.id, error = %e, "Failed to discard staged export");
                }
                return Err(outcome.err().unwrap_or(Error::Cancelled));
            }
        };

        let file_size = self.objects.commit(&key).await?;
        let manifest_key = LocalObjectStore::export_key(job.workspace_id, job.id, MANIFEST_FILE);
        self.objects
            .put(&manifest_key, &serde_json::to_vec_pretty(&manifest)?)
            .await?;

        let now = crate::time::now();
        let record_count = manifest.total();
        self.store
            .complete_export_job(
                job.id,
                &ExportArtifact {
                    file_path: key,
                    file_name: file_name.clone(),
                    file_size,
                    record_count,
                },
                now,
                now + chrono_duration(self.retention),
            )
            .await?;

        info!(
            job_id = %job.id,
            workspace_id = %job.workspace_id,
            kind = %job.kind,
            file_name = %file_name,
            file_size = file_size,
            records = record_count,
            "Export completed"
        );
        Ok(())
    }

    async fn on_dead(&self, task: &TaskEntry, error: &str) -> Result<()> {
        self.store
            .fail_export_job(task.task_id, error, crate::time::now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    fn job(kind: ExportKind, format: &str) -> ExportJob {
        ExportJob {
            id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            kind,
            status: ExportStatus::Queued,
            requested_by: Uuid::new_v4(),
            format: format.into(),
            options: json!({}),
            range_start: Some(Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()),
            range_end: None,
            file_path: None,
            file_name: None,
            file_size: None,
            record_count: None,
            error: None,
            created_at: Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap(),
            started_at: None,
            completed_at: None,
            expires_at: None,
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(
            file_name_for(&job(ExportKind::WorkspaceExport, "zip"), "demo"),
            "workspace-demo-20250304T050607Z.zip"
        );
        assert_eq!(
            file_name_for(&job(ExportKind::AuditLogArchive, "jsonl"), "demo"),
            "audit_log_archive-20250301T000000Z_latest.jsonl"
        );
    }

    #[test]
    fn test_parse_event_types() {
        assert!(parse_event_types(&json!({})).unwrap().is_empty());
        assert_eq!(
            parse_event_types(&json!({"event_types": ["entry", "execute_success"]})).unwrap(),
            vec![AccessEventType::Entry, AccessEventType::ExecuteSuccess]
        );
        assert!(parse_event_types(&json!({"event_types": ["nope"]})).is_err());
        assert!(parse_event_types(&json!({"event_types": "entry"})).is_err());
    }
}
