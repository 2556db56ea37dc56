// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cursored reads over completed log archives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::ExportKind;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

/// Filters and cursor of a replay request.
#[derive(Debug, Clone, Default)]
pub struct ReplayQuery {
    /// Field equality filters; keys depend on the archive dataset.
    pub filters: BTreeMap<String, String>,
    /// Inclusive lower bound on the record time.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the record time.
    pub to: Option<DateTime<Utc>>,
    pub offset: i64,
    pub limit: Option<i64>,
}

/// One page of replayed records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayPage {
    pub dataset: &'static str,
    pub records: Vec<Value>,
    /// Offset of the next page; absent once a short page was returned.
    pub next_offset: Option<i64>,
}

/// Filter keys and time field of an archive kind.
pub fn replay_fields(kind: ExportKind) -> Result<(&'static str, &'static [&'static str], &'static str)> {
    match kind {
        ExportKind::ExecutionLogArchive => Ok((
            "executions",
            &["execution_id", "workflow_id", "user_id", "status"],
            "created_at",
        )),
        ExportKind::AuditLogArchive => Ok((
            "audit_logs",
            &["action", "actor_user_id", "target_type", "target_id"],
            "occurred_at",
        )),
        other => Err(Error::InvalidRequest(format!("{other} does not support replay"))),
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Replay a JSONL archive body.
///
/// Records matching every filter and the time range are counted from zero;
/// `offset` skips that many matches and at most `limit` are returned.
pub fn replay(kind: ExportKind, body: &[u8], query: &ReplayQuery) -> Result<ReplayPage> {
    let (dataset, allowed, time_field) = replay_fields(kind)?;
    if let Some(key) = query.filters.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(Error::InvalidRequest(format!(
            "unknown filter '{key}' for {dataset}"
        )));
    }
    if query.offset < 0 {
        return Err(Error::InvalidRequest("offset must not be negative".into()));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let text = std::str::from_utf8(body)
        .map_err(|e| Error::Internal(format!("archive is not UTF-8: {e}")))?;

    let mut matched = 0i64;
    let mut records = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let record: Value = serde_json::from_str(line)?;

        let filters_ok = query.filters.iter().all(|(key, want)| {
            record
                .get(key)
                .and_then(field_text)
                .is_some_and(|have| have == *want)
        });
        if !filters_ok {
            continue;
        }

        if query.from.is_some() || query.to.is_some() {
            let at = record
                .get(time_field)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            let Some(at) = at else { continue };
            if query.from.is_some_and(|from| at < from) || query.to.is_some_and(|to| at >= to) {
                continue;
            }
        }

        if matched >= query.offset {
            records.push(record);
        }
        matched += 1;
        if records.len() as i64 == limit {
            break;
        }
    }

    let next_offset = (records.len() as i64 == limit).then_some(query.offset + limit);
    Ok(ReplayPage {
        dataset,
        records,
        next_offset,
    })
}
