// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime and job metrics on the global OpenTelemetry meter.
//!
//! Instruments are no-ops until the host installs a meter provider.

use std::sync::OnceLock;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use tracing::debug;
use uuid::Uuid;

struct Instruments {
    runtime_duration: Histogram<f64>,
    runtime_requests: Counter<u64>,
    jobs_completed: Counter<u64>,
}

fn instruments() -> &'static Instruments {
    static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("tenantgate");
        Instruments {
            runtime_duration: meter
                .f64_histogram("tenantgate.runtime.duration")
                .with_description("Runtime request latency")
                .with_unit("s")
                .build(),
            runtime_requests: meter
                .u64_counter("tenantgate.runtime.requests")
                .with_description("Runtime requests by outcome")
                .build(),
            jobs_completed: meter
                .u64_counter("tenantgate.jobs.completed")
                .with_description("Job runs by kind and outcome")
                .build(),
        }
    })
}

/// `2xx`..`5xx` bucket of an HTTP status code.
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Record one runtime operation.
pub fn record_runtime(workspace_id: Option<Uuid>, operation: &'static str, status: u16, took: Duration) {
    let workspace = workspace_id.map(|id| id.to_string()).unwrap_or_else(|| "unknown".to_string());
    let class = status_class(status);
    let attrs = [
        KeyValue::new("workspace_id", workspace.clone()),
        KeyValue::new("status_class", class),
        KeyValue::new("operation", operation),
    ];
    let m = instruments();
    m.runtime_duration.record(took.as_secs_f64(), &attrs);
    m.runtime_requests.add(1, &attrs);
    debug!(
        workspace_id = %workspace,
        status_class = class,
        operation = operation,
        took_seconds = took.as_secs_f64(),
        "Runtime request"
    );
}

/// Record one job run. `outcome` is `succeeded`, `retried` or `dead`.
pub fn record_job(kind: &str, outcome: &'static str) {
    instruments().jobs_completed.add(
        1,
        &[
            KeyValue::new("kind", kind.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(200), "2xx");
        assert_eq!(status_class(304), "3xx");
        assert_eq!(status_class(429), "4xx");
        assert_eq!(status_class(503), "5xx");
    }

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_runtime(Some(Uuid::new_v4()), "entry", 200, Duration::from_millis(3));
        record_job("audit_retry", "succeeded");
    }
}
