// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock VM engine for testing.
//!
//! Runs a Rust closure in place of application code. The default echo
//! handler answers `200` with the request and the isolate's identity, and
//! treats two paths specially: `/crash` fails the isolate and `/sleep`
//! never answers in time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::host::HostBindings;
use super::{Isolate, IsolateSpec, IsolateUsage, VmEngine, VmRequest};
use crate::error::{Error, Result};

/// Request handler run by mock isolates.
pub type MockHandler = Arc<dyn Fn(&IsolateSpec, &VmRequest) -> Result<Value> + Send + Sync>;

/// Mock engine.
pub struct MockEngine {
    handler: MockHandler,
    created: AtomicUsize,
    /// Simulated boot time.
    pub create_delay: Duration,
    /// Memory added to an isolate's usage per handled request.
    pub memory_per_request: u64,
}

impl MockEngine {
    pub fn new(handler: MockHandler) -> Self {
        Self {
            handler,
            created: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            memory_per_request: 0,
        }
    }

    /// Engine whose isolates echo the request.
    pub fn echo() -> Self {
        Self::new(Arc::new(|spec: &IsolateSpec, request: &VmRequest| {
            if request.path == "/crash" {
                return Err(Error::VmFailure("isolate crashed".into()));
            }
            Ok(json!({
                "status": 200,
                "body": {
                    "workspace_id": spec.workspace_id,
                    "version_id": spec.version_id,
                    "method": request.method,
                    "path": request.path,
                    "body": request.body,
                    "user": request.user,
                }
            }))
        }))
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_memory_per_request(mut self, bytes: u64) -> Self {
        self.memory_per_request = bytes;
        self
    }

    /// Isolates created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

struct MockIsolate {
    spec: IsolateSpec,
    handler: MockHandler,
    memory_per_request: u64,
    memory: AtomicU64,
    cpu_micros: AtomicU64,
    _host: HostBindings,
}

#[async_trait]
impl VmEngine for MockEngine {
    async fn create(&self, spec: IsolateSpec, host: HostBindings) -> Result<Arc<dyn Isolate>> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if spec.code.contains("syntax error") {
            return Err(Error::VmFailure("failed to compile application code".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockIsolate {
            spec,
            handler: self.handler.clone(),
            memory_per_request: self.memory_per_request,
            memory: AtomicU64::new(0),
            cpu_micros: AtomicU64::new(0),
            _host: host,
        }))
    }
}

#[async_trait]
impl Isolate for MockIsolate {
    async fn handle(&self, request: &VmRequest) -> Result<Value> {
        if request.path == "/sleep" {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let started = std::time::Instant::now();
        let result = (self.handler)(&self.spec, request);
        self.cpu_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.memory.fetch_add(self.memory_per_request, Ordering::Relaxed);
        result
    }

    fn usage(&self) -> IsolateUsage {
        IsolateUsage {
            memory_bytes: self.memory.load(Ordering::Relaxed),
            cpu_time: Duration::from_micros(self.cpu_micros.load(Ordering::Relaxed)),
        }
    }
}
