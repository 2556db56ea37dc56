// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded per-workspace isolate pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::db::WorkspaceDb;
use super::host::{HostBindings, fetch_client};
use super::{Isolate, IsolateSpec, VmEngine, VmRequest, VmResponse, app_code};
use crate::config::VmSettings;
use crate::error::{Error, Result};
use crate::store::WorkspaceVersion;

/// Why an isolate left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Idle,
    Capacity,
    VersionChanged,
    Quota,
    Crashed,
    Timeout,
    Invalidated,
}

impl EvictReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capacity => "capacity",
            Self::VersionChanged => "version_changed",
            Self::Quota => "quota",
            Self::Crashed => "crashed",
            Self::Timeout => "timeout",
            Self::Invalidated => "invalidated",
        }
    }
}

struct Slot {
    version_id: Uuid,
    /// Published version number, to keep a newer slot over a stale request.
    version: i64,
    code: String,
    config: serde_json::Value,
    cell: OnceCell<Arc<dyn Isolate>>,
    /// Milliseconds since the pool epoch.
    last_used: AtomicU64,
}

impl Slot {
    fn terminate(&self) {
        if let Some(isolate) = self.cell.get() {
            isolate.terminate();
        }
    }
}

/// At most one isolate per workspace, bounded by `max_isolates`.
pub struct VmPool {
    engine: Arc<dyn VmEngine>,
    db: Arc<dyn WorkspaceDb>,
    client: reqwest::Client,
    fetch_allowlist: Arc<Vec<String>>,
    settings: VmSettings,
    slots: Mutex<HashMap<Uuid, Arc<Slot>>>,
    epoch: Instant,
}

impl VmPool {
    pub fn new(engine: Arc<dyn VmEngine>, db: Arc<dyn WorkspaceDb>, settings: VmSettings) -> Result<Self> {
        Ok(Self {
            engine,
            db,
            client: fetch_client(Duration::from_secs(10))?,
            fetch_allowlist: Arc::new(settings.fetch_allowlist.clone()),
            settings,
            slots: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Number of pooled isolates, including ones still booting.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Warm isolate for `version`, booting one if needed.
    ///
    /// Concurrent callers for the same workspace share one boot. A pooled
    /// isolate of an older version is replaced; one of a newer version is
    /// kept and serves the request.
    pub async fn get_or_create(&self, version: &WorkspaceVersion) -> Result<Arc<dyn Isolate>> {
        self.acquire(version).await.map(|(_, isolate)| isolate)
    }

    async fn acquire(&self, version: &WorkspaceVersion) -> Result<(Arc<Slot>, Arc<dyn Isolate>)> {
        let code = app_code(version)?;
        let workspace_id = version.workspace_id;

        let slot = {
            let mut slots = self.slots.lock().await;
            match slots.get(&workspace_id).cloned() {
                Some(slot) if slot.version_id == version.id => slot,
                Some(slot) if slot.version > version.version => {
                    debug!(
                        workspace_id = %workspace_id,
                        requested = version.version,
                        pooled = slot.version,
                        "Stale version served by newer isolate"
                    );
                    slot
                }
                existing => {
                    if existing.is_some() {
                        if let Some(old) = slots.remove(&workspace_id) {
                            old.terminate();
                        }
                        info!(
                            workspace_id = %workspace_id,
                            reason = EvictReason::VersionChanged.as_str(),
                            "Isolate evicted"
                        );
                    } else if slots.len() >= self.settings.max_isolates.max(1) {
                        evict_lru(&mut slots);
                    }
                    let slot = Arc::new(Slot {
                        version_id: version.id,
                        version: version.version,
                        code: code.to_string(),
                        config: version.config.clone(),
                        cell: OnceCell::new(),
                        last_used: AtomicU64::new(self.now_ms()),
                    });
                    slots.insert(workspace_id, slot.clone());
                    slot
                }
            }
        };

        let created = slot
            .cell
            .get_or_try_init(|| async {
                let spec = IsolateSpec {
                    workspace_id,
                    version_id: slot.version_id,
                    code: slot.code.clone(),
                    config: slot.config.clone(),
                    memory_limit_bytes: self.settings.memory_limit_bytes,
                    cpu_limit: self.settings.cpu_limit,
                };
                let host = HostBindings::new(
                    workspace_id,
                    self.db.clone(),
                    self.client.clone(),
                    self.fetch_allowlist.clone(),
                );
                let started = Instant::now();
                let isolate = self.engine.create(spec, host).await?;
                info!(
                    workspace_id = %workspace_id,
                    version_id = %slot.version_id,
                    boot_ms = started.elapsed().as_millis() as u64,
                    "Isolate created"
                );
                Ok::<_, Error>(isolate)
            })
            .await;

        match created {
            Ok(isolate) => {
                slot.last_used.store(self.now_ms(), Ordering::Relaxed);
                Ok((slot.clone(), isolate.clone()))
            }
            Err(e) => {
                self.remove_slot(workspace_id, &slot).await;
                warn!(workspace_id = %workspace_id, error = %e, "Isolate boot failed");
                Err(e)
            }
        }
    }

    /// Dispatch a request to the workspace's isolate within `deadline`.
    ///
    /// A crash or timeout evicts the isolate; the next request boots a fresh
    /// one. Exceeding the memory or CPU quota evicts after the response.
    pub async fn handle(
        &self,
        version: &WorkspaceVersion,
        request: &VmRequest,
        deadline: Duration,
    ) -> Result<VmResponse> {
        let workspace_id = version.workspace_id;
        let (slot, isolate) = self.acquire(version).await?;

        let raw = match tokio::time::timeout(deadline, isolate.handle(request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                if matches!(e, Error::VmFailure(_)) {
                    self.evict_slot(workspace_id, &slot, EvictReason::Crashed).await;
                }
                return Err(e);
            }
            Err(_) => {
                self.evict_slot(workspace_id, &slot, EvictReason::Timeout).await;
                return Err(Error::DeadlineExceeded { operation: "vm" });
            }
        };

        let usage = isolate.usage();
        if usage.memory_bytes > self.settings.memory_limit_bytes || usage.cpu_time > self.settings.cpu_limit {
            warn!(
                workspace_id = %workspace_id,
                memory_bytes = usage.memory_bytes,
                cpu_ms = usage.cpu_time.as_millis() as u64,
                "Isolate over quota"
            );
            self.evict_slot(workspace_id, &slot, EvictReason::Quota).await;
        }

        VmResponse::from_value(raw)
    }

    /// Drop the workspace's isolate, e.g. after a publish.
    pub async fn invalidate(&self, workspace_id: Uuid) -> bool {
        self.evict(workspace_id, EvictReason::Invalidated).await
    }

    /// Evict isolates idle for longer than `idle_ttl`. Returns the number evicted.
    pub async fn sweep_idle(&self) -> usize {
        let now = self.now_ms();
        let ttl = self.settings.idle_ttl.as_millis() as u64;
        let mut slots = self.slots.lock().await;
        let idle: Vec<Uuid> = slots
            .iter()
            .filter(|(_, slot)| {
                slot.cell.initialized() && now.saturating_sub(slot.last_used.load(Ordering::Relaxed)) >= ttl
            })
            .map(|(id, _)| *id)
            .collect();
        for workspace_id in &idle {
            if let Some(slot) = slots.remove(workspace_id) {
                slot.terminate();
            }
            debug!(workspace_id = %workspace_id, reason = EvictReason::Idle.as_str(), "Isolate evicted");
        }
        idle.len()
    }

    async fn evict(&self, workspace_id: Uuid, reason: EvictReason) -> bool {
        let removed = self.slots.lock().await.remove(&workspace_id);
        match removed {
            Some(slot) => {
                slot.terminate();
                info!(workspace_id = %workspace_id, reason = reason.as_str(), "Isolate evicted");
                true
            }
            None => false,
        }
    }

    /// Evict `slot` only if it is still the workspace's pooled slot.
    async fn evict_slot(&self, workspace_id: Uuid, slot: &Arc<Slot>, reason: EvictReason) -> bool {
        if !self.remove_slot(workspace_id, slot).await {
            return false;
        }
        slot.terminate();
        info!(workspace_id = %workspace_id, reason = reason.as_str(), "Isolate evicted");
        true
    }

    async fn remove_slot(&self, workspace_id: Uuid, slot: &Arc<Slot>) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.get(&workspace_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&workspace_id);
            true
        } else {
            false
        }
    }
}

fn evict_lru(slots: &mut HashMap<Uuid, Arc<Slot>>) {
    let oldest = slots
        .iter()
        .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
        .map(|(id, _)| *id);
    if let Some(workspace_id) = oldest
        && let Some(slot) = slots.remove(&workspace_id)
    {
        slot.terminate();
        info!(
            workspace_id = %workspace_id,
            reason = EvictReason::Capacity.as_str(),
            "Isolate evicted"
        );
    }
}

/// Periodically evicts idle isolates.
pub struct IdleSweeper {
    pool: Arc<VmPool>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl IdleSweeper {
    pub fn new(pool: Arc<VmPool>, interval: Duration) -> Self {
        Self {
            pool,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweeper until the shutdown signal is received.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Isolate sweeper started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.interval) => {
                    let evicted = self.pool.sweep_idle().await;
                    if evicted > 0 {
                        info!(evicted, "Idle isolates evicted");
                    }
                }
            }
        }
        info!("Isolate sweeper stopped");
    }
}
