// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for tenantgate.
//!
//! [`GatewayRuntime`] runs the HTTP server together with the background
//! workers: job workers for exports and audit retries, the maintenance
//! worker, and the idle-isolate sweeper.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenantgate_core::{Config, SqliteStore};
//! use tenantgate_server::runtime::GatewayRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
//!
//!     let runtime = GatewayRuntime::builder()
//!         .config(config)
//!         .store(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use tenantgate_core::captcha::CaptchaVerifier;
use tenantgate_core::execution::ExecutionHandoff;
use tenantgate_core::jobs::{AuditRetryHandler, ExportHandler, JobHandler, JobWorker, MaintenanceWorker};
use tenantgate_core::vm::{IdleSweeper, VmEngine};
use tenantgate_core::{Config, Store};

use crate::api;
use crate::state::{AppState, Collaborators};

/// Builder for a [`GatewayRuntime`].
pub struct GatewayRuntimeBuilder {
    config: Option<Config>,
    store: Option<Arc<dyn Store>>,
    engine: Option<Arc<dyn VmEngine>>,
    handoff: Option<Arc<dyn ExecutionHandoff>>,
    captcha: Option<Arc<dyn CaptchaVerifier>>,
    job_workers: usize,
    sweep_interval: Duration,
}

impl Default for GatewayRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: None,
            store: None,
            engine: None,
            handoff: None,
            captcha: None,
            job_workers: 2,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl GatewayRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the JavaScript engine used by the VM pool.
    ///
    /// Default: the engine selected by `TENANTGATE_VM_ENGINE`.
    pub fn engine(mut self, engine: Arc<dyn VmEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Override the execution handoff.
    ///
    /// Default: HTTP client for `execution_url`, if configured.
    pub fn handoff(mut self, handoff: Arc<dyn ExecutionHandoff>) -> Self {
        self.handoff = Some(handoff);
        self
    }

    /// Override the CAPTCHA verifier.
    ///
    /// Default: site-verify client for the configured backend, if any.
    pub fn captcha(mut self, captcha: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = Some(captcha);
        self
    }

    /// Number of job worker tasks.
    ///
    /// Default: 2
    pub fn job_workers(mut self, count: usize) -> Self {
        self.job_workers = count.max(1);
        self
    }

    /// How often idle isolates are evicted.
    ///
    /// Default: 30 seconds
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Build the runtime configuration.
    pub fn build(self) -> Result<GatewayRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;

        let mut collaborators = Collaborators::from_config(&config)?;
        if let Some(engine) = self.engine {
            collaborators.engine = engine;
        }
        if let Some(handoff) = self.handoff {
            collaborators.handoff = handoff;
        }
        if let Some(captcha) = self.captcha {
            collaborators.captcha = captcha;
        }

        Ok(GatewayRuntimeConfig {
            config,
            store,
            collaborators,
            job_workers: self.job_workers,
            sweep_interval: self.sweep_interval,
        })
    }
}

/// Configuration for a [`GatewayRuntime`].
pub struct GatewayRuntimeConfig {
    config: Config,
    store: Arc<dyn Store>,
    collaborators: Collaborators,
    job_workers: usize,
    sweep_interval: Duration,
}

/// A spawned background task and its shutdown signal.
struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl GatewayRuntimeConfig {
    /// Bind the listener and spawn the server and workers.
    pub async fn start(self) -> Result<GatewayRuntime> {
        let bind_addr = self.config.http_addr;
        let state = AppState::new(self.config, self.store.clone(), self.collaborators)?;
        let config = state.config.clone();

        let mut workers = Vec::new();

        let handlers: Vec<Arc<dyn JobHandler>> = ExportHandler::all(
            self.store.clone(),
            state.objects.clone(),
            config.jobs.export_retention,
        )
        .into_iter()
        .map(|h| Arc::new(h) as Arc<dyn JobHandler>)
        .chain(std::iter::once(
            Arc::new(AuditRetryHandler::new(self.store.clone())) as Arc<dyn JobHandler>,
        ))
        .collect();
        for _ in 0..self.job_workers {
            let worker = handlers.iter().fold(
                JobWorker::new(self.store.clone(), config.jobs.clone(), config.timeouts.job_claim),
                |worker, handler| worker.register(handler.clone()),
            );
            let shutdown = worker.shutdown_handle();
            workers.push(Worker {
                name: "Job worker",
                handle: tokio::spawn(async move { worker.run().await }),
                shutdown,
            });
        }

        let maintenance = MaintenanceWorker::new(
            self.store.clone(),
            state.exports.clone(),
            config.access.clone(),
            config.jobs.maintenance_interval,
        );
        let shutdown = maintenance.shutdown_handle();
        workers.push(Worker {
            name: "Maintenance worker",
            handle: tokio::spawn(async move { maintenance.run().await }),
            shutdown,
        });

        let sweeper = IdleSweeper::new(state.dispatcher.vm_pool().clone(), self.sweep_interval);
        let shutdown = sweeper.shutdown_handle();
        workers.push(Worker {
            name: "Idle sweeper",
            handle: tokio::spawn(async move { sweeper.run().await }),
            shutdown,
        });

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let server_handle = tokio::spawn(serve(listener, state.clone(), server_shutdown_rx));

        info!(
            bind_addr = %local_addr,
            job_workers = self.job_workers,
            "GatewayRuntime started"
        );

        Ok(GatewayRuntime {
            server_handle,
            server_shutdown_tx,
            workers,
            state,
            local_addr,
        })
    }
}

/// A running gateway.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GatewayRuntime {
    server_handle: JoinHandle<Result<()>>,
    server_shutdown_tx: watch::Sender<bool>,
    workers: Vec<Worker>,
    state: AppState,
    local_addr: SocketAddr,
}

impl GatewayRuntime {
    pub fn builder() -> GatewayRuntimeBuilder {
        GatewayRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting requests, drain in-flight ones, and stop the workers.
    pub async fn shutdown(self) -> Result<()> {
        info!("GatewayRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        for worker in &self.workers {
            worker.shutdown.notify_one();
        }

        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
            }
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("GatewayRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("HTTP server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Whether the server and every worker are still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && self.workers.iter().all(|w| !w.handle.is_finished())
    }
}

async fn serve(listener: TcpListener, state: AppState, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let app = api::router(state);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_config_and_store() {
        let err = GatewayRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("config is required"));

        let err = GatewayRuntime::builder()
            .config(Config::new("sqlite::memory:"))
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("store is required"));
    }
}
