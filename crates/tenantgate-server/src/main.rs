// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! tenantgate - multi-tenant runtime gateway
//!
//! Serves published workspace applications under `/api/v1/runtime`, the
//! workspace management, export and billing APIs, and runs the background
//! job pipeline in the same process.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tenantgate_core::{Config, SqliteStore};
use tenantgate_server::runtime::GatewayRuntime;

const DEFAULT_FILTER: &str = "tenantgate_server=info,tenantgate_core=info,tower_http=info";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let json = std::env::var("TENANTGATE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the filter reads RUST_LOG
    let dotenv = dotenvy::dotenv();
    init_logging();
    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    info!(
        http_addr = %config.http_addr,
        base_url = %config.base_url,
        object_store = %config.jobs.object_store_dir.display(),
        "Starting tenantgate"
    );

    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    info!("Database ready");

    let runtime = GatewayRuntime::builder()
        .config(config)
        .store(store)
        .build()?
        .start()
        .await?;
    info!(addr = %runtime.local_addr(), "tenantgate ready");

    shutdown_signal().await;
    runtime.shutdown().await?;

    info!("tenantgate shut down");
    Ok(())
}
