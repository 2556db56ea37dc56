// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared handler state and the wiring of core components.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use tenantgate_core::access::AccessController;
use tenantgate_core::audit::AuditSink;
use tenantgate_core::billing::{BillingEngine, Catalog};
use tenantgate_core::captcha::{CaptchaVerifier, DisabledCaptcha, SiteVerifyCaptcha};
use tenantgate_core::dispatcher::{Dispatcher, RuntimeServices};
use tenantgate_core::execution::{ExecutionHandoff, HttpExecutionClient, UnconfiguredHandoff};
use tenantgate_core::jobs::{ExportService, LocalObjectStore};
use tenantgate_core::config::VmEngineKind;
use tenantgate_core::vm::{ScriptEngine, SqliteWorkspaceDb, UnconfiguredEngine, VmEngine, VmPool};
use tenantgate_core::{Config, Result, Store};

use crate::auth::TokenVerifier;

/// Outstanding execution starts before the handoff sheds load.
const MAX_EXECUTIONS_IN_FLIGHT: usize = 64;

/// Audit write attempts before an entry goes to the retry queue.
const AUDIT_WRITE_ATTEMPTS: u32 = 3;

/// External collaborators of the request path.
pub struct Collaborators {
    pub engine: Arc<dyn VmEngine>,
    pub handoff: Arc<dyn ExecutionHandoff>,
    pub captcha: Arc<dyn CaptchaVerifier>,
}

impl Collaborators {
    /// Collaborators described by the configuration.
    ///
    /// Embedders may replace the engine through
    /// [`crate::runtime::GatewayRuntimeBuilder::engine`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let handoff: Arc<dyn ExecutionHandoff> = match &config.execution_url {
            Some(url) => Arc::new(HttpExecutionClient::new(
                url,
                config.timeouts.execute,
                MAX_EXECUTIONS_IN_FLIGHT,
            )?),
            None => {
                warn!("TENANTGATE_EXECUTION_URL not set, execute requests will be refused");
                Arc::new(UnconfiguredHandoff)
            }
        };
        let captcha: Arc<dyn CaptchaVerifier> = match &config.captcha {
            Some(settings) => Arc::new(SiteVerifyCaptcha::new(settings.clone())?),
            None => {
                warn!("CAPTCHA backend not configured, required checks will fail as unavailable");
                Arc::new(DisabledCaptcha)
            }
        };
        let engine: Arc<dyn VmEngine> = match config.vm.engine {
            VmEngineKind::Script => Arc::new(ScriptEngine),
            VmEngineKind::Disabled => {
                warn!("VM engine disabled, code-backed workspaces will answer 503");
                Arc::new(UnconfiguredEngine)
            }
        };
        Ok(Self {
            engine,
            handoff,
            captcha,
        })
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<Dispatcher>,
    pub billing: Arc<BillingEngine>,
    pub exports: Arc<ExportService>,
    pub objects: LocalObjectStore,
    pub audit: AuditSink,
    pub tokens: Option<TokenVerifier>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the core components around `store`.
    pub fn new(config: Config, store: Arc<dyn Store>, collaborators: Collaborators) -> Result<Self> {
        let audit = AuditSink::new(store.clone(), AUDIT_WRITE_ATTEMPTS);
        let billing = Arc::new(BillingEngine::new(
            store.clone(),
            Catalog::standard(config.billing.currency.clone()),
            audit.clone(),
        ));
        let vm = VmPool::new(
            collaborators.engine,
            Arc::new(SqliteWorkspaceDb::new(config.vm.db_dir.clone())),
            config.vm.clone(),
        )?;

        let services = RuntimeServices {
            store: store.clone(),
            access: Arc::new(AccessController::new(
                store.clone(),
                config.access.clone(),
                config.runtime.origin_check,
            )),
            captcha: collaborators.captcha,
            billing: billing.clone(),
            handoff: collaborators.handoff,
            vm: Arc::new(vm),
            audit: audit.clone(),
        };
        let dispatcher = Arc::new(Dispatcher::new(services, &config));

        let objects = LocalObjectStore::new(config.jobs.object_store_dir.clone());
        let exports = Arc::new(ExportService::new(
            store.clone(),
            objects.clone(),
            audit.clone(),
            config.jobs.clone(),
        ));

        let tokens = config.jwt_secret.as_deref().map(TokenVerifier::new);
        if tokens.is_none() {
            info!("TENANTGATE_JWT_SECRET not set, only anonymous runtime access is possible");
        }

        Ok(Self {
            config: Arc::new(config),
            store,
            dispatcher,
            billing,
            exports,
            objects,
            audit,
            tokens,
            started_at: Instant::now(),
        })
    }
}
