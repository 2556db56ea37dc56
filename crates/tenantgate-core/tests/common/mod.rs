// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for tenantgate-core integration tests.
//!
//! Wires every core component against an in-memory store and a temporary
//! object-store directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use uuid::Uuid;

use tenantgate_core::access::AccessController;
use tenantgate_core::audit::AuditSink;
use tenantgate_core::billing::{BillingEngine, Catalog};
use tenantgate_core::captcha::StaticCaptcha;
use tenantgate_core::config::{
    AccessSettings, BackoffSettings, JobSettings, OriginCheck, VmSettings,
};
use tenantgate_core::dispatcher::{Dispatcher, RuntimeCall, RuntimeServices};
use tenantgate_core::execution::StaticHandoff;
use tenantgate_core::jobs::{ExportService, JobWorker, LocalObjectStore};
use tenantgate_core::store::{
    AccessMode, DataClassification, DeleteStage, NewVersion, Plan, RateLimitConfig, SqliteStore,
    Store, Workspace,
};
use tenantgate_core::vm::{MockEngine, SqliteWorkspaceDb, VmPool};
use tenantgate_core::{Config, Principal, RequestContext};

pub const CAPTCHA_TOKEN: &str = "good-token";

/// Fully wired core.
pub struct TestGateway {
    pub store: Arc<SqliteStore>,
    pub audit: AuditSink,
    pub billing: Arc<BillingEngine>,
    pub handoff: Arc<StaticHandoff>,
    pub dispatcher: Dispatcher,
    pub exports: Arc<ExportService>,
    pub objects: LocalObjectStore,
    pub jobs: JobSettings,
    pub access: AccessSettings,
    pub dir: TempDir,
}

impl TestGateway {
    pub async fn new() -> Self {
        let store = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to open in-memory store"),
        );
        let dir = TempDir::new().expect("Failed to create temp dir");
        let audit = AuditSink::new(store.clone(), 3);
        let handoff = Arc::new(StaticHandoff::accepting());
        let billing = Arc::new(BillingEngine::new(
            store.clone(),
            Catalog::standard("USD"),
            audit.clone(),
        ));

        let config = Config {
            base_url: "http://platform.local:8080".into(),
            ..Config::new("sqlite::memory:")
        };
        let access = AccessSettings::default();
        let vm = VmPool::new(
            Arc::new(MockEngine::echo()),
            Arc::new(SqliteWorkspaceDb::new(dir.path().join("workspaces"))),
            VmSettings::default(),
        )
        .expect("Failed to create VM pool");

        let services = RuntimeServices {
            store: store.clone(),
            access: Arc::new(AccessController::new(
                store.clone(),
                access.clone(),
                OriginCheck::All,
            )),
            captcha: Arc::new(StaticCaptcha::accepting([CAPTCHA_TOKEN])),
            billing: billing.clone(),
            handoff: handoff.clone(),
            vm: Arc::new(vm),
            audit: audit.clone(),
        };
        let dispatcher = Dispatcher::new(services, &config);

        let jobs = JobSettings {
            object_store_dir: dir.path().join("objects"),
            max_attempts: 3,
            backoff: BackoffSettings {
                base: Duration::ZERO,
                max: Duration::ZERO,
                jitter: 0.0,
            },
            ..JobSettings::default()
        };
        let objects = LocalObjectStore::new(jobs.object_store_dir.clone());
        let exports = Arc::new(ExportService::new(
            store.clone(),
            objects.clone(),
            audit.clone(),
            jobs.clone(),
        ));

        Self {
            store,
            audit,
            billing,
            handoff,
            dispatcher,
            exports,
            objects,
            jobs,
            access,
            dir,
        }
    }

    /// Worker over every export queue.
    pub fn worker(&self) -> JobWorker {
        let mut worker = JobWorker::new(self.store.clone(), self.jobs.clone(), Duration::from_secs(5));
        for handler in tenantgate_core::jobs::ExportHandler::all(
            self.store.clone(),
            self.objects.clone(),
            self.jobs.export_retention,
        ) {
            worker = worker.register(Arc::new(handler));
        }
        worker
    }

    /// Create a workspace and publish a version with a two-field form.
    pub async fn published(&self, slug: &str, configure: impl FnOnce(&mut Workspace)) -> Workspace {
        self.published_with(slug, json!({}), true, configure).await
    }

    pub async fn published_with(
        &self,
        slug: &str,
        config: Value,
        workflow: bool,
        configure: impl FnOnce(&mut Workspace),
    ) -> Workspace {
        let now = tenantgate_core::time::now();
        let mut ws = Workspace {
            id: Uuid::new_v4(),
            slug: slug.into(),
            name: format!("Workspace {slug}"),
            owner_user_id: Uuid::new_v4(),
            plan: Plan::Free,
            region: "eu".into(),
            access_mode: AccessMode::PublicAnonymous,
            data_classification: DataClassification::Public,
            rate_limit: RateLimitConfig::default(),
            allowed_origins: vec![],
            require_captcha: false,
            delete_stage: DeleteStage::Active,
            delete_deadline: None,
            current_version_id: None,
            created_at: now,
            updated_at: now,
        };
        configure(&mut ws);
        self.store
            .create_workspace(&ws)
            .await
            .expect("Failed to create workspace");
        self.store
            .publish_version(
                ws.id,
                &NewVersion {
                    ui_schema: json!({"fields": [
                        {"key": "title", "type": "string", "required": true, "max": 80},
                        {"key": "count", "type": "integer", "required": true, "min": 1, "map_to": "qty"},
                    ]}),
                    config,
                    workflow_id: workflow.then(Uuid::new_v4),
                    ..NewVersion::default()
                },
                ws.owner_user_id,
                now,
            )
            .await
            .expect("Failed to publish version");
        self.store
            .get_workspace(ws.id)
            .await
            .expect("Failed to load workspace")
            .expect("Workspace disappeared")
    }
}

/// Runtime call addressed by slug on the platform host.
pub fn call(slug: &str) -> RuntimeCall {
    RuntimeCall {
        host: Some("platform.local".into()),
        slug: slug.into(),
        path: format!("/api/v1/runtime/{slug}"),
        ..RuntimeCall::default()
    }
}

/// Same as [`call`] but reusing a session.
pub fn call_with_session(slug: &str, session_id: Uuid) -> RuntimeCall {
    RuntimeCall {
        session_id: Some(session_id),
        ..call(slug)
    }
}

pub fn anonymous(ip: &str) -> RequestContext {
    RequestContext::new(ip, "integration-test")
}

pub fn as_user(user_id: Uuid) -> RequestContext {
    RequestContext::new("10.1.0.1", "integration-test").with_principal(Some(Principal {
        user_id,
        is_admin: false,
    }))
}

pub fn admin() -> RequestContext {
    RequestContext::new("10.1.0.2", "integration-test").with_principal(Some(Principal {
        user_id: Uuid::new_v4(),
        is_admin: true,
    }))
}

/// Valid execute inputs for the published form.
pub fn inputs() -> Value {
    json!({"title": "hello", "count": 2})
}
