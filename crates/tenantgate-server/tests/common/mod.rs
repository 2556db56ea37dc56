// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for HTTP tests: an in-process router over an in-memory
//! store, with test doubles for the engine, handoff and CAPTCHA backend.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use tenantgate_core::captcha::StaticCaptcha;
use tenantgate_core::config::BackoffSettings;
use tenantgate_core::execution::StaticHandoff;
use tenantgate_core::jobs::{ExportHandler, JobWorker};
use tenantgate_core::store::{
    AccessMode, DataClassification, DeleteStage, NewVersion, Plan, RateLimitConfig, SqliteStore,
    Store, Workspace,
};
use tenantgate_core::vm::MockEngine;
use tenantgate_core::Config;
use tenantgate_server::api;
use tenantgate_server::{AppState, Collaborators};

pub const SECRET: &str = "http-test-secret";
pub const CAPTCHA_TOKEN: &str = "good-token";
pub const HOST: &str = "platform.local:8080";

/// Response of a routed request.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn error_code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or_default()
    }
}

/// Router plus direct handles on its collaborators.
pub struct TestServer {
    pub state: AppState,
    pub router: Router,
    pub store: Arc<SqliteStore>,
    pub handoff: Arc<StaticHandoff>,
    pub engine: Arc<MockEngine>,
    pub dir: TempDir,
}

impl TestServer {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteStore::in_memory()
                .await
                .expect("Failed to open in-memory store"),
        );

        let mut config = Config::new("sqlite::memory:");
        config.base_url = "http://platform.local:8080".into();
        config.jwt_secret = Some(SECRET.into());
        config.jobs.object_store_dir = dir.path().join("objects");
        config.jobs.max_attempts = 2;
        config.jobs.backoff = BackoffSettings {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        };
        config.vm.db_dir = dir.path().join("workspaces");

        let handoff = Arc::new(StaticHandoff::accepting());
        let engine = Arc::new(MockEngine::echo());
        let collaborators = Collaborators {
            engine: engine.clone(),
            handoff: handoff.clone(),
            captcha: Arc::new(StaticCaptcha::accepting([CAPTCHA_TOKEN])),
        };
        let state =
            AppState::new(config, store.clone(), collaborators).expect("Failed to build state");
        let router = api::router(state.clone());

        Self {
            state,
            router,
            store,
            handoff,
            engine,
            dir,
        }
    }

    /// Send a request through the router.
    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        send_to(self.router.clone(), request).await
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.send(request(Method::GET, uri, token, None)).await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.send(request(Method::POST, uri, token, Some(body))).await
    }

    pub async fn put(&self, uri: &str, token: Option<&str>, body: Value) -> TestResponse {
        self.send(request(Method::PUT, uri, token, Some(body))).await
    }

    pub async fn delete(&self, uri: &str, token: Option<&str>) -> TestResponse {
        self.send(request(Method::DELETE, uri, token, None)).await
    }

    /// Worker over every export queue, sharing the server's object store.
    pub fn worker(&self) -> JobWorker {
        let mut worker = JobWorker::new(
            self.store.clone(),
            self.state.config.jobs.clone(),
            Duration::from_secs(5),
        );
        for handler in ExportHandler::all(
            self.store.clone(),
            self.state.objects.clone(),
            self.state.config.jobs.export_retention,
        ) {
            worker = worker.register(Arc::new(handler));
        }
        worker
    }

    /// Create a workspace owned by `owner` and publish a two-field form.
    pub async fn published(
        &self,
        slug: &str,
        owner: Uuid,
        config: Value,
        configure: impl FnOnce(&mut Workspace),
    ) -> Workspace {
        publish(self.store.as_ref(), slug, owner, config, configure).await
    }
}

/// Route one request and decode the response body.
///
/// JSON bodies are parsed; other bodies are kept as a lossy string.
pub async fn send_to(router: Router, request: Request<Body>) -> TestResponse {
    let response = router.oneshot(request).await.expect("Router failed");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Create a public workspace in `store` with the two-field test form:
/// a required `title` of at most 80 characters and a required `count` of at
/// least 1, mapped to the workflow input `qty`.
pub async fn publish(
    store: &dyn Store,
    slug: &str,
    owner: Uuid,
    config: Value,
    configure: impl FnOnce(&mut Workspace),
) -> Workspace {
    let now = tenantgate_core::time::now();
    let mut ws = Workspace {
        id: Uuid::new_v4(),
        slug: slug.into(),
        name: format!("Workspace {slug}"),
        owner_user_id: owner,
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
    store
        .create_workspace(&ws)
        .await
        .expect("Failed to create workspace");
    store
        .publish_version(
            ws.id,
            &NewVersion {
                ui_schema: json!({"fields": [
                    {"key": "title", "type": "string", "required": true, "max": 80},
                    {"key": "count", "type": "integer", "required": true, "min": 1, "map_to": "qty"},
                ]}),
                config,
                workflow_id: Some(Uuid::new_v4()),
                ..NewVersion::default()
            },
            owner,
            now,
        )
        .await
        .expect("Failed to publish version");
    store
        .get_workspace(ws.id)
        .await
        .expect("Failed to load workspace")
        .expect("Workspace disappeared")
}

/// Request on the platform host.
pub fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", HOST)
        .header("x-forwarded-for", "198.51.100.7");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    builder.body(body).expect("Failed to build request")
}

fn sign(claims: Value) -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    let mut claims = claims;
    claims["exp"] = json!(exp);
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("Failed to sign token")
}

/// Bearer token of a platform user.
pub fn user_token(user_id: Uuid) -> String {
    sign(json!({ "sub": user_id }))
}

/// Bearer token of a platform administrator.
pub fn admin_token() -> String {
    sign(json!({ "sub": Uuid::new_v4(), "admin": true }))
}

/// App-session token of an end user.
pub fn app_session_token(subject: &str, claims: Value) -> String {
    let mut claims = claims;
    claims["sub"] = json!(subject);
    sign(claims)
}

/// Valid execute inputs for the published form.
pub fn inputs() -> Value {
    json!({"title": "hello", "count": 2})
}
