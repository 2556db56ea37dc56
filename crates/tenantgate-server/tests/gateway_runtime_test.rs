// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The assembled runtime: configured collaborators, background workers and
//! graceful shutdown.

mod common;

use std::sync::Arc;

use axum::http::{Method, StatusCode};
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;
use tenantgate_core::vm::MockEngine;
use tenantgate_core::{Config, SqliteStore};
use tenantgate_server::api;
use tenantgate_server::runtime::GatewayRuntime;

#[tokio::test]
async fn test_runtime_executes_through_http_handoff() {
    let engine = MockServer::start().await;
    let execution_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/api/v1/executions"))
        .and(body_partial_json(json!({
            "trigger_type": "workspace_runtime",
            "inputs": { "title": "hello", "qty": 2 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "execution_id": execution_id,
            "status": "running",
            "started_at": "2025-03-01T10:00:00Z"
        })))
        .expect(1)
        .mount(&engine)
        .await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    publish(store.as_ref(), "handoff", Uuid::new_v4(), json!({}), |_| {}).await;

    let mut config = Config::new("sqlite::memory:");
    config.http_addr = "127.0.0.1:0".parse().unwrap();
    config.base_url = "http://platform.local:8080".into();
    config.execution_url = Some(engine.uri());
    config.jobs.object_store_dir = dir.path().join("objects");
    config.vm.db_dir = dir.path().join("workspaces");

    let runtime = GatewayRuntime::builder()
        .config(config)
        .store(store)
        .engine(Arc::new(MockEngine::echo()))
        .job_workers(1)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();
    assert!(runtime.is_running());
    assert_ne!(runtime.local_addr().port(), 0);

    let router = api::router(runtime.state().clone());
    let res = send_to(
        router,
        request(
            Method::POST,
            "/api/v1/runtime/handoff/execute",
            None,
            Some(json!({ "inputs": inputs() })),
        ),
    )
    .await;
    assert_eq!(res.status, StatusCode::OK);
    assert_eq!(res.body["data"]["execution_id"], json!(execution_id));
    assert_eq!(res.body["data"]["status"], "running");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_without_execution_url_refuses_execute() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    publish(store.as_ref(), "offline", Uuid::new_v4(), json!({}), |_| {}).await;

    let mut config = Config::new("sqlite::memory:");
    config.http_addr = "127.0.0.1:0".parse().unwrap();
    config.base_url = "http://platform.local:8080".into();
    config.jobs.object_store_dir = dir.path().join("objects");
    config.vm.db_dir = dir.path().join("workspaces");

    let runtime = GatewayRuntime::builder()
        .config(config)
        .store(store)
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    let router = api::router(runtime.state().clone());
    let execute = send_to(
        router.clone(),
        request(
            Method::POST,
            "/api/v1/runtime/offline/execute",
            None,
            Some(json!({ "inputs": inputs() })),
        ),
    )
    .await;
    assert_eq!(execute.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(execute.error_code(), "service_unavailable");

    let vm = send_to(
        router,
        request(Method::GET, "/api/v1/runtime/offline/api/ping", None, None),
    )
    .await;
    assert_eq!(vm.status, StatusCode::CONFLICT);
    assert_eq!(vm.error_code(), "app_code_required");

    runtime.shutdown().await.unwrap();
}
