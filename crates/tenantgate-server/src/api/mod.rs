// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routes under `/api/v1`.

pub mod billing;
pub mod exports;
pub mod extract;
pub mod idempotency;
pub mod ops;
pub mod response;
pub mod runtime;
pub mod workspaces;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post, put};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use self::response::ok;
use crate::state::AppState;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation id of the request, set by [`request_id_middleware`].
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Tag every request with an id and run it inside a span carrying it.
///
/// A well-formed inbound `X-Request-Id` is reused.
async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .unwrap_or_else(Uuid::new_v4);
    req.extensions_mut().insert(RequestId(request_id));

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        uri = %req.uri().path(),
    );

    async move {
        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
        }
        tracing::debug!(status = %response.status(), "Request completed");
        response
    }
    .instrument(span)
    .await
}

/// `GET /health`
async fn health(State(state): State<AppState>) -> Response {
    let database = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Health check could not reach the database");
            "unavailable"
        }
    };
    ok(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "database": database,
    }))
}

fn runtime_routes() -> Router<AppState> {
    Router::new()
        .route("/runtime/{slug}", get(runtime::entry))
        .route("/runtime/{slug}/schema", get(runtime::schema))
        .route("/runtime/{slug}/execute", post(runtime::execute))
        .route("/runtime/{slug}/api/{*path}", any(runtime::vm))
}

fn workspace_routes() -> Router<AppState> {
    Router::new()
        .route("/workspaces", post(workspaces::create_workspace))
        .route(
            "/workspaces/{id}",
            get(workspaces::get_workspace).delete(workspaces::delete_workspace),
        )
        .route("/workspaces/{id}/access", put(workspaces::update_access))
        .route(
            "/workspaces/{id}/versions",
            get(workspaces::list_versions).post(workspaces::publish_version),
        )
        .route(
            "/workspaces/{id}/domains",
            get(workspaces::list_domains).post(workspaces::bind_domain),
        )
        .route(
            "/workspaces/{id}/members",
            get(workspaces::list_members).post(workspaces::add_member),
        )
        .route(
            "/workspaces/{id}/members/{user_id}",
            axum::routing::delete(workspaces::remove_member),
        )
        .route("/workspaces/{id}/audit-logs", get(workspaces::list_audit))
}

fn export_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/workspaces/{id}/exports",
            get(exports::list_exports).post(exports::request_export),
        )
        .route(
            "/workspaces/{id}/exports/{export_id}",
            get(exports::get_export).delete(exports::delete_export),
        )
        .route(
            "/workspaces/{id}/exports/{export_id}/download",
            get(exports::download_export),
        )
        .route(
            "/workspaces/{id}/log-archives",
            get(exports::list_archives).post(exports::request_archive),
        )
        .route(
            "/workspaces/{id}/log-archives/{archive_id}",
            get(exports::get_archive).delete(exports::delete_archive),
        )
        .route(
            "/workspaces/{id}/log-archives/{archive_id}/download",
            get(exports::download_archive),
        )
        .route(
            "/workspaces/{id}/log-archives/{archive_id}/replay",
            get(exports::replay_archive),
        )
        .route(
            "/workspaces/{id}/export-subscriptions",
            get(exports::list_subscriptions).post(exports::create_subscription),
        )
        .route(
            "/workspaces/{id}/export-subscriptions/{subscription_id}",
            axum::routing::delete(exports::delete_subscription),
        )
}

fn billing_routes() -> Router<AppState> {
    Router::new()
        .route("/billing/catalog", get(billing::catalog))
        .route("/workspaces/{id}/billing/consume", post(billing::consume))
        .route("/workspaces/{id}/billing/estimate", post(billing::estimate))
        .route("/workspaces/{id}/billing/quota", get(billing::quota))
        .route("/workspaces/{id}/billing/usage", get(billing::usage_events))
        .route(
            "/workspaces/{id}/billing/budget",
            get(billing::get_budget).put(billing::put_budget),
        )
}

fn ops_routes() -> Router<AppState> {
    Router::new()
        .route("/ops/dead-tasks", get(ops::list_dead_tasks))
        .route(
            "/ops/dead-tasks/{task_id}",
            axum::routing::delete(ops::delete_dead_task),
        )
        .route("/ops/dead-tasks/{task_id}/retry", post(ops::retry_dead_task))
        .route("/ops/domains/{domain}", put(ops::update_domain))
}

/// The full application router.
pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/health", get(health))
        .merge(runtime_routes())
        .merge(workspace_routes())
        .merge(export_routes())
        .merge(billing_routes())
        .merge(ops_routes());

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
