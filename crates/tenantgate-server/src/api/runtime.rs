// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime endpoints: entry, schema, execute and VM dispatch.
//!
//! Every handler records the runtime metric once the response status is
//! known, labelled with the workspace the dispatcher resolved.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio::time::Instant;
use uuid::Uuid;

use tenantgate_core::dispatcher::{self, ExecuteBody, RuntimeCall, VmCall};
use tenantgate_core::{Error, metrics};

use super::extract::{APP_SESSION_HEADER, CAPTCHA_HEADER, Ctx, SESSION_HEADER, header_str};
use super::idempotency::idempotent;
use super::response::{ApiError, ApiResult, envelope, ok};
use crate::state::AppState;

type RuntimeQuery = Query<BTreeMap<String, String>>;

/// Transport-neutral call from request parts.
///
/// Session id and CAPTCHA token come from their headers first, then from the
/// `session_id` and `captcha_token` query parameters.
fn runtime_call(
    headers: &HeaderMap,
    uri: &Uri,
    slug: String,
    query: &BTreeMap<String, String>,
) -> Result<RuntimeCall, Error> {
    let session_id = header_str(headers, SESSION_HEADER)
        .or_else(|| query.get("session_id").map(String::as_str).filter(|s| !s.is_empty()))
        .map(|raw| {
            Uuid::parse_str(raw.trim())
                .map_err(|_| Error::InvalidId(format!("session id '{raw}'")))
        })
        .transpose()?;
    let captcha_token = header_str(headers, CAPTCHA_HEADER)
        .or_else(|| query.get("captcha_token").map(String::as_str).filter(|s| !s.is_empty()))
        .map(str::to_string);

    Ok(RuntimeCall {
        host: dispatcher::request_host(
            header_str(headers, "x-forwarded-host"),
            header_str(headers, "forwarded"),
            header_str(headers, "host").or(uri.host()),
        ),
        slug,
        path: uri.path().to_string(),
        session_id,
        origin: header_str(headers, "origin").map(str::to_string),
        captcha_token,
    })
}

fn set_header(response: &mut Response, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn with_session(mut response: Response, session_id: Option<Uuid>) -> Response {
    if let Some(id) = session_id {
        set_header(&mut response, HeaderName::from_static(SESSION_HEADER), &id.to_string());
    }
    response
}

/// Render the outcome and record the runtime metric.
fn finish(ctx: &Ctx, operation: &'static str, started: Instant, result: ApiResult<Response>) -> Response {
    let response = result.into_response();
    metrics::record_runtime(
        ctx.observed_workspace(),
        operation,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

/// `GET /runtime/{slug}`
pub async fn entry(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(slug): Path<String>,
    Query(query): RuntimeQuery,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let started = Instant::now();
    let result = async {
        let call = runtime_call(&headers, &uri, slug, &query)?;
        let entry = state.dispatcher.entry(&ctx, &call).await?;
        let session_id = entry.session_id;
        Ok::<_, ApiError>(with_session(ok(entry), session_id))
    }
    .await;
    finish(&ctx, "entry", started, result)
}

/// `GET /runtime/{slug}/schema`
pub async fn schema(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(slug): Path<String>,
    Query(query): RuntimeQuery,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let started = Instant::now();
    let result = async {
        let call = runtime_call(&headers, &uri, slug, &query)?;
        let cache = dispatcher::cache_requested(query.get("cache").map(String::as_str));
        let schema = state
            .dispatcher
            .schema(&ctx, &call, cache, header_str(&headers, "if-none-match"))
            .await?;

        let session_id = schema.body.entry.session_id;
        let mut response = if schema.not_modified {
            StatusCode::NOT_MODIFIED.into_response()
        } else {
            Json(envelope(&schema.body)).into_response()
        };
        if let Some(etag) = &schema.etag {
            set_header(&mut response, header::ETAG, etag);
            set_header(&mut response, header::VARY, "Accept-Encoding");
        }
        set_header(&mut response, header::CACHE_CONTROL, &schema.cache_control);
        Ok::<_, ApiError>(with_session(response, session_id))
    }
    .await;
    finish(&ctx, "schema", started, result)
}

/// `POST /runtime/{slug}/execute`
pub async fn execute(
    State(state): State<AppState>,
    ctx: Ctx,
    Path(slug): Path<String>,
    Query(query): RuntimeQuery,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let result = async {
        let call = runtime_call(&headers, &uri, slug.clone(), &query)?;
        let execute: ExecuteBody = if body.iter().all(u8::is_ascii_whitespace) {
            ExecuteBody::default()
        } else {
            serde_json::from_slice(&body)
                .map_err(|e| Error::InvalidRequest(format!("invalid execute body: {e}")))?
        };
        let operation = format!("execute:{}:{slug}", call.host.as_deref().unwrap_or_default());
        idempotent(&state, &ctx, &operation, &body, || async {
            let result = state.dispatcher.execute(&ctx, &call, execute).await?;
            let session_id = result.session_id;
            Ok::<_, ApiError>(with_session(ok(result), session_id))
        })
        .await
    }
    .await;
    finish(&ctx, "execute", started, result)
}

/// `ANY /runtime/{slug}/api/{*path}`
#[allow(clippy::too_many_arguments)]
pub async fn vm(
    State(state): State<AppState>,
    ctx: Ctx,
    Path((slug, path)): Path<(String, String)>,
    Query(query): RuntimeQuery,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let result = async {
        let call = runtime_call(&headers, &uri, slug, &query)?;
        let user = match header_str(&headers, APP_SESSION_HEADER) {
            Some(token) => {
                let verifier = state.tokens.as_ref().ok_or_else(|| {
                    Error::InvalidToken("app sessions are not accepted".to_string())
                })?;
                Some(verifier.app_identity(token)?)
            }
            None => None,
        };
        let forwarded_query = query
            .into_iter()
            .filter(|(k, _)| k != "session_id" && k != "captcha_token")
            .collect();
        let vm_call = VmCall {
            method: method.to_string(),
            path,
            query: forwarded_query,
            headers: headers
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
                .collect(),
            body: body.to_vec(),
            user,
        };
        let dispatch = state.dispatcher.dispatch_vm(&ctx, &call, vm_call).await?;

        let status = StatusCode::from_u16(dispatch.response.status).map_err(|_| {
            ApiError(Error::VmFailure(format!(
                "isolate answered with status {}",
                dispatch.response.status
            )))
        })?;
        let mut response = (status, Json(dispatch.response.body)).into_response();
        for (name, value) in &dispatch.response.headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes())
                && name != header::CONTENT_TYPE
                && name != header::CONTENT_LENGTH
            {
                set_header(&mut response, name, value);
            }
        }
        Ok::<_, ApiError>(with_session(response, dispatch.session_id))
    }
    .await;
    finish(&ctx, "vm", started, result)
}
