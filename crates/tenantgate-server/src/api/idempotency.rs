// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `Idempotency-Key` handling for create and execute operations.
//!
//! The first request with a key reserves it, runs, and stores its success
//! response. Repeats with the same body get the stored response back; a
//! different body is `idempotency_conflict`, and a repeat while the first
//! is still running is `idempotency_in_progress`. Failed requests release
//! the key so the client can retry. The runtime session header is stored
//! with the body and re-emitted on replay.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::TimeDelta;
use sha2::{Digest, Sha256};
use tracing::warn;

use tenantgate_core::store::{IdempotencyRecord, IdempotencyState};
use tenantgate_core::{Error, RequestContext, Store};

use super::extract::SESSION_HEADER;
use super::response::{ApiError, ApiResult};
use crate::state::AppState;

/// Set on responses served from the idempotency store.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Largest response body kept for replay.
const MAX_STORED_BODY: usize = 1024 * 1024;

/// Response headers stored and replayed alongside the body.
const STORED_HEADERS: &[&str] = &[SESSION_HEADER];

/// Releases a reserved key if the request never finishes.
struct Reservation {
    store: Arc<dyn Store>,
    scope: String,
    key: String,
    armed: bool,
}

impl Reservation {
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.store.release_idempotency(&self.scope, &self.key).await {
            warn!(scope = %self.scope, error = %e, "Failed to release idempotency key");
        }
    }

    async fn complete(mut self, status: StatusCode, headers: &HeaderMap, body: &str) {
        self.armed = false;
        let headers: BTreeMap<String, String> = STORED_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        if let Err(e) = self
            .store
            .complete_idempotency(&self.scope, &self.key, status.as_u16(), &headers, body)
            .await
        {
            warn!(scope = %self.scope, error = %e, "Failed to store idempotent response");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let scope = std::mem::take(&mut self.scope);
        let key = std::mem::take(&mut self.key);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = store.release_idempotency(&scope, &key).await {
                    warn!(scope = %scope, error = %e, "Failed to release abandoned idempotency key");
                }
            });
        }
    }
}

fn request_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

fn caller(ctx: &RequestContext) -> String {
    match ctx.user_id() {
        Some(user_id) => format!("user:{user_id}"),
        None => format!("ip:{}", ctx.ip),
    }
}

fn replay(record: IdempotencyRecord) -> ApiResult<Response> {
    let status = record
        .response_status
        .and_then(|s| u16::try_from(s).ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .ok_or_else(|| Error::Internal("stored idempotent response has no status".to_string()))?;
    let stored = record.stored_headers();
    let mut response = (status, record.response_body.unwrap_or_default()).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    for (name, value) in stored {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            headers.insert(name, value);
        }
    }
    Ok(response)
}

/// Run `operation` under the request's idempotency key, if it has one.
///
/// `operation` names the endpoint; it is combined with the caller so keys
/// never collide across users. `payload` is the raw request body.
pub async fn idempotent<F, Fut>(
    state: &AppState,
    ctx: &RequestContext,
    operation: &str,
    payload: &[u8],
    run: F,
) -> ApiResult<Response>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ApiResult<Response>>,
{
    let Some(key) = ctx.idempotency_key.clone() else {
        return run().await;
    };

    let scope = format!("{}:{operation}", caller(ctx));
    let hash = request_hash(payload);
    let now = tenantgate_core::time::now();
    let ttl = TimeDelta::from_std(state.config.runtime.idempotency_ttl).unwrap_or(TimeDelta::days(1));

    if let Some(existing) = state
        .store
        .begin_idempotency(&scope, &key, &hash, now, now + ttl)
        .await?
    {
        if existing.request_hash != hash {
            return Err(Error::IdempotencyConflict.into());
        }
        return match existing.state {
            IdempotencyState::InProgress => Err(Error::IdempotencyInProgress.into()),
            IdempotencyState::Completed => replay(existing),
        };
    }

    let reservation = Reservation {
        store: state.store.clone(),
        scope,
        key,
        armed: true,
    };

    match run().await {
        Ok(response) if response.status().is_success() => {
            let (parts, body) = response.into_parts();
            let bytes = match to_bytes(body, MAX_STORED_BODY).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    reservation.release().await;
                    return Err(ApiError(Error::Internal(format!("failed to buffer response: {e}"))));
                }
            };
            reservation
                .complete(parts.status, &parts.headers, &String::from_utf8_lossy(&bytes))
                .await;
            Ok(Response::from_parts(parts, Body::from(bytes)))
        }
        other => {
            reservation.release().await;
            other
        }
    }
}
