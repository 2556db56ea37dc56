// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request extractors.

use std::net::SocketAddr;
use std::ops::Deref;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use tenantgate_core::{Error, Principal, RequestContext};

use super::RequestId;
use super::response::ApiError;
use crate::auth::bearer_token;
use crate::state::AppState;

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const SESSION_HEADER: &str = "x-workspace-session-id";
pub const CAPTCHA_HEADER: &str = "x-workspace-captcha-token";
pub const APP_SESSION_HEADER: &str = "x-app-session";

/// First non-empty value of a header.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parse a path id, naming `what` on failure.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid, Error> {
    Uuid::parse_str(raw.trim()).map_err(|_| Error::InvalidId(format!("{what} '{raw}'")))
}

/// Decode a JSON request body. An empty body decodes as `{}`.
pub fn json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| Error::InvalidRequest(format!("invalid request body: {e}")))
}

/// Real client IP: `X-Forwarded-For` (first hop), `X-Real-IP`, then the
/// socket peer.
pub fn client_ip(parts: &Parts) -> String {
    header_str(&parts.headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str(&parts.headers, "x-real-ip"))
        .map(str::to_string)
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Principal of the `Authorization` header, if one is sent.
fn principal(parts: &Parts, state: &AppState) -> Result<Option<Principal>, Error> {
    let Some(raw) = header_str(&parts.headers, "authorization") else {
        return Ok(None);
    };
    let token = bearer_token(raw)
        .ok_or_else(|| Error::InvalidToken("expected a bearer token".to_string()))?;
    let verifier = state
        .tokens
        .as_ref()
        .ok_or_else(|| Error::InvalidToken("bearer tokens are not accepted".to_string()))?;
    verifier.principal(token).map(Some)
}

/// Per-request context.
///
/// The request's cancellation token fires when the handler future is
/// dropped, which is how a client disconnect reaches the core.
pub struct Ctx {
    ctx: RequestContext,
    _cancel_on_drop: DropGuard,
}

impl Ctx {
    /// Principal, or `auth_required`.
    pub fn require_principal(&self) -> Result<&Principal, Error> {
        self.ctx.principal.as_ref().ok_or(Error::AuthRequired)
    }
}

impl Deref for Ctx {
    type Target = RequestContext;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

impl FromRequestParts<AppState> for Ctx {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = principal(parts, state)?;
        let user_agent = header_str(&parts.headers, "user-agent").unwrap_or_default();
        let token = CancellationToken::new();
        let mut ctx = RequestContext::new(client_ip(parts), user_agent)
            .with_principal(principal)
            .with_idempotency_key(header_str(&parts.headers, IDEMPOTENCY_KEY).map(str::to_string))
            .with_cancellation(token.clone());
        if let Some(RequestId(id)) = parts.extensions.get::<RequestId>() {
            ctx.request_id = *id;
        }
        Ok(Self {
            ctx,
            _cancel_on_drop: token.drop_guard(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_client_ip_precedence() {
        assert_eq!(
            client_ip(&parts(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1"), ("x-real-ip", "10.9.9.9")])),
            "203.0.113.9"
        );
        assert_eq!(client_ip(&parts(&[("x-real-ip", "10.9.9.9")])), "10.9.9.9");
        assert_eq!(client_ip(&parts(&[])), "unknown");
    }
}
