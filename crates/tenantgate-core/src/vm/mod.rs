// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded VM runtime for code-backed workspaces.
//!
//! The gateway owns isolate lifecycle only; the JavaScript engine itself sits
//! behind [`VmEngine`]. [`VmPool`] keeps at most one isolate per workspace,
//! created lazily with per-key singleflight and evicted on idle, version
//! change, quota breach, crash or timeout.
//!
//! The adapter here turns an inbound HTTP request into a [`VmRequest`]
//! (safe headers, parsed JSON body, optional app-session identity) and
//! validates the isolate's `{status, body}` answer.

pub mod db;
pub mod host;
pub mod mock;
pub mod pool;
pub mod script;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use self::db::{QueryResult, SqliteWorkspaceDb, WorkspaceDb};
pub use self::host::{FetchRequest, FetchResponse, HostBindings, LogLevel};
pub use self::mock::MockEngine;
pub use self::pool::{IdleSweeper, VmPool};
pub use self::script::ScriptEngine;

use crate::error::{Error, Result};
use crate::store::WorkspaceVersion;

/// Request headers never forwarded into an isolate.
pub const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "proxy-authorization",
    "host",
    "forwarded",
    "connection",
    "upgrade",
    "te",
    "trailer",
    "transfer-encoding",
    "keep-alive",
    "x-workspace-captcha-token",
    "x-app-session",
];

/// Largest request body accepted for an isolate.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Everything needed to boot an isolate.
#[derive(Debug, Clone)]
pub struct IsolateSpec {
    pub workspace_id: Uuid,
    pub version_id: Uuid,
    pub code: String,
    pub config: Value,
    pub memory_limit_bytes: u64,
    pub cpu_limit: Duration,
}

/// Resource use reported by an isolate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolateUsage {
    pub memory_bytes: u64,
    pub cpu_time: Duration,
}

/// End user resolved from an app-session token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppIdentity {
    pub user_id: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub claims: Value,
}

/// Request object handed to an isolate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmRequest {
    pub method: String,
    /// Path below `/api`, always starting with `/`.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<AppIdentity>,
}

impl VmRequest {
    /// Build a request from transport parts.
    ///
    /// Header names are lowercased and [`STRIPPED_HEADERS`] plus any
    /// `x-forwarded-*` header are dropped. An empty body becomes `null`;
    /// anything else must be JSON.
    pub fn from_parts<I>(
        method: &str,
        path: &str,
        query: BTreeMap<String, String>,
        headers: I,
        body: &[u8],
        user: Option<AppIdentity>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        if body.len() > MAX_BODY_BYTES {
            return Err(Error::InvalidRequest(format!(
                "request body exceeds {MAX_BODY_BYTES} bytes"
            )));
        }
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(body)
                .map_err(|e| Error::InvalidRequest(format!("request body is not JSON: {e}")))?
        };

        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .filter(|(k, _)| !STRIPPED_HEADERS.contains(&k.as_str()) && !k.starts_with("x-forwarded-"))
            .collect();

        let path = format!("/{}", path.trim_start_matches('/'));
        Ok(Self {
            method: method.to_ascii_uppercase(),
            path,
            query,
            headers,
            body,
            user,
        })
    }
}

/// Answer of an isolate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

impl VmResponse {
    /// Validate a raw isolate answer.
    pub fn from_value(raw: Value) -> Result<Self> {
        let response: Self = serde_json::from_value(raw)
            .map_err(|e| Error::VmFailure(format!("isolate returned a malformed response: {e}")))?;
        if !(100..=599).contains(&response.status) {
            return Err(Error::VmFailure(format!(
                "isolate returned invalid status {}",
                response.status
            )));
        }
        Ok(response)
    }
}

/// A running isolate.
#[async_trait]
pub trait Isolate: Send + Sync {
    /// Handle one request; the answer must be a `{status, body}` document.
    async fn handle(&self, request: &VmRequest) -> Result<Value>;

    /// Current resource use.
    fn usage(&self) -> IsolateUsage;

    /// Stop the isolate. Must not block.
    fn terminate(&self) {}
}

/// Boots isolates.
#[async_trait]
pub trait VmEngine: Send + Sync {
    async fn create(&self, spec: IsolateSpec, host: HostBindings) -> Result<Arc<dyn Isolate>>;
}

/// Engine used when VM dispatch is disabled.
pub struct UnconfiguredEngine;

#[async_trait]
impl VmEngine for UnconfiguredEngine {
    async fn create(&self, _spec: IsolateSpec, _host: HostBindings) -> Result<Arc<dyn Isolate>> {
        Err(Error::ServiceUnavailable("no VM engine is configured".into()))
    }
}

/// Application code of a version, from `config.app_code`.
pub fn app_code(version: &WorkspaceVersion) -> Result<&str> {
    version
        .config
        .get("app_code")
        .and_then(Value::as_str)
        .filter(|code| !code.trim().is_empty())
        .ok_or(Error::AppCodeRequired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_parts_filters_headers_and_parses_body() {
        let request = VmRequest::from_parts(
            "post",
            "orders/42",
            BTreeMap::new(),
            vec![
                ("Authorization".to_string(), "Bearer x".to_string()),
                ("Cookie".to_string(), "a=b".to_string()),
                ("X-Forwarded-For".to_string(), "1.2.3.4".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("X-Request-Id".to_string(), "abc".to_string()),
            ],
            br#"{"qty": 2}"#,
            None,
        )
        .unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/orders/42");
        assert_eq!(request.body, json!({ "qty": 2 }));
        let names: Vec<_> = request.headers.keys().cloned().collect();
        assert_eq!(names, vec!["content-type", "x-request-id"]);
    }

    #[test]
    fn test_from_parts_rejects_non_json() {
        let err = VmRequest::from_parts("POST", "/", BTreeMap::new(), Vec::new(), b"not json", None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let empty = VmRequest::from_parts("GET", "", BTreeMap::new(), Vec::new(), b"  ", None).unwrap();
        assert_eq!(empty.body, Value::Null);
        assert_eq!(empty.path, "/");
    }

    #[test]
    fn test_response_contract() {
        let ok = VmResponse::from_value(json!({ "status": 201, "body": { "id": 1 } })).unwrap();
        assert_eq!(ok.status, 201);
        assert!(VmResponse::from_value(json!({ "body": {} })).is_err());
        assert!(VmResponse::from_value(json!({ "status": 42 })).is_err());
        assert!(VmResponse::from_value(json!("text")).is_err());
    }
}
