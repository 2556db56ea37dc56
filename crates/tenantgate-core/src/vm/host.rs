// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host callables handed to an isolate.
//!
//! An isolate sees exactly three capabilities, all bound to its workspace:
//! a database query, an HTTP fetch limited to an allow list, and logging.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::db::{QueryResult, WorkspaceDb};
use crate::access::origin_allowed;
use crate::error::{Error, Result};

/// Largest fetch response body handed back to an isolate.
pub const MAX_FETCH_BODY: usize = 1024 * 1024;

/// Outbound request issued by an isolate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response of an isolate fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Log level requested by an isolate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Callables bound to one workspace.
#[derive(Clone)]
pub struct HostBindings {
    workspace_id: Uuid,
    db: Arc<dyn WorkspaceDb>,
    client: reqwest::Client,
    fetch_allowlist: Arc<Vec<String>>,
}

impl HostBindings {
    pub fn new(
        workspace_id: Uuid,
        db: Arc<dyn WorkspaceDb>,
        client: reqwest::Client,
        fetch_allowlist: Arc<Vec<String>>,
    ) -> Self {
        Self {
            workspace_id,
            db,
            client,
            fetch_allowlist,
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    /// Run a statement against this workspace's database.
    pub async fn db_query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.db.execute(self.workspace_id, sql, params).await
    }

    /// Whether `url` may be fetched. An empty allow list denies everything.
    pub fn fetch_allowed(&self, url: &url::Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") || self.fetch_allowlist.is_empty() {
            return false;
        }
        url.host_str()
            .is_some_and(|host| origin_allowed(&self.fetch_allowlist, host))
    }

    /// Perform an outbound HTTP request for the isolate.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| Error::InvalidRequest(format!("invalid fetch url: {e}")))?;
        if !self.fetch_allowed(&url) {
            warn!(workspace_id = %self.workspace_id, host = ?url.host_str(), "Isolate fetch denied");
            return Err(Error::Unauthorized);
        }
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::InvalidRequest(format!("invalid fetch method '{}'", request.method)))?;

        let mut builder = self.client.request(method, url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| Error::VmFailure(format!("fetch {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::VmFailure(format!("fetch {url} body: {e}")))?;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_FETCH_BODY)]).into_owned();
        debug!(workspace_id = %self.workspace_id, status, "Isolate fetch");
        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }

    /// Emit an isolate log line, tagged with the workspace.
    pub fn log(&self, level: LogLevel, message: &str) {
        let workspace_id = self.workspace_id;
        match level {
            LogLevel::Debug => debug!(workspace_id = %workspace_id, source = "isolate", "{message}"),
            LogLevel::Info => info!(workspace_id = %workspace_id, source = "isolate", "{message}"),
            LogLevel::Warn => warn!(workspace_id = %workspace_id, source = "isolate", "{message}"),
            LogLevel::Error => error!(workspace_id = %workspace_id, source = "isolate", "{message}"),
        }
    }
}

/// Shared HTTP client for isolate fetches.
pub fn fetch_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::db::SqliteWorkspaceDb;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bindings(dir: &TempDir, allow: &[&str]) -> HostBindings {
        HostBindings::new(
            Uuid::new_v4(),
            Arc::new(SqliteWorkspaceDb::new(dir.path())),
            fetch_client(Duration::from_secs(5)).unwrap(),
            Arc::new(allow.iter().map(|s| s.to_string()).collect()),
        )
    }

    #[test]
    fn test_fetch_allowlist() {
        let dir = TempDir::new().unwrap();
        let host = bindings(&dir, &["api.example.com", "*.internal.test"]);
        let ok = |u: &str| host.fetch_allowed(&url::Url::parse(u).unwrap());
        assert!(ok("https://api.example.com/v1"));
        assert!(ok("http://svc.internal.test:8080/x"));
        assert!(!ok("https://example.com"));
        assert!(!ok("file:///etc/passwd"));

        let closed = bindings(&dir, &[]);
        assert!(!closed.fetch_allowed(&url::Url::parse("https://api.example.com").unwrap()));
    }

    #[tokio::test]
    async fn test_fetch_allowed_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let host = bindings(&dir, &["127.0.0.1"]);
        let response = host
            .fetch(FetchRequest {
                method: "get".into(),
                url: format!("{}/ping", server.uri()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "pong");

        let denied = host
            .fetch(FetchRequest {
                method: "GET".into(),
                url: "https://elsewhere.test/".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(denied, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn test_db_query_is_workspace_bound() {
        let dir = TempDir::new().unwrap();
        let host = bindings(&dir, &[]);
        host.db_query("CREATE TABLE notes (body TEXT)", &[]).await.unwrap();
        host.db_query("INSERT INTO notes VALUES (?)", &[json!("hi")]).await.unwrap();
        let rows = host.db_query("SELECT body FROM notes", &[]).await.unwrap();
        assert_eq!(rows.rows[0]["body"], json!("hi"));
    }
}
