// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handoff of runtime executions to the workflow execution engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Trigger type used when the caller names none.
pub const DEFAULT_TRIGGER_TYPE: &str = "workspace_runtime";

/// Execution start request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    pub workflow_id: Uuid,
    /// User the execution runs as.
    pub user_id: Uuid,
    pub inputs: Map<String, Value>,
    pub trigger_type: String,
    pub trigger_data: Value,
}

/// Handle of a started execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: Uuid,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// Starts workflow executions.
///
/// Fails with [`Error::Overloaded`], [`Error::WorkflowNotFound`] or
/// [`Error::Unauthorized`]; anything else is an internal failure.
#[async_trait]
pub trait ExecutionHandoff: Send + Sync {
    async fn start(&self, request: ExecutionRequest) -> Result<ExecutionHandle>;
}

/// Client of the execution engine's HTTP API.
///
/// Posts to `{base_url}/api/v1/executions`. At most `max_in_flight` starts
/// are outstanding at once; further calls fail fast with `overloaded`.
pub struct HttpExecutionClient {
    client: reqwest::Client,
    endpoint: String,
    in_flight: Arc<Semaphore>,
}

impl HttpExecutionClient {
    pub fn new(base_url: &str, timeout: Duration, max_in_flight: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/executions", base_url.trim_end_matches('/')),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }
}

#[derive(Deserialize)]
struct Envelope {
    data: ExecutionHandle,
}

#[async_trait]
impl ExecutionHandoff for HttpExecutionClient {
    async fn start(&self, request: ExecutionRequest) -> Result<ExecutionHandle> {
        let Ok(_permit) = self.in_flight.try_acquire() else {
            warn!(workflow_id = %request.workflow_id, "Execution handoff shed, too many in flight");
            return Err(Error::Overloaded);
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, workflow_id = %request.workflow_id, "Execution engine unreachable");
                if e.is_timeout() || e.is_connect() {
                    Error::Overloaded
                } else {
                    Error::Internal(format!("execution engine request failed: {e}"))
                }
            })?;

        match response.status() {
            s if s.is_success() => {
                let body: Value = response
                    .json()
                    .await
                    .map_err(|e| Error::Internal(format!("execution engine response: {e}")))?;
                // Accept both enveloped and bare handles.
                let handle = if body.get("data").is_some() {
                    serde_json::from_value::<Envelope>(body).map(|e| e.data)
                } else {
                    serde_json::from_value::<ExecutionHandle>(body)
                }
                .map_err(|e| Error::Internal(format!("execution engine response: {e}")))?;
                debug!(execution_id = %handle.execution_id, status = %handle.status, "Execution started");
                Ok(handle)
            }
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => Err(Error::Overloaded),
            StatusCode::NOT_FOUND => Err(Error::WorkflowNotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Unauthorized),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(Error::Internal(format!(
                    "execution engine returned {status}: {}",
                    text.chars().take(200).collect::<String>()
                )))
            }
        }
    }
}

/// Handoff used when no execution engine is configured.
pub struct UnconfiguredHandoff;

#[async_trait]
impl ExecutionHandoff for UnconfiguredHandoff {
    async fn start(&self, _request: ExecutionRequest) -> Result<ExecutionHandle> {
        Err(Error::ServiceUnavailable("execution engine is not configured".into()))
    }
}

/// In-process handoff for tests. Records requests and answers with a fixed outcome.
#[derive(Default)]
pub struct StaticHandoff {
    failure: Option<fn() -> Error>,
    requests: Mutex<Vec<ExecutionRequest>>,
}

impl StaticHandoff {
    /// Every start succeeds with a fresh `running` execution.
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Every start fails with the error built by `failure`.
    pub fn failing(failure: fn() -> Error) -> Self {
        Self {
            failure: Some(failure),
            requests: Mutex::default(),
        }
    }

    /// Requests seen so far.
    pub async fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl ExecutionHandoff for StaticHandoff {
    async fn start(&self, request: ExecutionRequest) -> Result<ExecutionHandle> {
        self.requests.lock().await.push(request);
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        Ok(ExecutionHandle {
            execution_id: Uuid::new_v4(),
            status: "running".to_string(),
            started_at: crate::time::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            workflow_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            inputs: json!({ "title": "hello" }).as_object().cloned().unwrap(),
            trigger_type: DEFAULT_TRIGGER_TYPE.to_string(),
            trigger_data: json!({ "source": "workspace_runtime" }),
        }
    }

    #[tokio::test]
    async fn test_start_parses_enveloped_handle() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/api/v1/executions"))
            .and(body_partial_json(json!({ "trigger_type": "workspace_runtime" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "execution_id": id,
                    "status": "pending",
                    "started_at": "2025-03-01T10:00:00Z"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpExecutionClient::new(&server.uri(), Duration::from_secs(5), 4).unwrap();
        let handle = client.start(request()).await.unwrap();
        assert_eq!(handle.execution_id, id);
        assert_eq!(handle.status, "pending");
    }

    #[tokio::test]
    async fn test_start_maps_engine_errors() {
        let server = MockServer::start().await;
        let client = HttpExecutionClient::new(&server.uri(), Duration::from_secs(5), 4).unwrap();

        for (status, check) in [
            (503u16, (|e: &Error| matches!(e, Error::Overloaded)) as fn(&Error) -> bool),
            (404, |e| matches!(e, Error::WorkflowNotFound)),
            (403, |e| matches!(e, Error::Unauthorized)),
            (500, |e| matches!(e, Error::Internal(_))),
        ] {
            server.reset().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
            let err = client.start(request()).await.unwrap_err();
            assert!(check(&err), "status {status} mapped to {err:?}");
        }
    }

    #[tokio::test]
    async fn test_static_handoff_records_requests() {
        let handoff = StaticHandoff::accepting();
        handoff.start(request()).await.unwrap();
        assert_eq!(handoff.requests().await.len(), 1);

        let failing = StaticHandoff::failing(|| Error::Overloaded);
        assert!(matches!(failing.start(request()).await, Err(Error::Overloaded)));
    }
}
