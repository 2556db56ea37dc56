// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Response envelopes and the error status table.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

use tenantgate_core::{Error, ErrorClass};

/// `499 Client Closed Request`.
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// HTTP status of a core error.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::AuthRequired | Error::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        Error::CaptchaRequired | Error::CaptchaInvalid => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::FORBIDDEN,

        Error::WorkspaceNotFound
        | Error::VersionNotFound
        | Error::WorkflowNotFound
        | Error::DomainNotFound
        | Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::VersionRequired
        | Error::WorkflowRequired
        | Error::AppCodeRequired
        | Error::InvalidState(_)
        | Error::IdempotencyConflict
        | Error::IdempotencyInProgress
        | Error::DomainNotActive
        | Error::ExportNotReady { .. } => StatusCode::CONFLICT,

        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Error::QuotaExceeded { .. }
        | Error::SpendLimit { .. }
        | Error::IpBlocked
        | Error::SessionBlocked { .. }
        | Error::DomainBlocked
        | Error::OriginMismatch { .. } => StatusCode::FORBIDDEN,

        Error::ExportExpired => StatusCode::GONE,
        Error::Cancelled => {
            StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
        }

        other => match other.class() {
            ErrorClass::Input => StatusCode::BAD_REQUEST,
            ErrorClass::Availability => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

/// Error body of a core error.
pub fn error_body(err: &Error) -> Value {
    let mut body = json!({
        "code": err.code(),
        "message": err.public_message(),
    });
    if let Some(details) = err.details() {
        body["details"] = details;
    }
    json!({ "success": false, "error": body })
}

/// Handler error. Renders the error envelope.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        if status.is_server_error() && err.class() == ErrorClass::Fatal {
            error!(code = err.code(), error = %err, "Request failed");
        }
        let mut response = (status, Json(error_body(&err))).into_response();
        if let Error::RateLimited { retry_after_secs } = &err
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Success envelope.
pub fn envelope<T: Serialize>(data: T) -> Value {
    json!({ "success": true, "data": data })
}

/// Success envelope with list metadata.
pub fn envelope_with_meta<T: Serialize>(data: T, meta: Value) -> Value {
    json!({ "success": true, "data": data, "meta": meta })
}

/// `200` with a success envelope.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(envelope(data)).into_response()
}

/// `201` with a success envelope.
pub fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(envelope(data))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_status_table() {
        let cases = [
            (Error::InvalidRequest("x".into()), 400),
            (Error::InvalidInputs(Vec::new()), 400),
            (Error::CaptchaRequired, 400),
            (Error::AuthRequired, 401),
            (Error::InvalidToken("x".into()), 401),
            (Error::Unauthorized, 403),
            (
                Error::QuotaExceeded {
                    exceeded: vec!["requests".into()],
                    remaining: BTreeMap::new(),
                },
                403,
            ),
            (Error::DomainBlocked, 403),
            (Error::SessionBlocked { until: None }, 403),
            (Error::DomainNotFound, 404),
            (Error::WorkflowNotFound, 404),
            (Error::DomainNotActive, 409),
            (Error::IdempotencyConflict, 409),
            (
                Error::ExportNotReady {
                    status: "running".into(),
                },
                409,
            ),
            (Error::ExportExpired, 410),
            (Error::RateLimited { retry_after_secs: 3 }, 429),
            (Error::Overloaded, 503),
            (Error::ExportDisabled, 503),
            (Error::CaptchaUnavailable, 503),
            (Error::Cancelled, 499),
            (Error::Internal("boom".into()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(status_for(&err).as_u16(), status, "{}", err.code());
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError(Error::RateLimited { retry_after_secs: 12 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }

    #[test]
    fn test_internal_message_is_hidden() {
        let body = error_body(&Error::Internal("db path /var/secret".into()));
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "internal");
        assert_eq!(body["error"]["message"], "internal server error");
    }
}
