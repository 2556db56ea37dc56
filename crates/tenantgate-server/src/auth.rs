// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HS256 token verification.
//!
//! Bearer tokens identify platform users (`sub` is a user id, `admin` grants
//! the ops surface). App-session tokens identify end users of a code-backed
//! workspace and are handed to its isolate unchanged, minus the registered
//! claims.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tenantgate_core::vm::AppIdentity;
use tenantgate_core::{Error, Principal, Result};

/// Registered claims never forwarded into an isolate.
const REGISTERED_CLAIMS: &[&str] = &["exp", "iat", "nbf", "iss", "aud", "jti"];

/// Claims of a platform bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub admin: bool,
}

/// Verifies bearer and app-session tokens against one shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Principal of a bearer token.
    pub fn principal(&self, token: &str) -> Result<Principal> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| Error::InvalidToken("subject is not a user id".to_string()))?;
        Ok(Principal {
            user_id,
            is_admin: data.claims.admin,
        })
    }

    /// End-user identity of an app-session token.
    pub fn app_identity(&self, token: &str) -> Result<AppIdentity> {
        let data = decode::<Value>(token, &self.key, &self.validation)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        let mut claims = data.claims;
        let user_id = claims
            .get("sub")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidToken("app session has no subject".to_string()))?;
        if let Some(map) = claims.as_object_mut() {
            map.remove("sub");
            for key in REGISTERED_CLAIMS {
                map.remove(*key);
            }
            if map.is_empty() {
                claims = Value::Null;
            }
        }
        Ok(AppIdentity { user_id, claims })
    }
}

/// Token of an `Authorization: Bearer` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
