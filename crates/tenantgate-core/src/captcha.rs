// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CAPTCHA verification.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::config::CaptchaSettings;
use crate::error::{Error, Result};

/// Outcome of a verification call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Ok,
    Invalid,
    Unavailable,
}

/// Pluggable CAPTCHA backend.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// Verify `token` for the client at `ip`.
    async fn verify(&self, token: &str, ip: &str) -> CaptchaOutcome;
}

/// Enforce a CAPTCHA requirement.
///
/// Does nothing when `required` is false. An empty token fails with
/// `captcha_required` without calling the backend.
pub async fn ensure(
    verifier: &dyn CaptchaVerifier,
    required: bool,
    token: Option<&str>,
    ip: &str,
) -> Result<()> {
    if !required {
        return Ok(());
    }
    let token = token.map(str::trim).unwrap_or_default();
    if token.is_empty() {
        return Err(Error::CaptchaRequired);
    }
    match verifier.verify(token, ip).await {
        CaptchaOutcome::Ok => Ok(()),
        CaptchaOutcome::Invalid => Err(Error::CaptchaInvalid),
        CaptchaOutcome::Unavailable => Err(Error::CaptchaUnavailable),
    }
}

/// Site-verify style backend (Turnstile, hCaptcha, reCAPTCHA).
pub struct SiteVerifyCaptcha {
    client: reqwest::Client,
    settings: CaptchaSettings,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl SiteVerifyCaptcha {
    pub fn new(settings: CaptchaSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl CaptchaVerifier for SiteVerifyCaptcha {
    async fn verify(&self, token: &str, ip: &str) -> CaptchaOutcome {
        let mut form = vec![
            ("secret", self.settings.secret.as_str()),
            ("response", token),
        ];
        if !ip.is_empty() {
            form.push(("remoteip", ip));
        }

        let response = match self
            .client
            .post(&self.settings.verify_url)
            .form(&form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "CAPTCHA site-verify request failed");
                return CaptchaOutcome::Unavailable;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "CAPTCHA site-verify returned an error status");
            return CaptchaOutcome::Unavailable;
        }

        match response.json::<SiteVerifyResponse>().await {
            Ok(body) if body.success => CaptchaOutcome::Ok,
            Ok(body) => {
                if body.error_codes.iter().any(|c| c == "internal-error") {
                    CaptchaOutcome::Unavailable
                } else {
                    CaptchaOutcome::Invalid
                }
            }
            Err(e) => {
                warn!(error = %e, "CAPTCHA site-verify returned an unreadable body");
                CaptchaOutcome::Unavailable
            }
        }
    }
}

/// Backend used when no verifier is configured.
pub struct DisabledCaptcha;

#[async_trait]
impl CaptchaVerifier for DisabledCaptcha {
    async fn verify(&self, _token: &str, _ip: &str) -> CaptchaOutcome {
        CaptchaOutcome::Unavailable
    }
}

/// Accepts a fixed set of tokens. For tests and local development.
#[derive(Debug, Default, Clone)]
pub struct StaticCaptcha {
    accepted: HashSet<String>,
}

impl StaticCaptcha {
    pub fn accepting<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accepted: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CaptchaVerifier for StaticCaptcha {
    async fn verify(&self, token: &str, _ip: &str) -> CaptchaOutcome {
        if self.accepted.contains(token) {
            CaptchaOutcome::Ok
        } else {
            CaptchaOutcome::Invalid
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn site_verify(server: &MockServer) -> SiteVerifyCaptcha {
        SiteVerifyCaptcha::new(CaptchaSettings {
            verify_url: format!("{}/siteverify", server.uri()),
            secret: "s3cret".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_not_required_skips_backend() {
        ensure(&DisabledCaptcha, false, None, "10.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn test_required_without_token() {
        let err = ensure(&StaticCaptcha::default(), true, Some("  "), "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CaptchaRequired));
    }

    #[tokio::test]
    async fn test_static_tokens() {
        let captcha = StaticCaptcha::accepting(["good"]);
        ensure(&captcha, true, Some("good"), "").await.unwrap();
        let err = ensure(&captcha, true, Some("bad"), "").await.unwrap_err();
        assert!(matches!(err, Error::CaptchaInvalid));
    }

    #[tokio::test]
    async fn test_disabled_backend_is_unavailable() {
        let err = ensure(&DisabledCaptcha, true, Some("tok"), "").await.unwrap_err();
        assert!(matches!(err, Error::CaptchaUnavailable));
    }

    #[tokio::test]
    async fn test_site_verify_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .and(body_string_contains("secret=s3cret"))
            .and(body_string_contains("remoteip=10.0.0.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;

        let outcome = site_verify(&server).verify("tok", "10.0.0.1").await;
        assert_eq!(outcome, CaptchaOutcome::Ok);
    }

    #[tokio::test]
    async fn test_site_verify_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": false, "error-codes": ["invalid-input-response"]}),
            ))
            .mount(&server)
            .await;

        let outcome = site_verify(&server).verify("tok", "").await;
        assert_eq!(outcome, CaptchaOutcome::Invalid);
    }

    #[tokio::test]
    async fn test_site_verify_outage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let outcome = site_verify(&server).verify("tok", "").await;
        assert_eq!(outcome, CaptchaOutcome::Unavailable);
    }
}
