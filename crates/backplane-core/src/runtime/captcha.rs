// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Captcha token verification.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Checks a client-supplied captcha token.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    /// `Ok(true)` when the token is valid. Transport problems are
    /// `CaptchaUnavailable`, never `Ok(false)`.
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> Result<bool>;
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Verifier for `siteverify`-style endpoints (Turnstile, reCAPTCHA, hCaptcha).
pub struct HttpCaptchaVerifier {
    client: reqwest::Client,
    secret: String,
    verify_url: String,
}

impl HttpCaptchaVerifier {
    /// Creates a verifier posting `secret`/`response`/`remoteip` to `verify_url`.
    pub fn new(secret: impl Into<String>, verify_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| CoreError::CaptchaUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            secret: secret.into(),
            verify_url: verify_url.into(),
        })
    }
}

#[async_trait]
impl CaptchaVerifier for HttpCaptchaVerifier {
    async fn verify(&self, token: &str, remote_ip: Option<&str>) -> Result<bool> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(false);
        }
        let mut form = vec![("secret", self.secret.as_str()), ("response", token)];
        if let Some(ip) = remote_ip.filter(|ip| !ip.is_empty()) {
            form.push(("remoteip", ip));
        }

        let response = self
            .client
            .post(&self.verify_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Captcha verifier unreachable");
                CoreError::CaptchaUnavailable(e.to_string())
            })?;
        if !response.status().is_success() {
            return Err(CoreError::CaptchaUnavailable(format!(
                "verifier returned {}",
                response.status()
            )));
        }
        let body: SiteVerifyResponse = response
            .json()
            .await
            .map_err(|e| CoreError::CaptchaUnavailable(e.to_string()))?;
        if !body.success {
            debug!(error_codes = ?body.error_codes, "Captcha token rejected");
        }
        Ok(body.success)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_siteverify_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .and(body_string_contains("response=good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/siteverify"))
            .and(body_string_contains("response=bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"success": false, "error-codes": ["invalid-input-response"]}),
            ))
            .mount(&server)
            .await;

        let verifier =
            HttpCaptchaVerifier::new("s", format!("{}/siteverify", server.uri())).unwrap();
        assert!(verifier.verify("good", Some("1.2.3.4")).await.unwrap());
        assert!(!verifier.verify("bad", None).await.unwrap());
        assert!(!verifier.verify("  ", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_verifier_outage_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let verifier = HttpCaptchaVerifier::new("s", server.uri()).unwrap();
        let err = verifier.verify("tok", None).await.unwrap_err();
        assert_eq!(err.error_code(), "CAPTCHA_UNAVAILABLE");
    }
}
