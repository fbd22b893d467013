//! Admin device-ban collaborator.
//!
//! Consulted before any password work. Every failure mode other than an
//! explicit answer maps to [`BanStatus::Unknown`], which callers let through.

use crate::APP_USER_AGENT;
use crate::config::DeviceConfig;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const BAN_CHECK_PATH: &str = "/api/v1/admin/moderation/device-bans/check";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BanStatus {
    Banned { message: Option<String> },
    Clear,
    /// The checker could not answer.
    Unknown,
}

impl BanStatus {
    #[must_use]
    pub fn is_banned(&self) -> bool {
        matches!(self, Self::Banned { .. })
    }
}

#[async_trait]
pub trait BanChecker: Send + Sync {
    async fn check(&self, fingerprint: &str) -> BanStatus;
}

/// Used when no ban service is configured.
pub struct NoopBanChecker;

#[async_trait]
impl BanChecker for NoopBanChecker {
    async fn check(&self, _fingerprint: &str) -> BanStatus {
        BanStatus::Clear
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BanResponse {
    is_banned: bool,
    #[serde(default)]
    message: Option<String>,
}

pub struct HttpBanChecker {
    endpoint: String,
    token: SecretString,
    client: reqwest::Client,
}

impl HttpBanChecker {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base: &Url, token: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build ban check client")?;
        let endpoint = format!("{}{BAN_CHECK_PATH}", base.as_str().trim_end_matches('/'));
        debug!("ban check endpoint: {endpoint}");
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    async fn request(&self, fingerprint: &str) -> Result<BanResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Service-Token", self.token.expose_secret())
            .json(&json!({ "deviceFingerprint": fingerprint }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("{} - {}", self.endpoint, response.status()));
        }

        response
            .json::<BanResponse>()
            .await
            .context("Failed to decode ban check response")
    }
}

#[async_trait]
impl BanChecker for HttpBanChecker {
    async fn check(&self, fingerprint: &str) -> BanStatus {
        if fingerprint.is_empty() {
            return BanStatus::Clear;
        }
        match self.request(fingerprint).await {
            Ok(BanResponse {
                is_banned: true,
                message,
            }) => BanStatus::Banned { message },
            Ok(_) => BanStatus::Clear,
            Err(err) => {
                warn!("Admin ban check failed, allowing: {err:#}");
                BanStatus::Unknown
            }
        }
    }
}

/// Build the HTTP checker when a URL and token are configured.
///
/// # Errors
/// Returns an error if the HTTP client cannot be built.
pub fn from_config(config: &DeviceConfig) -> Result<Arc<dyn BanChecker>> {
    match (&config.ban_check_url, &config.ban_check_token) {
        (Some(url), Some(token)) => Ok(Arc::new(HttpBanChecker::new(
            url,
            token.clone(),
            config.ban_check_timeout,
        )?)),
        _ => Ok(Arc::new(NoopBanChecker)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn checker(server: &MockServer, timeout: Duration) -> HttpBanChecker {
        let base = Url::parse(&server.uri()).unwrap();
        HttpBanChecker::new(&base, SecretString::from("svc-token"), timeout).unwrap()
    }

    #[tokio::test]
    async fn banned_device_reports_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BAN_CHECK_PATH))
            .and(header("X-Service-Token", "svc-token"))
            .and(body_json(json!({ "deviceFingerprint": "fp-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "isBanned": true,
                "message": "chargeback fraud"
            })))
            .mount(&server)
            .await;

        let status = checker(&server, Duration::from_millis(500))
            .check("fp-1")
            .await;
        assert_eq!(
            status,
            BanStatus::Banned {
                message: Some("chargeback fraud".to_string())
            }
        );
    }

    #[tokio::test]
    async fn clear_device() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BAN_CHECK_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "isBanned": false })))
            .mount(&server)
            .await;

        let status = checker(&server, Duration::from_millis(500))
            .check("fp-2")
            .await;
        assert_eq!(status, BanStatus::Clear);
    }

    #[tokio::test]
    async fn server_error_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BAN_CHECK_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let status = checker(&server, Duration::from_millis(500))
            .check("fp-3")
            .await;
        assert_eq!(status, BanStatus::Unknown);
    }

    #[tokio::test]
    async fn slow_service_times_out_to_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(BAN_CHECK_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "isBanned": true }))
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let status = checker(&server, Duration::from_millis(100))
            .check("fp-4")
            .await;
        assert_eq!(status, BanStatus::Unknown);
    }

    #[tokio::test]
    async fn empty_fingerprint_skips_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let status = checker(&server, Duration::from_millis(500)).check("").await;
        assert_eq!(status, BanStatus::Clear);
    }

    #[tokio::test]
    async fn unconfigured_checker_is_noop() {
        let checker = from_config(&DeviceConfig::default()).unwrap();
        assert_eq!(checker.check("anything").await, BanStatus::Clear);
    }
}
