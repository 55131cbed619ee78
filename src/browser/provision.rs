//! Remote browser session provisioning.
//!
//! Provisioned sessions come from a hosted browser fleet: one HTTP call
//! creates a session (with proxy, adblock, captcha-solver and stealth
//! options) and the vendor hands back a session id that is turned into a
//! websocket CDP URL for the backend to attach to.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::BrowserError;

/// Capability for obtaining a remote CDP endpoint.
#[async_trait]
pub trait CdpProvisioner: Send + Sync {
    /// Provisions a fresh remote session and returns its CDP URL.
    async fn provision(&self, headless: bool) -> Result<String, BrowserError>;
}

/// HTTP client for a hosted browser-fleet provisioning API.
pub struct RemoteBrowserProvisioner {
    api_base: String,
    connect_base: String,
    api_key: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    data: ProvisionData,
}

#[derive(Debug, Deserialize)]
struct ProvisionData {
    id: String,
}

impl RemoteBrowserProvisioner {
    /// Creates a provisioner with explicit endpoints.
    ///
    /// # Arguments
    ///
    /// * `api_base` - HTTP API base (e.g. "https://api.browserfleet.example")
    /// * `connect_base` - Websocket connect base for CDP attachment
    /// * `api_key` - Vendor API key
    pub fn new(
        api_base: impl Into<String>,
        connect_base: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into(),
            connect_base: connect_base.into(),
            api_key: api_key.into(),
            http_client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Creates a provisioner from environment variables.
    ///
    /// Reads `WEBEVAL_BROWSER_API_BASE`, `WEBEVAL_BROWSER_CONNECT_BASE` and
    /// `WEBEVAL_BROWSER_API_KEY`; returns `None` when the key is unset so
    /// callers can degrade to a local browser.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("WEBEVAL_BROWSER_API_KEY").ok()?;
        let api_base = std::env::var("WEBEVAL_BROWSER_API_BASE")
            .unwrap_or_else(|_| "https://api.browserfleet.example".to_string());
        let connect_base = std::env::var("WEBEVAL_BROWSER_CONNECT_BASE")
            .unwrap_or_else(|_| "wss://connect.browserfleet.example".to_string());
        Some(Self::new(api_base, connect_base, api_key))
    }
}

#[async_trait]
impl CdpProvisioner for RemoteBrowserProvisioner {
    async fn provision(&self, headless: bool) -> Result<String, BrowserError> {
        let body = json!({
            "session": {
                "proxy": {"type": "mobile", "active": true, "country_code": "us"}
            },
            "browser": {
                "adblock": {"active": true},
                "captcha_solver": {"active": true},
                "headless": {"active": headless},
                "extra_stealth": {"active": true}
            }
        });

        let response = self
            .http_client
            .post(format!("{}/v1/sessions", self.api_base))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrowserError::ProvisioningFailed(format!(
                "status {}: {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: ProvisionResponse = response
            .json()
            .await
            .map_err(|e| BrowserError::ProvisioningResponse(e.to_string()))?;

        Ok(format!(
            "{}?apiKey={}&sessionId={}",
            self.connect_base, self.api_key, parsed.data.id
        ))
    }
}
