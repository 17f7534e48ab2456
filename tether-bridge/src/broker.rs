//! HTTP client for the broker's token endpoints.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Token material as served by the broker. The refresh token never
/// leaves the broker; the bridge only ever holds the access side.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenInfo {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenInfo {
    /// Seconds until expiry, if the broker reported one. Negative values
    /// clamp to zero.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_at.map(|at| {
            let secs = at - chrono::Utc::now().timestamp();
            Duration::from_secs(secs.max(0) as u64)
        })
    }
}

/// HTTP client for communicating with the broker.
pub struct BrokerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl BrokerClient {
    /// Create a new broker client.
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the broker (e.g., "http://localhost:3002")
    /// * `api_key` - Key sent as `X-API-Key` when the broker gates access
    /// * `timeout` - Per-request timeout
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        // Ensure base_url doesn't have trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        Self {
            client,
            base_url,
            api_key,
        }
    }

    /// Fetch the current token for a connection.
    pub async fn get_token(&self, connection_id: &str) -> Result<TokenInfo> {
        let url = format!("{}/connections/{}/token", self.base_url, connection_id);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach the broker")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Broker refused the token request with status {}",
                response.status()
            );
        }

        response
            .json()
            .await
            .context("Failed to parse broker token response")
    }

    /// Ask the broker to refresh the connection's credentials upstream
    /// and return the replacement token.
    pub async fn refresh_token(&self, connection_id: &str) -> Result<TokenInfo> {
        let url = format!("{}/connections/{}/refresh", self.base_url, connection_id);
        let mut request = self.client.post(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .context("Failed to reach the broker")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Broker refused the refresh request with status {}",
                response.status()
            );
        }

        response
            .json()
            .await
            .context("Failed to parse broker token response")
    }
}
