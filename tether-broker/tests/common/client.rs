//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with helpers for every broker endpoint. When routes or
//! request formats change, update only this file.

use super::constants::*;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;

/// HTTP test client carrying the test API key
pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    /// The base URL of the test server
    pub base_url: String,
    api_key: Option<String>,
}

impl TestClient {
    /// Creates a client that sends the standard test API key.
    pub fn new(base_url: String) -> Self {
        Self::with_api_key(base_url, Some(TEST_API_KEY.to_string()))
    }

    /// Creates a client without credentials, for testing the auth gate.
    pub fn anonymous(base_url: String) -> Self {
        Self::with_api_key(base_url, None)
    }

    fn with_api_key(base_url: String, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            // Callbacks answer with redirects the tests must observe
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn attach_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    // ========================================================================
    // Provider endpoints
    // ========================================================================

    /// POST /providers
    pub async fn create_provider(&self, body: &Value) -> Response {
        self.attach_key(self.client.post(format!("{}/providers", self.base_url)))
            .json(body)
            .send()
            .await
            .expect("Create provider request failed")
    }

    /// GET /providers
    pub async fn list_providers(&self) -> Response {
        self.attach_key(self.client.get(format!("{}/providers", self.base_url)))
            .send()
            .await
            .expect("List providers request failed")
    }

    /// GET /providers/{id}
    pub async fn get_provider(&self, id: &str) -> Response {
        self.attach_key(self.client.get(format!("{}/providers/{}", self.base_url, id)))
            .send()
            .await
            .expect("Get provider request failed")
    }

    /// GET /providers/by-name/{name}
    pub async fn get_provider_by_name(&self, name: &str) -> Response {
        self.attach_key(
            self.client
                .get(format!("{}/providers/by-name/{}", self.base_url, name)),
        )
        .send()
        .await
        .expect("Get provider by name request failed")
    }

    /// PUT /providers/{id}
    pub async fn update_provider(&self, id: &str, body: &Value) -> Response {
        self.attach_key(self.client.put(format!("{}/providers/{}", self.base_url, id)))
            .json(body)
            .send()
            .await
            .expect("Update provider request failed")
    }

    /// DELETE /providers/{id}
    pub async fn delete_provider(&self, id: &str) -> Response {
        self.attach_key(
            self.client
                .delete(format!("{}/providers/{}", self.base_url, id)),
        )
        .send()
        .await
        .expect("Delete provider request failed")
    }

    /// Registers an oauth2 provider against a stub and returns its id.
    pub async fn register_stub_provider(
        &self,
        name: &str,
        stub: &super::fixtures::StubProvider,
        scopes: &[&str],
    ) -> String {
        let response = self
            .create_provider(&json!({
                "name": name,
                "auth_kind": "oauth2",
                "client_id": TEST_CLIENT_ID,
                "client_secret": "secret-1",
                "auth_url": stub.authorize_url(),
                "token_url": stub.token_url(),
                "issuer": stub.base_url,
                "default_scopes": scopes,
            }))
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        response.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    // ========================================================================
    // Handshake endpoints
    // ========================================================================

    /// POST /auth/consent-spec
    pub async fn consent_spec(
        &self,
        workspace_id: &str,
        provider_id: &str,
        scopes: &[&str],
        return_url: &str,
    ) -> Response {
        self.attach_key(
            self.client
                .post(format!("{}/auth/consent-spec", self.base_url)),
        )
        .json(&json!({
            "workspace_id": workspace_id,
            "provider_id": provider_id,
            "scopes": scopes,
            "return_url": return_url,
        }))
        .send()
        .await
        .expect("Consent spec request failed")
    }

    /// GET /auth/callback?code=…&state=…
    pub async fn callback(&self, code: Option<&str>, state: &str) -> Response {
        let mut query: Vec<(&str, &str)> = vec![("state", state)];
        if let Some(code) = code {
            query.push(("code", code));
        }
        self.client
            .get(format!("{}/auth/callback", self.base_url))
            .query(&query)
            .send()
            .await
            .expect("Callback request failed")
    }

    /// GET /auth/callback carrying a provider error instead of a code
    pub async fn callback_with_error(&self, state: &str, error: &str) -> Response {
        self.client
            .get(format!("{}/auth/callback", self.base_url))
            .query(&[("state", state), ("error", error)])
            .send()
            .await
            .expect("Callback request failed")
    }

    // ========================================================================
    // Connection token endpoints
    // ========================================================================

    /// GET /connections/{id}/token
    pub async fn get_token(&self, connection_id: &str) -> Response {
        self.attach_key(self.client.get(format!(
            "{}/connections/{}/token",
            self.base_url, connection_id
        )))
        .send()
        .await
        .expect("Get token request failed")
    }

    /// POST /connections/{id}/refresh
    pub async fn refresh_token(&self, connection_id: &str) -> Response {
        self.attach_key(self.client.post(format!(
            "{}/connections/{}/refresh",
            self.base_url, connection_id
        )))
        .send()
        .await
        .expect("Refresh token request failed")
    }

    // ========================================================================
    // Operational endpoints
    // ========================================================================

    /// GET /health
    pub async fn health(&self) -> Response {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .expect("Health request failed")
    }

    /// GET /metrics
    pub async fn metrics(&self) -> Response {
        self.client
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await
            .expect("Metrics request failed")
    }
}
