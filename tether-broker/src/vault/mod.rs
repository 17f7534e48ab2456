//! The token vault: sealed persistence and refresh of provider credentials.

use crate::crypto::{CipherError, TokenCipher};
use crate::oidc::{self, DiscoveryCache};
use crate::server::metrics;
use crate::store::{BrokerStore, NewCredential, ProviderProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no credentials for connection")]
    NotFound,
    #[error("stored credential cannot be decrypted")]
    DecryptFailure,
    #[error("connection has no refresh token")]
    NoRefreshToken,
    #[error("provider rejected the request: {0}")]
    ProviderRejected(String),
    #[error("provider unreachable: {0}")]
    Network(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<CipherError> for VaultError {
    fn from(_: CipherError) -> Self {
        VaultError::DecryptFailure
    }
}

/// The sealed portion of a credential row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A decrypted view of the newest credential row for a connection.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub payload: TokenPayload,
    pub id_token: Option<String>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// JSON body returned by provider token endpoints for both the
/// authorization-code and refresh grants.
#[derive(Debug, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenEndpointResponse {
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs)
    }
}

/// Seals, persists and refreshes credential rows. Rows are append-only;
/// concurrent refreshes may race and both insert, which is harmless
/// because reads always take the newest row.
pub struct TokenVault {
    store: Arc<dyn BrokerStore>,
    cipher: TokenCipher,
    discovery: Arc<DiscoveryCache>,
    client: reqwest::Client,
}

impl TokenVault {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        cipher: TokenCipher,
        discovery: Arc<DiscoveryCache>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client for token vault");
        Self {
            store,
            cipher,
            discovery,
            client,
        }
    }

    /// Seal and append a credential row for a connection.
    pub fn put(
        &self,
        connection_id: &str,
        payload: &TokenPayload,
        expires_at: Option<i64>,
        id_token: Option<&str>,
    ) -> Result<i64, VaultError> {
        let sealed = self.cipher.seal(&serde_json::to_vec(payload).unwrap());
        let sealed_id_token = id_token.map(|t| self.cipher.seal(t.as_bytes()));
        self.store
            .insert_credential(&NewCredential {
                connection_id: connection_id.to_string(),
                payload: sealed,
                has_access: !payload.access_token.is_empty(),
                has_refresh: payload.refresh_token.is_some(),
                expires_at,
                id_token: sealed_id_token,
            })
            .map_err(|e| VaultError::Storage(e.to_string()))
    }

    /// Decrypt and return the newest credential row for a connection.
    pub fn get(&self, connection_id: &str) -> Result<TokenRecord, VaultError> {
        let record = self
            .store
            .latest_credential(connection_id)
            .map_err(|e| VaultError::Storage(e.to_string()))?
            .ok_or(VaultError::NotFound)?;

        let payload: TokenPayload = serde_json::from_slice(&self.cipher.open(&record.payload)?)
            .map_err(|_| VaultError::DecryptFailure)?;
        let id_token = match record.id_token {
            Some(sealed) => Some(
                String::from_utf8(self.cipher.open(&sealed)?)
                    .map_err(|_| VaultError::DecryptFailure)?,
            ),
            None => None,
        };

        Ok(TokenRecord {
            payload,
            id_token,
            expires_at: record.expires_at,
            created_at: record.created_at,
        })
    }

    /// Exchange the stored refresh token for fresh credentials and append
    /// the result as a new row.
    pub async fn refresh(&self, connection_id: &str) -> Result<TokenRecord, VaultError> {
        let connection = self
            .store
            .get_connection(connection_id)
            .map_err(|e| VaultError::Storage(e.to_string()))?
            .ok_or(VaultError::NotFound)?;
        let provider = self
            .store
            .get_provider(&connection.provider_id)
            .map_err(|e| VaultError::Storage(e.to_string()))?
            .ok_or_else(|| VaultError::Storage("provider missing".to_string()))?;

        let current = self.get(connection_id)?;
        let refresh_token = current
            .payload
            .refresh_token
            .clone()
            .ok_or(VaultError::NoRefreshToken)?;

        let response = self
            .request_refresh(&provider, &refresh_token)
            .await
            .inspect_err(|_| metrics::record_token_refresh("failure"))?;

        let payload = TokenPayload {
            access_token: response.access_token,
            token_type: response.token_type,
            // Providers may rotate or omit the refresh token; keep the
            // old one when omitted so the connection stays refreshable.
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            scope: response.scope.or(current.payload.scope),
        };
        let expires_at = response
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp() + secs);

        self.put(connection_id, &payload, expires_at, None)?;
        metrics::record_token_refresh("success");
        info!("Refreshed credentials for connection {}", connection_id);

        Ok(TokenRecord {
            payload,
            id_token: current.id_token,
            expires_at,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn request_refresh(
        &self,
        provider: &ProviderProfile,
        refresh_token: &str,
    ) -> Result<TokenEndpointResponse, VaultError> {
        let token_endpoint = oidc::resolve_token_endpoint(&self.discovery, provider)
            .await
            .ok_or_else(|| VaultError::Storage("provider has no token endpoint".to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(client_id) = &provider.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(client_secret) = &provider.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }

        let response = self
            .client
            .post(&token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| VaultError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(
                "Refresh rejected by {} with status {}",
                provider.name, status
            );
            return Err(VaultError::ProviderRejected(format!("status {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| VaultError::Network(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteBrokerStore;

    fn vault() -> (tempfile::TempDir, TokenVault) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteBrokerStore::new(dir.path().join("broker.db")).unwrap());
        let discovery = Arc::new(DiscoveryCache::new(Duration::from_secs(1)));
        let vault = TokenVault::new(
            store,
            TokenCipher::new(&[9u8; 32]),
            discovery,
            Duration::from_secs(1),
        );
        (dir, vault)
    }

    fn payload(access: &str, refresh: Option<&str>) -> TokenPayload {
        TokenPayload {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: refresh.map(|r| r.to_string()),
            scope: None,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, vault) = vault();
        vault
            .put("conn-1", &payload("at-1", Some("rt-1")), Some(123), Some("idt"))
            .unwrap();

        let record = vault.get("conn-1").unwrap();
        assert_eq!(record.payload.access_token, "at-1");
        assert_eq!(record.payload.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(record.expires_at, Some(123));
        assert_eq!(record.id_token.as_deref(), Some("idt"));
    }

    #[test]
    fn get_returns_the_latest_of_multiple_rows() {
        let (_dir, vault) = vault();
        vault.put("conn-1", &payload("v1", None), None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        vault.put("conn-1", &payload("v2", None), None, None).unwrap();

        assert_eq!(vault.get("conn-1").unwrap().payload.access_token, "v2");
    }

    #[test]
    fn rows_are_sealed_at_rest() {
        let (_dir, vault) = vault();
        vault.put("conn-1", &payload("super-secret", None), None, None).unwrap();

        let raw = vault.store.latest_credential("conn-1").unwrap().unwrap();
        let serialized = String::from_utf8_lossy(&raw.payload);
        assert!(!serialized.contains("super-secret"));
        assert!(raw.has_access);
        assert!(!raw.has_refresh);
    }

    #[test]
    fn wrong_key_reads_fail_closed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteBrokerStore::new(dir.path().join("broker.db")).unwrap());
        let discovery = Arc::new(DiscoveryCache::new(Duration::from_secs(1)));
        let writer = TokenVault::new(
            store.clone(),
            TokenCipher::new(&[1u8; 32]),
            discovery.clone(),
            Duration::from_secs(1),
        );
        let reader = TokenVault::new(
            store,
            TokenCipher::new(&[2u8; 32]),
            discovery,
            Duration::from_secs(1),
        );

        writer.put("conn-1", &payload("at", None), None, None).unwrap();
        assert!(matches!(
            reader.get("conn-1"),
            Err(VaultError::DecryptFailure)
        ));
    }

    #[test]
    fn missing_connection_is_not_found() {
        let (_dir, vault) = vault();
        assert!(matches!(vault.get("nope"), Err(VaultError::NotFound)));
    }
}
