//! Persistent broker entities.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Oauth2,
    ApiKey,
    BasicAuth,
}

impl AuthKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::Oauth2 => "oauth2",
            AuthKind::ApiKey => "api_key",
            AuthKind::BasicAuth => "basic_auth",
        }
    }
}

impl FromStr for AuthKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "oauth2" => Ok(AuthKind::Oauth2),
            "api_key" => Ok(AuthKind::ApiKey),
            "basic_auth" => Ok(AuthKind::BasicAuth),
            _ => bail!("Unknown auth kind {}", s),
        }
    }
}

/// A registered upstream identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    /// URL-safe short name, unique among live providers.
    pub name: String,
    pub auth_kind: AuthKind,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub issuer: Option<String>,
    pub enable_discovery: bool,
    pub default_scopes: Vec<String>,
    /// Static query parameters appended to every consent URL.
    pub extra_params: BTreeMap<String, String>,
    /// Expected credential fields for `api_key` providers.
    pub credential_schema: Option<serde_json::Value>,
    pub deleted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProviderProfile {
    /// Registration-time validation. For oauth2 the profile must carry
    /// either both static endpoints or discovery with an issuer, plus a
    /// client credential pair.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            bail!("provider name must be lowercase alphanumeric with hyphens");
        }

        if self.auth_kind == AuthKind::Oauth2 {
            if self.client_id.as_deref().unwrap_or("").is_empty()
                || self.client_secret.as_deref().unwrap_or("").is_empty()
            {
                bail!("oauth2 provider requires client_id and client_secret");
            }
            let has_static_endpoints = self.auth_url.as_deref().unwrap_or("") != ""
                && self.token_url.as_deref().unwrap_or("") != "";
            let has_discovery =
                self.enable_discovery && self.issuer.as_deref().unwrap_or("") != "";
            if !has_static_endpoints && !has_discovery {
                bail!("oauth2 provider requires auth_url and token_url, or discovery with an issuer");
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Active,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Pending => "pending",
            ConnectionStatus::Active => "active",
            ConnectionStatus::Failed => "failed",
        }
    }
}

impl FromStr for ConnectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ConnectionStatus::Pending),
            "active" => Ok(ConnectionStatus::Active),
            "failed" => Ok(ConnectionStatus::Failed),
            _ => bail!("Unknown connection status {}", s),
        }
    }
}

/// One workspace's handshake with a provider, keyed by the unguessable
/// connection id that also serves as the OIDC nonce.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub workspace_id: String,
    pub provider_id: String,
    pub scopes: Vec<String>,
    pub return_url: String,
    pub status: ConnectionStatus,
    pub failure_reason: Option<String>,
    pub pkce_verifier: String,
    pub created_at: i64,
}

/// An append-only sealed credential row. The newest row per connection
/// wins on read.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: i64,
    pub connection_id: String,
    pub payload: Vec<u8>,
    pub has_access: bool,
    pub has_refresh: bool,
    pub expires_at: Option<i64>,
    pub id_token: Option<Vec<u8>>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub connection_id: String,
    pub payload: Vec<u8>,
    pub has_access: bool,
    pub has_refresh: bool,
    pub expires_at: Option<i64>,
    pub id_token: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth2_profile() -> ProviderProfile {
        ProviderProfile {
            id: "prov-1".to_string(),
            name: "google".to_string(),
            auth_kind: AuthKind::Oauth2,
            client_id: Some("cid".to_string()),
            client_secret: Some("csec".to_string()),
            auth_url: Some("https://accounts.google.com/o/oauth2/v2/auth".to_string()),
            token_url: Some("https://oauth2.googleapis.com/token".to_string()),
            issuer: None,
            enable_discovery: false,
            default_scopes: vec!["openid".to_string(), "email".to_string()],
            extra_params: BTreeMap::new(),
            credential_schema: None,
            deleted: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn valid_oauth2_profile_passes() {
        assert!(oauth2_profile().validate().is_ok());
    }

    #[test]
    fn oauth2_without_client_credentials_is_rejected() {
        let mut profile = oauth2_profile();
        profile.client_id = None;
        assert!(profile.validate().is_err());

        let mut profile = oauth2_profile();
        profile.client_secret = Some(String::new());
        assert!(profile.validate().is_err());
    }

    #[test]
    fn oauth2_without_endpoints_or_discovery_is_rejected() {
        let mut profile = oauth2_profile();
        profile.auth_url = None;
        assert!(profile.validate().is_err());

        let mut profile = oauth2_profile();
        profile.token_url = None;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn oauth2_with_discovery_and_issuer_passes_without_endpoints() {
        let mut profile = oauth2_profile();
        profile.auth_url = None;
        profile.token_url = None;
        profile.enable_discovery = true;
        profile.issuer = Some("https://accounts.google.com".to_string());
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn discovery_without_issuer_is_rejected() {
        let mut profile = oauth2_profile();
        profile.auth_url = None;
        profile.token_url = None;
        profile.enable_discovery = true;
        assert!(profile.validate().is_err());
    }

    #[test]
    fn provider_names_are_url_safe() {
        for bad in ["", "Has Caps", "with space", "uns@fe", "trailing/"] {
            let mut profile = oauth2_profile();
            profile.name = bad.to_string();
            assert!(profile.validate().is_err(), "name {:?}", bad);
        }

        let mut profile = oauth2_profile();
        profile.name = "my-provider-2".to_string();
        assert!(profile.validate().is_ok());
    }
}
