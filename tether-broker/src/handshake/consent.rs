//! Consent spec construction: PKCE, signed state and the authorization URL.

use crate::oidc::{self, DiscoveryCache};
use crate::server::metrics;
use crate::state_token::{StateCodec, StatePayload};
use crate::store::{BrokerStore, Connection, ConnectionStatus, ProviderProfile};
use anyhow::Context;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("provider not found")]
    ProviderNotFound,
    #[error("return_url is not in the allowed domains")]
    ForbiddenReturnUrl,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ConsentSettings {
    /// base_url + redirect_path; sent to the provider verbatim.
    pub redirect_uri: String,
    /// Empty list disables return-URL enforcement.
    pub allowed_return_domains: Vec<String>,
}

/// What the agent gets back: everything needed to send a user through
/// the provider's consent screen and correlate the eventual callback.
#[derive(Debug, Clone)]
pub struct ConsentSpec {
    pub auth_url: String,
    pub state: String,
    pub connection_id: String,
    pub scopes: Vec<String>,
    pub provider_id: String,
}

pub struct ConsentBuilder {
    store: Arc<dyn BrokerStore>,
    codec: Arc<StateCodec>,
    discovery: Arc<DiscoveryCache>,
    settings: ConsentSettings,
}

/// `base64url(SHA256(verifier))`, the S256 PKCE transform.
pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn generate_pkce_verifier() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn is_google(provider: &ProviderProfile, auth_endpoint: &str) -> bool {
    if provider.name == "google" {
        return true;
    }
    Url::parse(auth_endpoint)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|host| host == "accounts.google.com" || host.ends_with(".google.com"))
        .unwrap_or(false)
}

impl ConsentBuilder {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        codec: Arc<StateCodec>,
        discovery: Arc<DiscoveryCache>,
        settings: ConsentSettings,
    ) -> Self {
        Self {
            store,
            codec,
            discovery,
            settings,
        }
    }

    /// Build a consent spec for (workspace, provider, scopes, return).
    ///
    /// Pre-allocates the connection id, persists the pending connection
    /// with its PKCE verifier, and signs the continuation state.
    pub async fn build_consent(
        &self,
        workspace_id: &str,
        provider_id: &str,
        requested_scopes: &[String],
        return_url: &str,
    ) -> Result<ConsentSpec, ConsentError> {
        let provider = self
            .load_provider(provider_id)
            .map_err(ConsentError::Internal)?
            .ok_or(ConsentError::ProviderNotFound)?;

        self.check_return_url(return_url)?;

        let requested: Vec<String> = if requested_scopes.is_empty() {
            provider.default_scopes.clone()
        } else {
            requested_scopes.to_vec()
        };

        let pkce_verifier = generate_pkce_verifier();
        let code_challenge = pkce_challenge(&pkce_verifier);
        let connection_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now();

        self.store
            .insert_connection(&Connection {
                id: connection_id.clone(),
                workspace_id: workspace_id.to_string(),
                provider_id: provider.id.clone(),
                scopes: requested.clone(),
                return_url: return_url.to_string(),
                status: ConnectionStatus::Pending,
                failure_reason: None,
                pkce_verifier: pkce_verifier.clone(),
                created_at: now.timestamp(),
            })
            .context("Failed to persist pending connection")?;

        let auth_endpoint = oidc::resolve_authorization_endpoint(&self.discovery, &provider)
            .await
            .ok_or_else(|| {
                anyhow::anyhow!("provider {} has no authorization endpoint", provider.name)
            })?;

        let state = self.codec.sign(&StatePayload {
            workspace_id: workspace_id.to_string(),
            provider_id: provider.id.clone(),
            nonce: connection_id.clone(),
            iat: now,
        });

        let google = is_google(&provider, &auth_endpoint);
        let mut effective_scopes = requested;
        if google {
            // Google rejects the RFC scope and wants its own knobs instead
            effective_scopes.retain(|s| s != "offline_access");
        }

        let mut url = Url::parse(&auth_endpoint)
            .with_context(|| format!("Invalid authorization endpoint {}", auth_endpoint))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            if let Some(client_id) = &provider.client_id {
                query.append_pair("client_id", client_id);
            }
            query.append_pair("redirect_uri", &self.settings.redirect_uri);
            query.append_pair("scope", &effective_scopes.join(" "));
            if google {
                query.append_pair("access_type", "offline");
                query.append_pair("prompt", "consent");
            }
            query.append_pair("state", &state);
            query.append_pair("code_challenge", &code_challenge);
            query.append_pair("code_challenge_method", "S256");
            if effective_scopes.iter().any(|s| s == "openid") {
                query.append_pair("nonce", &connection_id);
            }
            for (key, value) in &provider.extra_params {
                query.append_pair(key, value);
            }
        }

        debug!(
            "Issued consent spec for workspace {} provider {} connection {}",
            workspace_id, provider.name, connection_id
        );
        metrics::record_consent_spec(&provider.name, "success");

        Ok(ConsentSpec {
            auth_url: url.into(),
            state,
            connection_id,
            scopes: effective_scopes,
            provider_id: provider.id,
        })
    }

    /// Providers are addressed by id; a short name is accepted as a
    /// convenience for embedders that skip the gateway.
    fn load_provider(&self, provider_ref: &str) -> anyhow::Result<Option<ProviderProfile>> {
        if let Some(provider) = self.store.get_provider(provider_ref)? {
            if provider.deleted {
                return Ok(None);
            }
            return Ok(Some(provider));
        }
        self.store.get_provider_by_name(provider_ref)
    }

    fn check_return_url(&self, return_url: &str) -> Result<(), ConsentError> {
        if self.settings.allowed_return_domains.is_empty() {
            return Ok(());
        }
        let url = Url::parse(return_url).map_err(|_| ConsentError::ForbiddenReturnUrl)?;
        let host = match url.host_str() {
            Some(host) => host.to_ascii_lowercase(),
            None => return Err(ConsentError::ForbiddenReturnUrl),
        };
        let allowed = self.settings.allowed_return_domains.iter().any(|domain| {
            host == *domain || host.ends_with(&format!(".{}", domain))
        });
        if !allowed {
            warn!("Rejected return_url with host {}", host);
            return Err(ConsentError::ForbiddenReturnUrl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthKind, SqliteBrokerStore};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    fn provider(name: &str, scopes: &[&str]) -> ProviderProfile {
        ProviderProfile {
            id: format!("prov-{}", name),
            name: name.to_string(),
            auth_kind: AuthKind::Oauth2,
            client_id: Some("client-1".to_string()),
            client_secret: Some("secret-1".to_string()),
            auth_url: Some("https://idp.example.com/authorize".to_string()),
            token_url: Some("https://idp.example.com/token".to_string()),
            issuer: None,
            enable_discovery: false,
            default_scopes: scopes.iter().map(|s| s.to_string()).collect(),
            extra_params: BTreeMap::new(),
            credential_schema: None,
            deleted: false,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn builder(
        allowed_return_domains: Vec<String>,
    ) -> (tempfile::TempDir, Arc<SqliteBrokerStore>, ConsentBuilder) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteBrokerStore::new(dir.path().join("broker.db")).unwrap());
        let builder = ConsentBuilder::new(
            store.clone(),
            Arc::new(StateCodec::new([3u8; 32])),
            Arc::new(DiscoveryCache::new(Duration::from_secs(1))),
            ConsentSettings {
                redirect_uri: "http://localhost:3002/auth/callback".to_string(),
                allowed_return_domains,
            },
        );
        (dir, store, builder)
    }

    fn query_map(auth_url: &str) -> HashMap<String, String> {
        Url::parse(auth_url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn consent_url_carries_the_code_flow_parameters() {
        let (_dir, store, builder) = builder(vec![]);
        store
            .create_provider(&provider("acme", &["profile", "email"]))
            .unwrap();

        let spec = builder
            .build_consent("ws1", "prov-acme", &[], "http://localhost/cb")
            .await
            .unwrap();
        let query = query_map(&spec.auth_url);

        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-1");
        assert_eq!(query["redirect_uri"], "http://localhost:3002/auth/callback");
        assert_eq!(query["scope"], "profile email");
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(query["state"], spec.state);
        // No openid scope, no nonce parameter
        assert!(!query.contains_key("nonce"));
        assert_eq!(spec.scopes, vec!["profile", "email"]);
    }

    #[tokio::test]
    async fn challenge_matches_the_stored_verifier() {
        let (_dir, store, builder) = builder(vec![]);
        store.create_provider(&provider("acme", &["email"])).unwrap();

        let spec = builder
            .build_consent("ws1", "prov-acme", &[], "http://localhost/cb")
            .await
            .unwrap();
        let query = query_map(&spec.auth_url);

        let connection = store.get_connection(&spec.connection_id).unwrap().unwrap();
        assert_eq!(connection.status, ConnectionStatus::Pending);
        assert_eq!(query["code_challenge"], pkce_challenge(&connection.pkce_verifier));
        // Unpadded base64url of 32 random bytes
        assert_eq!(connection.pkce_verifier.len(), 43);
    }

    #[tokio::test]
    async fn state_verifies_and_nonce_is_the_connection_id() {
        let (_dir, store, builder) = builder(vec![]);
        store
            .create_provider(&provider("acme", &["openid", "email"]))
            .unwrap();

        let spec = builder
            .build_consent("ws1", "prov-acme", &[], "http://localhost/cb")
            .await
            .unwrap();
        let query = query_map(&spec.auth_url);

        let payload = StateCodec::new([3u8; 32]).verify(&spec.state).unwrap();
        assert_eq!(payload.workspace_id, "ws1");
        assert_eq!(payload.provider_id, "prov-acme");
        assert_eq!(payload.nonce, spec.connection_id);
        assert_eq!(query["nonce"], spec.connection_id);
    }

    #[tokio::test]
    async fn google_gets_offline_access_rewritten() {
        let (_dir, store, builder) = builder(vec![]);
        let mut google = provider("google", &["openid", "email", "offline_access"]);
        google.auth_url = Some("https://accounts.google.com/o/oauth2/v2/auth".to_string());
        store.create_provider(&google).unwrap();

        let spec = builder
            .build_consent("ws1", "prov-google", &[], "http://localhost/cb")
            .await
            .unwrap();
        let query = query_map(&spec.auth_url);

        assert_eq!(query["access_type"], "offline");
        assert_eq!(query["prompt"], "consent");
        assert_eq!(query["scope"], "openid email");
        assert!(!spec.scopes.contains(&"offline_access".to_string()));
    }

    #[tokio::test]
    async fn requested_scopes_override_defaults() {
        let (_dir, store, builder) = builder(vec![]);
        store.create_provider(&provider("acme", &["email"])).unwrap();

        let spec = builder
            .build_consent(
                "ws1",
                "prov-acme",
                &["custom.read".to_string()],
                "http://localhost/cb",
            )
            .await
            .unwrap();
        assert_eq!(spec.scopes, vec!["custom.read"]);
    }

    #[tokio::test]
    async fn extra_params_are_appended() {
        let (_dir, store, builder) = builder(vec![]);
        let mut acme = provider("acme", &["email"]);
        acme.extra_params
            .insert("audience".to_string(), "https://api.acme.test".to_string());
        store.create_provider(&acme).unwrap();

        let spec = builder
            .build_consent("ws1", "prov-acme", &[], "http://localhost/cb")
            .await
            .unwrap();
        assert_eq!(query_map(&spec.auth_url)["audience"], "https://api.acme.test");
    }

    #[tokio::test]
    async fn unknown_and_deleted_providers_are_rejected() {
        let (_dir, store, builder) = builder(vec![]);
        let result = builder
            .build_consent("ws1", "nope", &[], "http://localhost/cb")
            .await;
        assert!(matches!(result, Err(ConsentError::ProviderNotFound)));

        store.create_provider(&provider("acme", &["email"])).unwrap();
        store.soft_delete_provider("prov-acme").unwrap();
        let result = builder
            .build_consent("ws1", "prov-acme", &[], "http://localhost/cb")
            .await;
        assert!(matches!(result, Err(ConsentError::ProviderNotFound)));
    }

    #[tokio::test]
    async fn provider_is_resolvable_by_short_name() {
        let (_dir, store, builder) = builder(vec![]);
        store.create_provider(&provider("acme", &["email"])).unwrap();

        let spec = builder
            .build_consent("ws1", "acme", &[], "http://localhost/cb")
            .await
            .unwrap();
        assert_eq!(spec.provider_id, "prov-acme");
    }

    #[tokio::test]
    async fn return_url_enforcement_accepts_listed_domains_only() {
        let (_dir, store, builder) = builder(vec!["agents.example.com".to_string()]);
        store.create_provider(&provider("acme", &["email"])).unwrap();

        assert!(builder
            .build_consent("ws1", "prov-acme", &[], "https://agents.example.com/done")
            .await
            .is_ok());
        assert!(builder
            .build_consent("ws1", "prov-acme", &[], "https://sub.agents.example.com/done")
            .await
            .is_ok());

        for bad in [
            "https://evil.example.net/done",
            "https://agents.example.com.evil.net/done",
            "not-a-url",
        ] {
            let result = builder.build_consent("ws1", "prov-acme", &[], bad).await;
            assert!(
                matches!(result, Err(ConsentError::ForbiddenReturnUrl)),
                "return_url {:?}",
                bad
            );
        }
    }
}
