//! Callback execution: state validation, code exchange, sealing, state
//! machine transition and the final browser redirect.

use crate::oidc::{self, DiscoveryCache, IdTokenVerifier};
use crate::server::metrics;
use crate::state_token::StateCodec;
use crate::store::{BrokerStore, Connection, ConnectionStatus, ProviderProfile};
use crate::vault::{TokenEndpointResponse, TokenPayload, TokenVault};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// How long a pending connection stays redeemable, matching the signed
/// state lifetime.
const CONNECTION_TTL_SECS: i64 = 600;

/// What the HTTP layer should do with the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackDisposition {
    /// 302 to the agent's return URL, success or failure alike.
    Redirect(String),
    /// No trustworthy return URL; answer with a generic 4xx. The code is
    /// short and reveals nothing about the state contents.
    Reject { code: &'static str },
}

enum ExchangeFailure {
    ExchangeError,
    IdTokenInvalid,
    DiscoveryUnavailable,
    StorageError,
}

impl ExchangeFailure {
    fn code(&self) -> &'static str {
        match self {
            ExchangeFailure::ExchangeError => "exchange_error",
            ExchangeFailure::IdTokenInvalid => "id_token_invalid",
            ExchangeFailure::DiscoveryUnavailable => "discovery_unavailable",
            ExchangeFailure::StorageError => "storage_error",
        }
    }
}

pub struct CallbackExecutor {
    store: Arc<dyn BrokerStore>,
    codec: Arc<StateCodec>,
    discovery: Arc<DiscoveryCache>,
    verifier: Arc<IdTokenVerifier>,
    vault: Arc<TokenVault>,
    client: reqwest::Client,
    redirect_uri: String,
}

impl CallbackExecutor {
    pub fn new(
        store: Arc<dyn BrokerStore>,
        codec: Arc<StateCodec>,
        discovery: Arc<DiscoveryCache>,
        verifier: Arc<IdTokenVerifier>,
        vault: Arc<TokenVault>,
        redirect_uri: String,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client for code exchange");
        Self {
            store,
            codec,
            discovery,
            verifier,
            vault,
            client,
            redirect_uri,
        }
    }

    /// Process a provider redirect. Never panics, never leaks state
    /// contents; every outcome is either a redirect or a generic reject.
    pub async fn execute(
        &self,
        code: Option<&str>,
        state: &str,
        provider_error: Option<&str>,
    ) -> CallbackDisposition {
        let payload = match self.codec.verify(state) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Callback with unverifiable state: {}", e);
                metrics::record_callback("unknown", "invalid_state");
                return CallbackDisposition::Reject {
                    code: "invalid_state",
                };
            }
        };

        let connection = match self.store.get_connection(&payload.nonce) {
            Ok(Some(connection)) => connection,
            Ok(None) => {
                warn!("Callback for unknown connection");
                metrics::record_callback("unknown", "unknown_connection");
                return CallbackDisposition::Reject {
                    code: "unknown_connection",
                };
            }
            Err(e) => {
                warn!("Failed to load connection for callback: {}", e);
                metrics::record_callback("unknown", "storage_error");
                return CallbackDisposition::Reject {
                    code: "storage_error",
                };
            }
        };

        let provider = match self.store.get_provider(&connection.provider_id) {
            Ok(Some(provider)) => provider,
            _ => {
                metrics::record_callback("unknown", "storage_error");
                return self.failure(&connection, "unknown", "storage_error");
            }
        };
        let provider_name = provider.name.clone();

        if connection.status != ConnectionStatus::Pending {
            warn!(
                "Callback replay for connection {} in state {:?}",
                connection.id, connection.status
            );
            metrics::record_callback(&provider_name, "unknown_connection");
            return self.failure(&connection, &provider_name, "unknown_connection");
        }

        let age = chrono::Utc::now().timestamp() - connection.created_at;
        if age > CONNECTION_TTL_SECS {
            let _ = self.store.fail_connection(&connection.id, "expired");
            metrics::record_callback(&provider_name, "expired");
            return self.failure(&connection, &provider_name, "expired");
        }

        if let Some(error) = provider_error {
            // The user declined at the consent screen, or the provider
            // aborted; the error code is theirs, the reason stays ours.
            info!(
                "Provider returned error '{}' for connection {}",
                error, connection.id
            );
            let _ = self.store.fail_connection(&connection.id, "provider_error");
            metrics::record_callback(&provider_name, "provider_error");
            return self.failure(&connection, &provider_name, "exchange_error");
        }

        let code = match code {
            Some(code) if !code.is_empty() => code,
            _ => {
                let _ = self.store.fail_connection(&connection.id, "missing_code");
                metrics::record_callback(&provider_name, "missing_code");
                return self.failure(&connection, &provider_name, "exchange_error");
            }
        };

        match self.run_exchange(&connection, &provider, code).await {
            Ok(()) => {
                info!(
                    "Connection {} active for workspace {} via {}",
                    connection.id, connection.workspace_id, provider_name
                );
                metrics::record_callback(&provider_name, "success");
                self.success(&connection, &provider_name)
            }
            Err(failure) => {
                let _ = self.store.fail_connection(&connection.id, failure.code());
                metrics::record_callback(&provider_name, failure.code());
                self.failure(&connection, &provider_name, failure.code())
            }
        }
    }

    /// Steps 3-7: exchange, verify, seal, persist, activate. The
    /// connection flips to active only after the credential row is
    /// durably stored.
    async fn run_exchange(
        &self,
        connection: &Connection,
        provider: &ProviderProfile,
        code: &str,
    ) -> Result<(), ExchangeFailure> {
        let token_endpoint = oidc::resolve_token_endpoint(&self.discovery, provider)
            .await
            .ok_or(ExchangeFailure::ExchangeError)?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.redirect_uri.clone()),
            ("code_verifier", connection.pkce_verifier.clone()),
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
            .map_err(|e| {
                warn!("Code exchange request failed: {}", e);
                metrics::record_token_exchange("network_error");
                ExchangeFailure::ExchangeError
            })?;

        if !response.status().is_success() {
            warn!(
                "Token endpoint for {} answered {}",
                provider.name,
                response.status()
            );
            metrics::record_token_exchange("rejected");
            return Err(ExchangeFailure::ExchangeError);
        }

        let tokens: TokenEndpointResponse = response.json().await.map_err(|e| {
            warn!("Token endpoint returned unparseable body: {}", e);
            metrics::record_token_exchange("bad_response");
            ExchangeFailure::ExchangeError
        })?;
        metrics::record_token_exchange("success");

        let openid_requested = connection.scopes.iter().any(|s| s == "openid");
        let verified_id_token = match (&tokens.id_token, openid_requested) {
            (Some(raw), true) => {
                self.verify_id_token(connection, provider, raw).await?;
                Some(raw.clone())
            }
            (None, true) => {
                warn!(
                    "Provider {} omitted the ID token for an openid flow",
                    provider.name
                );
                return Err(ExchangeFailure::IdTokenInvalid);
            }
            (Some(raw), false) => {
                // Unsolicited ID token: keep it only if it checks out
                match self.verify_id_token(connection, provider, raw).await {
                    Ok(()) => Some(raw.clone()),
                    Err(_) => {
                        warn!(
                            "Dropping unverifiable unsolicited ID token from {}",
                            provider.name
                        );
                        None
                    }
                }
            }
            (None, false) => None,
        };

        let payload = TokenPayload {
            access_token: tokens.access_token.clone(),
            token_type: tokens.token_type.clone(),
            refresh_token: tokens.refresh_token.clone(),
            scope: tokens.scope.clone(),
        };
        self.vault
            .put(
                &connection.id,
                &payload,
                tokens.expires_at(),
                verified_id_token.as_deref(),
            )
            .map_err(|e| {
                warn!("Failed to store credentials: {}", e);
                ExchangeFailure::StorageError
            })?;

        let activated = self
            .store
            .activate_connection(&connection.id)
            .map_err(|_| ExchangeFailure::StorageError)?;
        if !activated {
            // Lost a race against the expiry sweeper or a duplicate callback
            warn!("Connection {} no longer pending at activation", connection.id);
            return Err(ExchangeFailure::StorageError);
        }
        Ok(())
    }

    async fn verify_id_token(
        &self,
        connection: &Connection,
        provider: &ProviderProfile,
        raw: &str,
    ) -> Result<(), ExchangeFailure> {
        let issuer = oidc::issuer_for(provider).ok_or(ExchangeFailure::DiscoveryUnavailable)?;
        let audience = provider
            .client_id
            .as_deref()
            .ok_or(ExchangeFailure::IdTokenInvalid)?;

        self.verifier
            .verify(&issuer, raw, audience, Some(&connection.id))
            .await
            .map_err(|e| {
                warn!(
                    "ID token verification failed for connection {}: {}",
                    connection.id, e
                );
                match e {
                    oidc::VerifyError::DiscoveryUnavailable(_) => {
                        ExchangeFailure::DiscoveryUnavailable
                    }
                    _ => ExchangeFailure::IdTokenInvalid,
                }
            })
            .map(|_| ())
    }

    fn success(&self, connection: &Connection, provider_name: &str) -> CallbackDisposition {
        CallbackDisposition::Redirect(redirect_to(
            &connection.return_url,
            "success",
            &connection.id,
            provider_name,
        ))
    }

    fn failure(
        &self,
        connection: &Connection,
        provider_name: &str,
        code: &str,
    ) -> CallbackDisposition {
        let mut url = redirect_to(
            &connection.return_url,
            "failure",
            &connection.id,
            provider_name,
        );
        if let Ok(mut parsed) = Url::parse(&url) {
            parsed.query_pairs_mut().append_pair("error", code);
            url = parsed.into();
        }
        CallbackDisposition::Redirect(url)
    }
}

fn redirect_to(return_url: &str, status: &str, connection_id: &str, provider_name: &str) -> String {
    match Url::parse(return_url) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("status", status)
                .append_pair("connection_id", connection_id)
                .append_pair("provider", provider_name);
            url.into()
        }
        Err(_) => {
            let sep = if return_url.contains('?') { '&' } else { '?' };
            format!(
                "{}{}status={}&connection_id={}&provider={}",
                return_url,
                sep,
                status,
                urlencoding::encode(connection_id),
                urlencoding::encode(provider_name)
            )
        }
    }
}
