//! OIDC provider discovery and ID-token verification.

mod discovery;
mod verifier;

pub use discovery::{infer_issuer, DiscoveryCache, DiscoveryError, ProviderMetadata};
pub use verifier::{IdTokenClaims, IdTokenVerifier, VerifyError};

use crate::server::metrics;
use crate::store::ProviderProfile;
use tracing::warn;

/// The authorization endpoint for a provider: the discovered one when
/// discovery is enabled and succeeds, else the statically configured URL.
/// Discovery failure is soft and falls back.
pub async fn resolve_authorization_endpoint(
    discovery: &DiscoveryCache,
    provider: &ProviderProfile,
) -> Option<String> {
    resolve_endpoint(discovery, provider, |m| m.authorization_endpoint.clone())
        .await
        .or_else(|| provider.auth_url.clone())
}

/// The token endpoint for a provider, with the same fallback behavior.
pub async fn resolve_token_endpoint(
    discovery: &DiscoveryCache,
    provider: &ProviderProfile,
) -> Option<String> {
    resolve_endpoint(discovery, provider, |m| m.token_endpoint.clone())
        .await
        .or_else(|| provider.token_url.clone())
}

/// The issuer to verify ID tokens against, discovered or inferred.
pub fn issuer_for(provider: &ProviderProfile) -> Option<String> {
    infer_issuer(provider.issuer.as_deref(), provider.auth_url.as_deref())
}

async fn resolve_endpoint(
    discovery: &DiscoveryCache,
    provider: &ProviderProfile,
    pick: impl Fn(&ProviderMetadata) -> String,
) -> Option<String> {
    if !provider.enable_discovery {
        return None;
    }
    let issuer = issuer_for(provider)?;
    match discovery.resolve(&issuer).await {
        Ok(metadata) => {
            metrics::record_discovery_fetch("success");
            Some(pick(&metadata))
        }
        Err(e) => {
            metrics::record_discovery_fetch("failure");
            warn!(
                "Discovery failed for provider {} ({}): {}; falling back to static endpoints",
                provider.name, issuer, e
            );
            None
        }
    }
}
