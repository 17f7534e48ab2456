//! OIDC provider metadata discovery with a TTL'd process-wide cache.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// Floor for cache lifetimes; providers advertising shorter (or no)
/// max-age still get an hour.
const MIN_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("issuer could not be determined")]
    NoIssuer,
    #[error("discovery request failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("discovery document invalid: {0}")]
    Invalid(&'static str),
}

/// The subset of the discovery document the broker acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

struct CacheEntry {
    metadata: ProviderMetadata,
    expires_at: Instant,
}

/// Determine the issuer for a provider profile: explicit issuer first,
/// then inference from well-known authorization hosts, then the scheme
/// and host of the authorization endpoint.
pub fn infer_issuer(issuer: Option<&str>, auth_url_hint: Option<&str>) -> Option<String> {
    if let Some(issuer) = issuer {
        if !issuer.is_empty() {
            return Some(issuer.trim_end_matches('/').to_string());
        }
    }

    let hint = Url::parse(auth_url_hint?).ok()?;
    let host = hint.host_str()?;

    if host == "accounts.google.com" {
        return Some("https://accounts.google.com".to_string());
    }
    if host == "login.microsoftonline.com" {
        // Azure v2 endpoints look like /{tenant}/oauth2/v2.0/authorize
        let mut segments = hint.path_segments()?;
        let tenant = segments.next()?;
        if !tenant.is_empty() {
            return Some(format!("https://login.microsoftonline.com/{}/v2.0", tenant));
        }
    }

    Some(format!("{}://{}", hint.scheme(), host))
}

/// Process-wide metadata cache. Concurrent discoveries of one issuer may
/// duplicate the fetch; the map itself stays consistent.
pub struct DiscoveryCache {
    client: reqwest::Client,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl DiscoveryCache {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client for discovery");
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch (or reuse) the metadata for an issuer.
    pub async fn resolve(&self, issuer: &str) -> Result<ProviderMetadata, DiscoveryError> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(issuer) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.metadata.clone());
                }
            }
        }

        let (metadata, ttl) = self.fetch(issuer).await?;
        debug!("Discovered issuer {} (ttl {:?})", issuer, ttl);

        let mut entries = self.entries.write().await;
        entries.insert(
            issuer.to_string(),
            CacheEntry {
                metadata: metadata.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(metadata)
    }

    async fn fetch(&self, issuer: &str) -> Result<(ProviderMetadata, Duration), DiscoveryError> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        info!("Fetching OIDC discovery document from {}", url);

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let ttl = cache_ttl(response.headers());
        let metadata: ProviderMetadata = response.json().await?;

        if metadata.issuer.is_empty() {
            return Err(DiscoveryError::Invalid("empty issuer"));
        }
        if metadata.jwks_uri.is_empty() {
            return Err(DiscoveryError::Invalid("empty jwks_uri"));
        }

        Ok((metadata, ttl))
    }

    #[cfg(test)]
    pub async fn insert_for_test(&self, issuer: &str, metadata: ProviderMetadata) {
        let mut entries = self.entries.write().await;
        entries.insert(
            issuer.to_string(),
            CacheEntry {
                metadata,
                expires_at: Instant::now() + MIN_CACHE_TTL,
            },
        );
    }
}

/// TTL is the larger of the advertised max-age and one hour.
fn cache_ttl(headers: &reqwest::header::HeaderMap) -> Duration {
    let max_age = headers
        .get(reqwest::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_age)
        .unwrap_or(0);
    MIN_CACHE_TTL.max(Duration::from_secs(max_age))
}

fn parse_max_age(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        directive
            .trim()
            .strip_prefix("max-age=")
            .and_then(|age| age.parse().ok())
    })
}
