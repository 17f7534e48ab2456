//! ID-token verification against provider JWKS.

use super::discovery::{DiscoveryCache, ProviderMetadata};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

const JWKS_TTL: Duration = Duration::from_secs(3600);

/// How far into the future an `iat` may sit before the token is rejected.
const MAX_IAT_SKEW_SECS: i64 = 120;

/// Only asymmetric RSA signatures are accepted. `alg=none` never parses
/// into this set.
const SUPPORTED_ALGS: &[Algorithm] = &[Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("ID token signature invalid")]
    SignatureInvalid,
    #[error("ID token claim mismatch: {0}")]
    ClaimMismatch(&'static str),
    #[error("OIDC discovery unavailable: {0}")]
    DiscoveryUnavailable(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    /// String or array per OIDC; jsonwebtoken validates either shape.
    #[serde(default)]
    pub aud: serde_json::Value,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

struct CachedJwks {
    keys: Vec<Jwk>,
    expires_at: Instant,
}

/// Verifies raw ID tokens for any discovered issuer. JWKS documents are
/// cached per URI for an hour; a signature failure could be rotation, so
/// callers simply fail the handshake and the next attempt refetches.
pub struct IdTokenVerifier {
    client: reqwest::Client,
    discovery: Arc<DiscoveryCache>,
    jwks: RwLock<HashMap<String, CachedJwks>>,
}

fn alg_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        _ => "",
    }
}

impl IdTokenVerifier {
    pub fn new(discovery: Arc<DiscoveryCache>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client for JWKS");
        Self {
            client,
            discovery,
            jwks: RwLock::new(HashMap::new()),
        }
    }

    /// Verify signature and claims of a raw ID token.
    ///
    /// `expected_nonce` is required for fresh handshake tokens; passing
    /// None skips the nonce equality check.
    pub async fn verify(
        &self,
        issuer: &str,
        raw_token: &str,
        expected_audience: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdTokenClaims, VerifyError> {
        let metadata = self
            .discovery
            .resolve(issuer)
            .await
            .map_err(|e| VerifyError::DiscoveryUnavailable(e.to_string()))?;

        let header = decode_header(raw_token).map_err(|_| VerifyError::SignatureInvalid)?;
        if !SUPPORTED_ALGS.contains(&header.alg) {
            return Err(VerifyError::SignatureInvalid);
        }
        if !metadata.id_token_signing_alg_values_supported.is_empty()
            && !metadata
                .id_token_signing_alg_values_supported
                .iter()
                .any(|a| a == alg_name(header.alg))
        {
            return Err(VerifyError::SignatureInvalid);
        }

        let keys = self.jwks_for(&metadata.jwks_uri).await?;
        let jwk = select_key(&keys, header.kid.as_deref()).ok_or(VerifyError::SignatureInvalid)?;
        let (n, e) = match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => (n, e),
            _ => return Err(VerifyError::SignatureInvalid),
        };
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).map_err(|_| VerifyError::SignatureInvalid)?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[expected_audience]);
        validation.set_issuer(&[metadata.issuer.as_str()]);

        let data = decode::<IdTokenClaims>(raw_token, &decoding_key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::InvalidAudience => VerifyError::ClaimMismatch("aud"),
                ErrorKind::InvalidIssuer => VerifyError::ClaimMismatch("iss"),
                ErrorKind::ExpiredSignature => VerifyError::ClaimMismatch("exp"),
                _ => VerifyError::SignatureInvalid,
            }
        })?;
        let claims = data.claims;

        if let Some(iat) = claims.iat {
            if iat > chrono::Utc::now().timestamp() + MAX_IAT_SKEW_SECS {
                return Err(VerifyError::ClaimMismatch("iat"));
            }
        }

        if let Some(expected) = expected_nonce {
            if claims.nonce.as_deref() != Some(expected) {
                return Err(VerifyError::ClaimMismatch("nonce"));
            }
        }

        debug!("Verified ID token for subject {}", claims.sub);
        Ok(claims)
    }

    async fn jwks_for(&self, jwks_uri: &str) -> Result<Vec<Jwk>, VerifyError> {
        {
            let cache = self.jwks.read().await;
            if let Some(entry) = cache.get(jwks_uri) {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.keys.clone());
                }
            }
        }

        let document: JwksDocument = self
            .client
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| VerifyError::DiscoveryUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| VerifyError::DiscoveryUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| VerifyError::DiscoveryUnavailable(e.to_string()))?;

        let mut cache = self.jwks.write().await;
        cache.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: document.keys.clone(),
                expires_at: Instant::now() + JWKS_TTL,
            },
        );
        Ok(document.keys)
    }
}

fn select_key<'a>(keys: &'a [Jwk], kid: Option<&str>) -> Option<&'a Jwk> {
    if let Some(kid) = kid {
        return keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid) && k.kty == "RSA");
    }
    let mut rsa_keys = keys.iter().filter(|k| k.kty == "RSA");
    let first = rsa_keys.next()?;
    // Without a kid there must be exactly one candidate
    if rsa_keys.next().is_some() {
        return None;
    }
    Some(first)
}
