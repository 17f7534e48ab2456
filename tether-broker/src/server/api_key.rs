//! API-key and client-address gating for sensitive routes.
//!
//! Handlers opt in by taking an `ApiKeyAuth` argument. The extractor
//! checks `X-API-Key` against the configured keys in constant time, then
//! the client address (first `X-Forwarded-For` entry, else the socket
//! peer) against the CIDR allow-list. Either gate can be disabled by
//! configuration.

use super::state::ServerState;
use crate::server::metrics::record_api_key_failure;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use std::net::{IpAddr, SocketAddr};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

pub const HEADER_API_KEY: &str = "x-api-key";

#[derive(Debug)]
pub struct ApiKeyAuth;

#[derive(Debug, PartialEq, Eq)]
pub enum AuthRejection {
    MissingApiKey,
    InvalidApiKey,
    ForbiddenCidr,
}

impl AuthRejection {
    fn code(&self) -> &'static str {
        match self {
            AuthRejection::MissingApiKey => "missing_api_key",
            AuthRejection::InvalidApiKey => "invalid_api_key",
            AuthRejection::ForbiddenCidr => "forbidden_cidr",
        }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> axum::response::Response {
        record_api_key_failure(self.code());
        let status = match self {
            AuthRejection::MissingApiKey | AuthRejection::InvalidApiKey => StatusCode::UNAUTHORIZED,
            AuthRejection::ForbiddenCidr => StatusCode::FORBIDDEN,
        };
        (
            status,
            Json(serde_json::json!({
                "error": self.code(),
                "request_id": uuid::Uuid::new_v4().to_string(),
            })),
        )
            .into_response()
    }
}

/// X-Forwarded-For is consulted before the socket peer so the gate works
/// behind the gateway proxy.
fn client_ip(parts: &Parts) -> Option<IpAddr> {
    if let Some(forwarded) = parts.headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return Some(ip);
                }
            }
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn key_matches(configured: &[String], candidate: &str) -> bool {
    let candidate = candidate.as_bytes();
    let mut matched = false;
    // Compare against every configured key so timing does not reveal
    // which one was closest.
    for key in configured {
        matched |= bool::from(key.as_bytes().ct_eq(candidate));
    }
    matched
}

impl FromRequestParts<ServerState> for ApiKeyAuth {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        ctx: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        let security = &ctx.security;

        if security.require_allowlist {
            let ip = client_ip(parts);
            let allowed = ip
                .map(|ip| security.allowed_cidrs.iter().any(|net| net.contains(&ip)))
                .unwrap_or(false);
            if !allowed {
                warn!("Rejected request from address outside allow-list: {:?}", ip);
                return Err(AuthRejection::ForbiddenCidr);
            }
        }

        if security.require_api_key {
            let candidate = parts
                .headers
                .get(HEADER_API_KEY)
                .and_then(|v| v.to_str().ok())
                .ok_or(AuthRejection::MissingApiKey)?;
            if !key_matches(&security.api_keys, candidate) {
                warn!("Rejected request with invalid API key");
                return Err(AuthRejection::InvalidApiKey);
            }
        }

        debug!("Request passed the auth gate");
        Ok(ApiKeyAuth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_matching_accepts_any_configured_key() {
        let keys = vec!["key-one".to_string(), "key-two".to_string()];
        assert!(key_matches(&keys, "key-one"));
        assert!(key_matches(&keys, "key-two"));
        assert!(!key_matches(&keys, "key-three"));
        assert!(!key_matches(&keys, ""));
        assert!(!key_matches(&keys, "key-on"));
    }

    #[test]
    fn no_configured_keys_match_nothing() {
        assert!(!key_matches(&[], "anything"));
    }
}
