//! Rate limiting configuration using tower-governor
//!
//! The public callback route gets a strict per-IP limit; everything else
//! shares a generous global per-IP limit that exists to contain runaway
//! clients rather than to meter usage.

use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;
use tower_governor::{key_extractor::KeyExtractor, GovernorError};

/// Callback hits per minute per IP (a browser redirect, not an API)
pub const CALLBACK_PER_MINUTE: u32 = 30;

/// Requests per minute per IP across the whole app
pub const GLOBAL_PER_MINUTE: u32 = 600;

/// Extracts IP address from ConnectInfo for IP-based rate limiting
#[derive(Clone)]
pub struct IpKeyExtractor;

impl KeyExtractor for IpKeyExtractor {
    type Key = SocketAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .ok_or(GovernorError::UnableToExtractKey)
    }
}
