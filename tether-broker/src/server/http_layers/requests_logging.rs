//! Request logging middleware
#![allow(dead_code)] // Used as middleware

use super::super::state::ServerState;
use crate::server::metrics::record_http_request;
use axum::extract::State;
use axum::{body::Body, http::Request, middleware::Next, response::IntoResponse};
use std::time::Instant;
use tracing::info;

#[derive(PartialEq, PartialOrd, Clone, Debug, clap::ValueEnum)]
pub enum RequestsLoggingLevel {
    None,
    Path,
    Headers,
}

impl Default for RequestsLoggingLevel {
    fn default() -> Self {
        Self::Path
    }
}

impl std::fmt::Display for RequestsLoggingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Header values that would leak credentials if logged verbatim.
const REDACTED_HEADERS: &[&str] = &["authorization", "x-api-key", "cookie"];

pub async fn log_requests(
    State(state): State<ServerState>,
    request: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let level = state.config.requests_logging_level.clone();

    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    if level > RequestsLoggingLevel::None {
        info!(">>> {} {}", method, path);
    }

    if level >= RequestsLoggingLevel::Headers {
        info!("  Req Headers:");
        for (name, value) in request.headers().iter() {
            if REDACTED_HEADERS.contains(&name.as_str().to_lowercase().as_str()) {
                info!("    {:?}: <redacted>", name);
            } else {
                info!("    {:?}: {:?}", name, value);
            }
        }
    }

    let response = next.run(request).await;
    let elapsed = start.elapsed();

    if level > RequestsLoggingLevel::None {
        info!("<<< {} {} {} ({:?})", method, path, response.status(), elapsed);
    }

    record_http_request(&method, &path, response.status().as_u16(), elapsed);

    response
}
