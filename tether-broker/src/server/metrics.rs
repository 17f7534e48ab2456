#![allow(dead_code)]

use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all Tether broker metrics
const PREFIX: &str = "tether";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Handshake Metrics
    pub static ref CONSENT_SPECS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_consent_specs_total"), "Consent specs issued"),
        &["provider", "status"]
    ).expect("Failed to create consent_specs_total metric");

    pub static ref CALLBACKS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_callbacks_total"), "Provider callbacks processed"),
        &["provider", "status"]
    ).expect("Failed to create callbacks_total metric");

    pub static ref TOKEN_EXCHANGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_token_exchanges_total"), "Authorization code exchanges"),
        &["status"]
    ).expect("Failed to create token_exchanges_total metric");

    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_token_refreshes_total"), "Provider token refreshes"),
        &["status"]
    ).expect("Failed to create token_refreshes_total metric");

    // OIDC Metrics
    pub static ref DISCOVERY_FETCHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_discovery_fetches_total"), "OIDC discovery resolutions"),
        &["status"]
    ).expect("Failed to create discovery_fetches_total metric");

    // Housekeeping Metrics
    pub static ref CONNECTIONS_EXPIRED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_connections_expired_total"),
        "Pending connections swept after their TTL"
    ).expect("Failed to create connections_expired_total metric");

    // Auth Gating Metrics
    pub static ref API_KEY_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_api_key_failures_total"), "Rejected requests at the auth gate"),
        &["reason"]
    ).expect("Failed to create api_key_failures_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(CONSENT_SPECS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CALLBACKS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TOKEN_EXCHANGES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DISCOVERY_FETCHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CONNECTIONS_EXPIRED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(API_KEY_FAILURES_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

pub fn record_consent_spec(provider: &str, status: &str) {
    CONSENT_SPECS_TOTAL
        .with_label_values(&[provider, status])
        .inc();
}

pub fn record_callback(provider: &str, status: &str) {
    CALLBACKS_TOTAL.with_label_values(&[provider, status]).inc();
}

pub fn record_token_exchange(status: &str) {
    TOKEN_EXCHANGES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_token_refresh(status: &str) {
    TOKEN_REFRESHES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_discovery_fetch(status: &str) {
    DISCOVERY_FETCHES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_expired_connections(count: usize) {
    CONNECTIONS_EXPIRED_TOTAL.inc_by(count as f64);
}

pub fn record_api_key_failure(reason: &str) {
    API_KEY_FAILURES_TOTAL.with_label_values(&[reason]).inc();
}

/// Prometheus exposition endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body).into_response(),
            Err(e) => {
                tracing::error!("Metrics buffer is not valid UTF-8: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
