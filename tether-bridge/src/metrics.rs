#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Opts, Registry};

/// Metric name prefix for all Tether bridge metrics
const PREFIX: &str = "tether_bridge";

lazy_static! {
    // Registry for the embedding process to expose however it likes
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref TOKEN_REFRESHES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_token_refreshes_total"), "Proactive credential refreshes"),
        &["status"]
    ).expect("Failed to create token_refreshes_total metric");

    pub static ref RECONNECTS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_reconnects_total"),
        "Reconnection attempts after transient failures"
    ).expect("Failed to create reconnects_total metric");

    pub static ref PERMANENT_FAILURES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_permanent_failures_total"),
        "Supervisor exits caused by permanent errors"
    ).expect("Failed to create permanent_failures_total metric");

    pub static ref MESSAGES_SENT_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_messages_sent_total"),
        "Outbound frames written to the socket"
    ).expect("Failed to create messages_sent_total metric");

    pub static ref MESSAGES_RECEIVED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_messages_received_total"),
        "Inbound frames delivered to the handler"
    ).expect("Failed to create messages_received_total metric");
}

/// Register the bridge metrics with the shared registry
pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(TOKEN_REFRESHES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(RECONNECTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PERMANENT_FAILURES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MESSAGES_SENT_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(MESSAGES_RECEIVED_TOTAL.clone()));
}

pub fn record_token_refresh(status: &str) {
    TOKEN_REFRESHES_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_reconnect() {
    RECONNECTS_TOTAL.inc();
}

pub fn record_permanent_failure() {
    PERMANENT_FAILURES_TOTAL.inc();
}

pub fn record_message_sent() {
    MESSAGES_SENT_TOTAL.inc();
}

pub fn record_message_received() {
    MESSAGES_RECEIVED_TOTAL.inc();
}
