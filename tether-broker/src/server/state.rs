use axum::extract::FromRef;

use crate::config::SecuritySettings;
use crate::handshake::{CallbackExecutor, ConsentBuilder};
use crate::store::BrokerStore;
use crate::vault::TokenVault;
use std::sync::Arc;
use std::time::Instant;

use super::http_layers::RequestsLoggingLevel;

pub type GuardedBrokerStore = Arc<dyn BrokerStore>;
pub type GuardedConsentBuilder = Arc<ConsentBuilder>;
pub type GuardedCallbackExecutor = Arc<CallbackExecutor>;
pub type GuardedTokenVault = Arc<TokenVault>;
pub type GuardedSecuritySettings = Arc<SecuritySettings>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub requests_logging_level: RequestsLoggingLevel,
    /// Route the provider callback is mounted on, e.g. "/auth/callback".
    pub redirect_path: String,
}

#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub start_time: Instant,
    pub security: GuardedSecuritySettings,
    pub store: GuardedBrokerStore,
    pub consent: GuardedConsentBuilder,
    pub callback: GuardedCallbackExecutor,
    pub vault: GuardedTokenVault,
}

impl FromRef<ServerState> for ServerConfig {
    fn from_ref(input: &ServerState) -> Self {
        input.config.clone()
    }
}

impl FromRef<ServerState> for GuardedSecuritySettings {
    fn from_ref(input: &ServerState) -> Self {
        input.security.clone()
    }
}

impl FromRef<ServerState> for GuardedBrokerStore {
    fn from_ref(input: &ServerState) -> Self {
        input.store.clone()
    }
}

impl FromRef<ServerState> for GuardedConsentBuilder {
    fn from_ref(input: &ServerState) -> Self {
        input.consent.clone()
    }
}

impl FromRef<ServerState> for GuardedCallbackExecutor {
    fn from_ref(input: &ServerState) -> Self {
        input.callback.clone()
    }
}

impl FromRef<ServerState> for GuardedTokenVault {
    fn from_ref(input: &ServerState) -> Self {
        input.vault.clone()
    }
}
