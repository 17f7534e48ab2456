//! HTTP server implementation with route handlers

use anyhow::Result;
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, response, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;

use super::api_key::ApiKeyAuth;
use super::{
    log_requests, metrics, state::*, IpKeyExtractor, RequestsLoggingLevel, CALLBACK_PER_MINUTE,
    GLOBAL_PER_MINUTE,
};
use crate::config::{AppConfig, SecuritySettings};
use crate::crypto::TokenCipher;
use crate::handshake::{
    CallbackDisposition, CallbackExecutor, ConsentBuilder, ConsentError, ConsentSettings,
};
use crate::oidc::{DiscoveryCache, IdTokenVerifier};
use crate::state_token::StateCodec;
use crate::store::{AuthKind, BrokerStore, ProviderProfile};
use crate::vault::{TokenVault, VaultError};

/// Everything the request handlers need, built once at startup and shared
/// by reference. Nothing here is a module-level singleton.
pub struct BrokerComponents {
    pub store: Arc<dyn BrokerStore>,
    pub consent: Arc<ConsentBuilder>,
    pub callback: Arc<CallbackExecutor>,
    pub vault: Arc<TokenVault>,
}

impl BrokerComponents {
    pub fn new(config: &AppConfig, store: Arc<dyn BrokerStore>) -> Self {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let codec = Arc::new(StateCodec::new(config.state_key));
        let cipher = TokenCipher::new(&config.encryption_key);
        let discovery = Arc::new(DiscoveryCache::new(timeout));
        let verifier = Arc::new(IdTokenVerifier::new(discovery.clone(), timeout));

        let vault = Arc::new(TokenVault::new(
            store.clone(),
            cipher,
            discovery.clone(),
            timeout,
        ));
        let consent = Arc::new(ConsentBuilder::new(
            store.clone(),
            codec.clone(),
            discovery.clone(),
            ConsentSettings {
                redirect_uri: config.redirect_uri(),
                allowed_return_domains: config.security.allowed_return_domains.clone(),
            },
        ));
        let callback = Arc::new(CallbackExecutor::new(
            store.clone(),
            codec,
            discovery,
            verifier,
            vault.clone(),
            config.redirect_uri(),
            timeout,
        ));

        Self {
            store,
            consent,
            callback,
            vault,
        }
    }
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

fn error_response(status: StatusCode, code: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": code,
            "request_id": uuid::Uuid::new_v4().to_string(),
        })),
    )
        .into_response()
}

// ============================================================================
// Consent and callback handlers
// ============================================================================

#[derive(Deserialize, Debug)]
struct ConsentSpecBody {
    pub workspace_id: String,
    pub provider_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub return_url: String,
}

#[derive(Serialize)]
struct ConsentSpecResponse {
    #[serde(rename = "authUrl")]
    auth_url: String,
    state: String,
    connection_id: String,
    scopes: Vec<String>,
    provider_id: String,
}

async fn post_consent_spec(
    _auth: ApiKeyAuth,
    State(consent): State<GuardedConsentBuilder>,
    Json(body): Json<ConsentSpecBody>,
) -> Response {
    if body.workspace_id.is_empty() || body.return_url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "malformed_request");
    }

    match consent
        .build_consent(
            &body.workspace_id,
            &body.provider_id,
            &body.scopes,
            &body.return_url,
        )
        .await
    {
        Ok(spec) => (
            StatusCode::CREATED,
            Json(ConsentSpecResponse {
                auth_url: spec.auth_url,
                state: spec.state,
                connection_id: spec.connection_id,
                scopes: spec.scopes,
                provider_id: spec.provider_id,
            }),
        )
            .into_response(),
        Err(ConsentError::ProviderNotFound) => {
            error_response(StatusCode::NOT_FOUND, "provider_not_found")
        }
        Err(ConsentError::ForbiddenReturnUrl) => {
            error_response(StatusCode::FORBIDDEN, "forbidden_return_url")
        }
        Err(ConsentError::Internal(e)) => {
            error!("Consent spec construction failed: {:?}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

#[derive(Deserialize, Debug)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Provider redirect target. Public by design; the signed state is the
/// only credential this endpoint trusts.
async fn get_callback(
    Query(params): Query<CallbackQuery>,
    State(callback): State<GuardedCallbackExecutor>,
) -> Response {
    let state = match params.state.as_deref() {
        Some(state) if !state.is_empty() => state,
        _ => return error_response(StatusCode::BAD_REQUEST, "invalid_state"),
    };

    match callback
        .execute(params.code.as_deref(), state, params.error.as_deref())
        .await
    {
        CallbackDisposition::Redirect(location) => response::Builder::new()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap(),
        CallbackDisposition::Reject { code } => error_response(StatusCode::BAD_REQUEST, code),
    }
}

// ============================================================================
// Provider administration handlers
// ============================================================================

#[derive(Deserialize, Debug)]
struct ProviderBody {
    pub name: String,
    pub auth_kind: AuthKind,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub issuer: Option<String>,
    #[serde(default)]
    pub enable_discovery: bool,
    #[serde(default)]
    pub default_scopes: Vec<String>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    pub credential_schema: Option<serde_json::Value>,
}

/// Provider view with the client secret withheld.
#[derive(Serialize)]
struct ProviderResponse {
    id: String,
    name: String,
    auth_kind: AuthKind,
    client_id: Option<String>,
    auth_url: Option<String>,
    token_url: Option<String>,
    issuer: Option<String>,
    enable_discovery: bool,
    default_scopes: Vec<String>,
    extra_params: BTreeMap<String, String>,
    credential_schema: Option<serde_json::Value>,
    created_at: i64,
    updated_at: i64,
}

impl From<ProviderProfile> for ProviderResponse {
    fn from(profile: ProviderProfile) -> Self {
        ProviderResponse {
            id: profile.id,
            name: profile.name,
            auth_kind: profile.auth_kind,
            client_id: profile.client_id,
            auth_url: profile.auth_url,
            token_url: profile.token_url,
            issuer: profile.issuer,
            enable_discovery: profile.enable_discovery,
            default_scopes: profile.default_scopes,
            extra_params: profile.extra_params,
            credential_schema: profile.credential_schema,
            created_at: profile.created_at,
            updated_at: profile.updated_at,
        }
    }
}

async fn create_provider(
    _auth: ApiKeyAuth,
    State(store): State<GuardedBrokerStore>,
    Json(body): Json<ProviderBody>,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let profile = ProviderProfile {
        id: uuid::Uuid::new_v4().to_string(),
        name: body.name,
        auth_kind: body.auth_kind,
        client_id: body.client_id,
        client_secret: body.client_secret,
        auth_url: body.auth_url,
        token_url: body.token_url,
        issuer: body.issuer,
        enable_discovery: body.enable_discovery,
        default_scopes: body.default_scopes,
        extra_params: body.extra_params,
        credential_schema: body.credential_schema,
        deleted: false,
        created_at: now,
        updated_at: now,
    };

    if let Err(e) = profile.validate() {
        warn!("Rejected provider registration: {}", e);
        return error_response(StatusCode::BAD_REQUEST, "malformed_request");
    }

    match store.get_provider_by_name(&profile.name) {
        Ok(Some(_)) => return error_response(StatusCode::CONFLICT, "conflict"),
        Ok(None) => {}
        Err(e) => {
            error!("Provider lookup failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal");
        }
    }

    match store.create_provider(&profile) {
        Ok(()) => {
            info!("Registered provider {} ({})", profile.name, profile.id);
            (StatusCode::CREATED, Json(ProviderResponse::from(profile))).into_response()
        }
        Err(e) => {
            // Lost a create/create race on the name
            warn!("Provider insert failed: {}", e);
            error_response(StatusCode::CONFLICT, "conflict")
        }
    }
}

async fn list_providers(_auth: ApiKeyAuth, State(store): State<GuardedBrokerStore>) -> Response {
    match store.list_providers() {
        Ok(providers) => Json(
            providers
                .into_iter()
                .map(ProviderResponse::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => {
            error!("Failed to list providers: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

async fn get_provider(
    _auth: ApiKeyAuth,
    State(store): State<GuardedBrokerStore>,
    Path(id): Path<String>,
) -> Response {
    match store.get_provider(&id) {
        Ok(Some(profile)) if !profile.deleted => {
            Json(ProviderResponse::from(profile)).into_response()
        }
        Ok(_) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            error!("Failed to load provider {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

async fn get_provider_by_name(
    _auth: ApiKeyAuth,
    State(store): State<GuardedBrokerStore>,
    Path(name): Path<String>,
) -> Response {
    match store.get_provider_by_name(&name) {
        Ok(Some(profile)) => Json(ProviderResponse::from(profile)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            error!("Failed to load provider by name {}: {}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

async fn update_provider(
    _auth: ApiKeyAuth,
    State(store): State<GuardedBrokerStore>,
    Path(id): Path<String>,
    Json(body): Json<ProviderBody>,
) -> Response {
    let existing = match store.get_provider(&id) {
        Ok(Some(profile)) if !profile.deleted => profile,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            error!("Failed to load provider {}: {}", id, e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal");
        }
    };

    if body.name != existing.name {
        match store.get_provider_by_name(&body.name) {
            Ok(Some(_)) => return error_response(StatusCode::CONFLICT, "conflict"),
            Ok(None) => {}
            Err(e) => {
                error!("Provider lookup failed: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal");
            }
        }
    }

    let updated = ProviderProfile {
        id: existing.id.clone(),
        name: body.name,
        auth_kind: body.auth_kind,
        client_id: body.client_id,
        // Updates may omit the secret to keep the stored one
        client_secret: body.client_secret.or(existing.client_secret),
        auth_url: body.auth_url,
        token_url: body.token_url,
        issuer: body.issuer,
        enable_discovery: body.enable_discovery,
        default_scopes: body.default_scopes,
        extra_params: body.extra_params,
        credential_schema: body.credential_schema,
        deleted: false,
        created_at: existing.created_at,
        updated_at: chrono::Utc::now().timestamp(),
    };

    if let Err(e) = updated.validate() {
        warn!("Rejected provider update: {}", e);
        return error_response(StatusCode::BAD_REQUEST, "malformed_request");
    }

    match store.update_provider(&updated) {
        Ok(true) => Json(ProviderResponse::from(updated)).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            error!("Failed to update provider {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

async fn delete_provider(
    _auth: ApiKeyAuth,
    State(store): State<GuardedBrokerStore>,
    Path(id): Path<String>,
) -> Response {
    match store.soft_delete_provider(&id) {
        Ok(true) => {
            info!("Soft-deleted provider {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => error_response(StatusCode::NOT_FOUND, "not_found"),
        Err(e) => {
            error!("Failed to delete provider {}: {}", id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

// ============================================================================
// Connection token handlers
// ============================================================================

#[derive(Serialize)]
struct TokenResponseBody {
    access_token: String,
    token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

impl From<crate::vault::TokenRecord> for TokenResponseBody {
    fn from(record: crate::vault::TokenRecord) -> Self {
        TokenResponseBody {
            access_token: record.payload.access_token,
            token_type: record.payload.token_type,
            expires_at: record.expires_at,
            refresh_token: record.payload.refresh_token,
            id_token: record.id_token,
            scope: record.payload.scope,
        }
    }
}

fn vault_error_response(context: &str, error: VaultError) -> Response {
    match error {
        VaultError::NotFound => error_response(StatusCode::NOT_FOUND, "not_found"),
        VaultError::NoRefreshToken => error_response(StatusCode::BAD_REQUEST, "no_refresh_token"),
        VaultError::ProviderRejected(reason) => {
            warn!("{}: provider rejected: {}", context, reason);
            error_response(StatusCode::BAD_GATEWAY, "provider_rejected")
        }
        VaultError::Network(reason) => {
            warn!("{}: provider unreachable: {}", context, reason);
            error_response(StatusCode::BAD_GATEWAY, "network_error")
        }
        VaultError::DecryptFailure => {
            error!("{}: stored credential failed to decrypt", context);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "decrypt_failure")
        }
        VaultError::Storage(reason) => {
            error!("{}: storage failure: {}", context, reason);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal")
        }
    }
}

async fn get_connection_token(
    _auth: ApiKeyAuth,
    State(vault): State<GuardedTokenVault>,
    Path(id): Path<String>,
) -> Response {
    match vault.get(&id) {
        Ok(record) => Json(TokenResponseBody::from(record)).into_response(),
        Err(e) => vault_error_response("token read", e),
    }
}

async fn refresh_connection_token(
    _auth: ApiKeyAuth,
    State(vault): State<GuardedTokenVault>,
    Path(id): Path<String>,
) -> Response {
    match vault.refresh(&id).await {
        Ok(record) => Json(TokenResponseBody::from(record)).into_response(),
        Err(e) => vault_error_response("token refresh", e),
    }
}

// ============================================================================
// Operational handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime: String,
}

async fn health(State(state): State<ServerState>) -> Response {
    Json(HealthResponse {
        status: "ok",
        uptime: format_uptime(state.start_time.elapsed()),
    })
    .into_response()
}

// ============================================================================
// App assembly
// ============================================================================

pub fn make_app(
    config: ServerConfig,
    security: Arc<SecuritySettings>,
    components: BrokerComponents,
) -> Router {
    let state = ServerState {
        config: config.clone(),
        start_time: Instant::now(),
        security,
        store: components.store,
        consent: components.consent,
        callback: components.callback,
        vault: components.vault,
    };

    // The public callback endpoint gets a strict IP-based limit
    let callback_rate_limit = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (CALLBACK_PER_MINUTE / 60) as u64))
            .burst_size(CALLBACK_PER_MINUTE)
            .key_extractor(IpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let callback_routes: Router = Router::new()
        .route(&config.redirect_path, get(get_callback))
        .layer(GovernorLayer::new(callback_rate_limit))
        .with_state(state.clone());

    let consent_routes: Router = Router::new()
        .route("/auth/consent-spec", post(post_consent_spec))
        .with_state(state.clone());

    let provider_routes: Router = Router::new()
        .route("/providers", post(create_provider).get(list_providers))
        .route(
            "/providers/{id}",
            get(get_provider).put(update_provider).delete(delete_provider),
        )
        .route("/providers/by-name/{name}", get(get_provider_by_name))
        .with_state(state.clone());

    let connection_routes: Router = Router::new()
        .route("/connections/{id}/token", get(get_connection_token))
        .route("/connections/{id}/refresh", post(refresh_connection_token))
        .with_state(state.clone());

    let ops_routes: Router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(state.clone());

    let mut app: Router = consent_routes
        .merge(callback_routes)
        .merge(provider_routes)
        .merge(connection_routes)
        .merge(ops_routes);

    // Apply global rate limit to the entire app (protects against overall abuse)
    let global_rate_limit = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(std::cmp::max(1, (GLOBAL_PER_MINUTE / 60) as u64))
            .burst_size(GLOBAL_PER_MINUTE)
            .key_extractor(IpKeyExtractor)
            .finish()
            .unwrap(),
    );
    app = app.layer(GovernorLayer::new(global_rate_limit));

    app = app.layer(middleware::from_fn_with_state(state.clone(), log_requests));

    app
}

pub async fn run_server(
    port: u16,
    requests_logging_level: RequestsLoggingLevel,
    redirect_path: String,
    security: Arc<SecuritySettings>,
    components: BrokerComponents,
) -> Result<()> {
    let config = ServerConfig {
        port,
        requests_logging_level,
        redirect_path,
    };
    let app = make_app(config, security, components);

    info!("Starting HTTP server on port {}", port);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_as_days_and_clock() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(61)), "0d 00:01:01");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 3 * 3600 + 4 * 60 + 5)),
            "2d 03:04:05"
        );
    }
}
