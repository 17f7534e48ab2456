//! Stub identity provider for end-to-end tests
//!
//! Serves a discovery document, a JWKS with a freshly generated RSA key,
//! and a token endpoint whose behavior tests script through `StubState`.

use super::constants::TEST_CLIENT_ID;
use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

const STUB_KID: &str = "stub-key";

struct SigningKey {
    pem: String,
    jwk_n: String,
    jwk_e: String,
}

/// One RSA keypair per test binary; generation is the slow part.
fn signing_key() -> &'static SigningKey {
    static KEY: OnceLock<SigningKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand_core::OsRng;
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate test RSA key");
        let public = private.to_public_key();
        SigningKey {
            pem: private
                .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
                .expect("encode test RSA key")
                .to_string(),
            jwk_n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            jwk_e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }
    })
}

/// Scripted behavior of the stub token endpoint, mutable mid-test.
pub struct StubState {
    /// access_token returned by the next exchange or refresh
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    /// When set, the authorization-code response carries an ID token with
    /// this nonce claim.
    pub id_token_nonce: Option<String>,
    /// Audience minted into ID tokens
    pub id_token_audience: String,
    /// Respond 400 to the next token request
    pub fail_exchange: bool,
    /// Every form body the token endpoint received, oldest first
    pub exchanges: Vec<HashMap<String, String>>,
}

impl Default for StubState {
    fn default() -> Self {
        StubState {
            access_token: "at".to_string(),
            refresh_token: None,
            expires_in: Some(3600),
            id_token_nonce: None,
            id_token_audience: TEST_CLIENT_ID.to_string(),
            fail_exchange: false,
            exchanges: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct StubContext {
    issuer: String,
    state: Arc<Mutex<StubState>>,
}

#[derive(Serialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
}

fn mint_id_token(issuer: &str, audience: &str, nonce: Option<&str>) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = IdTokenClaims {
        iss: issuer.to_string(),
        sub: "user-1".to_string(),
        aud: audience.to_string(),
        exp: now + 300,
        iat: now,
        nonce: nonce.map(|n| n.to_string()),
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(STUB_KID.to_string());
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(signing_key().pem.as_bytes()).unwrap(),
    )
    .unwrap()
}

async fn discovery_document(State(ctx): State<StubContext>) -> impl IntoResponse {
    Json(serde_json::json!({
        "issuer": ctx.issuer,
        "authorization_endpoint": format!("{}/authorize", ctx.issuer),
        "token_endpoint": format!("{}/token", ctx.issuer),
        "jwks_uri": format!("{}/jwks.json", ctx.issuer),
        "id_token_signing_alg_values_supported": ["RS256"],
    }))
}

async fn jwks_document() -> impl IntoResponse {
    let key = signing_key();
    Json(serde_json::json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "kid": STUB_KID,
            "alg": "RS256",
            "n": key.jwk_n,
            "e": key.jwk_e,
        }]
    }))
}

async fn token_endpoint(
    State(ctx): State<StubContext>,
    Form(form): Form<HashMap<String, String>>,
) -> impl IntoResponse {
    let mut state = ctx.state.lock().unwrap();
    let grant_type = form.get("grant_type").cloned().unwrap_or_default();
    state.exchanges.push(form);

    if state.fail_exchange {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "invalid_grant"})),
        )
            .into_response();
    }

    let mut body = serde_json::json!({
        "access_token": state.access_token,
        "token_type": "Bearer",
    });
    if let Some(expires_in) = state.expires_in {
        body["expires_in"] = expires_in.into();
    }
    if let Some(refresh_token) = &state.refresh_token {
        body["refresh_token"] = refresh_token.clone().into();
    }
    if grant_type == "authorization_code" {
        if let Some(nonce) = state.id_token_nonce.clone() {
            body["id_token"] =
                mint_id_token(&ctx.issuer, &state.id_token_audience, Some(&nonce)).into();
        }
    }

    Json(body).into_response()
}

/// An in-process identity provider stub.
pub struct StubProvider {
    pub base_url: String,
    pub state: Arc<Mutex<StubState>>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl StubProvider {
    pub async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub provider");
        let base_url = format!("http://127.0.0.1:{}", listener.local_addr().unwrap().port());

        let state = Arc::new(Mutex::new(StubState::default()));
        let ctx = StubContext {
            issuer: base_url.clone(),
            state: state.clone(),
        };

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery_document))
            .route("/jwks.json", get(jwks_document))
            .route("/token", post(token_endpoint))
            .with_state(ctx);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("stub provider failed");
        });

        StubProvider {
            base_url,
            state,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn authorize_url(&self) -> String {
        format!("{}/authorize", self.base_url)
    }

    pub fn token_url(&self) -> String {
        format!("{}/token", self.base_url)
    }

    /// Script the next authorization-code exchange to include an ID token
    /// carrying this nonce.
    pub fn set_id_token_nonce(&self, nonce: &str) {
        self.state.lock().unwrap().id_token_nonce = Some(nonce.to_string());
    }

    pub fn set_access_token(&self, token: &str) {
        self.state.lock().unwrap().access_token = token.to_string();
    }

    pub fn set_refresh_token(&self, token: Option<&str>) {
        self.state.lock().unwrap().refresh_token = token.map(|t| t.to_string());
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().unwrap().exchanges.len()
    }

    pub fn last_exchange(&self) -> Option<HashMap<String, String>> {
        self.state.lock().unwrap().exchanges.last().cloned()
    }
}

impl Drop for StubProvider {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
