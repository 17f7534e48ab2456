//! Test server lifecycle management
//!
//! Each test gets an isolated broker with its own sqlite file, a fixed
//! API key and a known state-signing key.

use super::constants::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether_broker::config::{AppConfig, SecuritySettings};
use tether_broker::server::{make_app, BrokerComponents, RequestsLoggingLevel, ServerConfig};
use tether_broker::store::SqliteBrokerStore;
use tether_broker::vault::TokenVault;
use tokio::net::TcpListener;

/// Test broker instance with isolated database
///
/// When dropped, the server gracefully shuts down and temp resources are
/// cleaned up.
pub struct TestServer {
    /// Base URL for making requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    /// The port the server is listening on
    pub port: u16,

    /// Store handle for direct database access in tests
    pub store: Arc<SqliteBrokerStore>,

    /// Vault handle for seeding and inspecting credentials
    pub vault: Arc<TokenVault>,

    // Private fields - keep resources alive until drop
    _temp_db_dir: TempDir,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    /// Spawn a broker with API-key gating on and no return-URL
    /// enforcement.
    pub async fn spawn() -> Self {
        Self::spawn_with(Vec::new()).await
    }

    /// Spawn a broker enforcing the given return-URL domains.
    pub async fn spawn_with(allowed_return_domains: Vec<String>) -> Self {
        let temp_db_dir = tempfile::tempdir().expect("Failed to create temp db dir");

        tether_broker::server::metrics::init_metrics();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().expect("Failed to get local address").port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let security = SecuritySettings {
            api_keys: vec![TEST_API_KEY.to_string()],
            require_api_key: true,
            require_allowlist: false,
            allowed_cidrs: Vec::new(),
            allowed_return_domains,
        };

        let app_config = AppConfig {
            db_dir: temp_db_dir.path().to_path_buf(),
            port,
            base_url: base_url.clone(),
            redirect_path: "/auth/callback".to_string(),
            logging_level: RequestsLoggingLevel::None,
            production: false,
            http_timeout_secs: REQUEST_TIMEOUT_SECS,
            state_key: TEST_STATE_KEY,
            encryption_key: [11u8; 32],
            security: security.clone(),
        };

        let store = Arc::new(
            SqliteBrokerStore::new(app_config.broker_db_path()).expect("Failed to open store"),
        );
        let components = BrokerComponents::new(&app_config, store.clone());
        let vault = components.vault.clone();

        let config = ServerConfig {
            port,
            requests_logging_level: RequestsLoggingLevel::None,
            redirect_path: app_config.redirect_path.clone(),
        };
        let app = make_app(config, Arc::new(security), components);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
            .expect("Server failed");
        });

        let server = Self {
            base_url,
            port,
            store,
            vault,
            _temp_db_dir: temp_db_dir,
            _shutdown_tx: Some(shutdown_tx),
        };

        server.wait_for_ready().await;

        server
    }

    /// Waits for the server to become ready by polling /health
    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(SERVER_READY_TIMEOUT_MS);

        loop {
            if start.elapsed() > timeout {
                panic!(
                    "Server did not become ready within {}ms",
                    SERVER_READY_TIMEOUT_MS
                );
            }

            match client.get(format!("{}/health", self.base_url)).send().await {
                Ok(response) if response.status().is_success() => {
                    return;
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(SERVER_READY_POLL_INTERVAL_MS)).await;
                }
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
