use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tether_broker::config::{self, AppConfig, CliConfig};
use tether_broker::server::{metrics, run_server, BrokerComponents, RequestsLoggingLevel};
use tether_broker::store::{BrokerStore, SqliteBrokerStore};

/// Seconds between pending-connection expiry sweeps.
const EXPIRY_SWEEP_INTERVAL_SECS: u64 = 60;

/// Pending connections expire this many seconds after issuance.
const PENDING_CONNECTION_TTL_SECS: i64 = 600;

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory containing the broker database file.
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3002)]
    pub port: u16,

    /// Public base URL used to form the provider redirect_uri.
    #[clap(long)]
    pub base_url: Option<String>,

    /// Callback path appended to the base URL.
    #[clap(long)]
    pub redirect_path: Option<String>,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Refuse to start without real STATE_KEY / ENCRYPTION_KEY material.
    #[clap(long, default_value_t = false)]
    pub production: bool,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            base_url: args.base_url.clone(),
            redirect_path: args.redirect_path.clone(),
            logging_level: args.logging_level.clone(),
            production: args.production,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI, env overrides both
    // for secrets)
    let cli_config: CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  base_url: {}", app_config.base_url);
    info!("  redirect_uri: {}", app_config.redirect_uri());
    info!("  production: {}", app_config.production);

    if !app_config.broker_db_path().exists() {
        info!(
            "Creating new broker database at {:?}",
            app_config.broker_db_path()
        );
    }
    let store = Arc::new(SqliteBrokerStore::new(app_config.broker_db_path())?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    let components = BrokerComponents::new(&app_config, store.clone());

    // Spawn the pending-connection expiry sweeper
    let shutdown_token = CancellationToken::new();
    let sweeper_token = shutdown_token.child_token();
    let sweeper_store = store.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(EXPIRY_SWEEP_INTERVAL_SECS));

        // Skip the first immediate tick, wait for the first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = sweeper_token.cancelled() => return,
                _ = interval.tick() => {}
            }
            let cutoff = chrono::Utc::now().timestamp() - PENDING_CONNECTION_TTL_SECS;
            match sweeper_store.expire_pending_before(cutoff) {
                Ok(count) => {
                    if count > 0 {
                        info!("Expired {} stale pending connection(s)", count);
                        metrics::record_expired_connections(count);
                    }
                }
                Err(e) => {
                    error!("Failed to sweep pending connections: {}", e);
                }
            }
        }
    });

    info!("Ready to serve at port {}!", app_config.port);

    tokio::select! {
        result = run_server(
            app_config.port,
            app_config.logging_level.clone(),
            app_config.redirect_path.clone(),
            Arc::new(app_config.security.clone()),
            components,
        ) => {
            info!("HTTP server stopped: {:?}", result);
            shutdown_token.cancel();
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            shutdown_token.cancel();
            Ok(())
        }
    }
}
