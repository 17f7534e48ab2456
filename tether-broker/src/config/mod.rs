mod file_config;

pub use file_config::{FileConfig, SecretsConfig, SecurityConfig};

use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use ipnet::IpNet;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_REDIRECT_PATH: &str = "/auth/callback";

/// CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub base_url: Option<String>,
    pub redirect_path: Option<String>,
    pub logging_level: RequestsLoggingLevel,
    pub production: bool,
}

/// Request gating knobs resolved from config.
#[derive(Debug, Clone, Default)]
pub struct SecuritySettings {
    pub api_keys: Vec<String>,
    pub require_api_key: bool,
    pub require_allowlist: bool,
    pub allowed_cidrs: Vec<IpNet>,
    pub allowed_return_domains: Vec<String>,
}

impl SecuritySettings {
    /// Accepted when any configured key matches. Comparison is done
    /// upstream in constant time; this only answers "is gating on".
    pub fn gating_enabled(&self) -> bool {
        self.require_api_key || self.require_allowlist
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    /// Public base used to form redirect_uri, e.g. "https://broker.example.com".
    pub base_url: String,
    pub redirect_path: String,
    pub logging_level: RequestsLoggingLevel,
    pub production: bool,
    pub http_timeout_secs: u64,
    pub state_key: [u8; 32],
    pub encryption_key: [u8; 32],
    pub security: SecuritySettings,
}

// Keys used when no real key is configured outside production. Fixed so
// dev state survives restarts; never accepted when production is set.
const DEV_STATE_KEY: [u8; 32] = [0x5a; 32];
const DEV_ENCRYPTION_KEY: [u8; 32] = [0xa5; 32];

fn decode_key(encoded: &str, name: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow::anyhow!("{} is not valid base64: {}", name, e))?;
    match <[u8; 32]>::try_from(bytes) {
        Ok(key) => Ok(key),
        Err(_) => bail!("{} must decode to exactly 32 bytes", name),
    }
}

fn resolve_key(
    env_name: &str,
    file_value: Option<&str>,
    dev_fallback: [u8; 32],
    production: bool,
) -> Result<[u8; 32]> {
    if let Ok(value) = std::env::var(env_name) {
        if !value.is_empty() {
            return decode_key(&value, env_name);
        }
    }
    if let Some(value) = file_value {
        return decode_key(value, env_name);
    }
    if production {
        bail!("{} must be set when running in production", env_name);
    }
    warn!(
        "{} not set; using built-in development key. Do not store real credentials.",
        env_name
    );
    Ok(dev_fallback)
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_nonempty(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_nonempty(name).map(|v| {
        v.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
}

fn resolve_api_keys(file: Option<&Vec<String>>) -> Vec<String> {
    if let Ok(keys) = std::env::var("API_KEYS") {
        let keys: Vec<String> = keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !keys.is_empty() {
            return keys;
        }
    }
    if let Ok(key) = std::env::var("API_KEY") {
        if !key.is_empty() {
            return vec![key];
        }
    }
    file.cloned().unwrap_or_default()
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file
    /// config. TOML values override CLI values where present; secret env
    /// vars override both.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = env_nonempty("DB_DIR")
            .map(PathBuf::from)
            .or_else(|| file.db_dir.map(PathBuf::from))
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via DB_DIR, --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);

        let base_url = env_nonempty("BASE_URL")
            .or(file.base_url)
            .or_else(|| cli.base_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("base_url must be specified via BASE_URL, --base-url or in config file")
            })?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let redirect_path = env_nonempty("REDIRECT_PATH")
            .or(file.redirect_path)
            .or_else(|| cli.redirect_path.clone())
            .unwrap_or_else(|| DEFAULT_REDIRECT_PATH.to_string());
        if !redirect_path.starts_with('/') {
            bail!("redirect_path must start with '/': {}", redirect_path);
        }

        let logging_level = file
            .logging_level
            .and_then(|s| parse_logging_level(&s))
            .unwrap_or_else(|| cli.logging_level.clone());

        let production = file.production.unwrap_or(cli.production);
        let http_timeout_secs = file.http_timeout_secs.unwrap_or(10);

        let secrets = file.secrets.unwrap_or_default();
        let state_key = resolve_key(
            "STATE_KEY",
            secrets.state_key.as_deref(),
            DEV_STATE_KEY,
            production,
        )?;
        let encryption_key = resolve_key(
            "ENCRYPTION_KEY",
            secrets.encryption_key.as_deref(),
            DEV_ENCRYPTION_KEY,
            production,
        )?;

        let sec_file = file.security.unwrap_or_default();
        let api_keys = resolve_api_keys(sec_file.api_keys.as_ref());
        let require_api_key = env_bool("REQUIRE_API_KEY")
            .or(sec_file.require_api_key)
            .unwrap_or(production);
        if require_api_key && api_keys.is_empty() {
            bail!("require_api_key is enabled but no API keys are configured");
        }

        let mut allowed_cidrs = Vec::new();
        let cidr_strings = env_list("ALLOWED_CIDRS")
            .or(sec_file.allowed_cidrs)
            .unwrap_or_default();
        for cidr in cidr_strings {
            let net: IpNet = cidr
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid CIDR {:?}: {}", cidr, e))?;
            allowed_cidrs.push(net);
        }
        let require_allowlist = env_bool("REQUIRE_ALLOWLIST")
            .or(sec_file.require_allowlist)
            .unwrap_or(false);
        if require_allowlist && allowed_cidrs.is_empty() {
            bail!("require_allowlist is enabled but allowed_cidrs is empty");
        }

        let allowed_return_domains = env_list("ALLOWED_RETURN_DOMAINS")
            .or(sec_file.allowed_return_domains)
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        Ok(AppConfig {
            db_dir,
            port,
            base_url,
            redirect_path,
            logging_level,
            production,
            http_timeout_secs,
            state_key,
            encryption_key,
            security: SecuritySettings {
                api_keys,
                require_api_key,
                require_allowlist,
                allowed_cidrs,
                allowed_return_domains,
            },
        })
    }

    pub fn broker_db_path(&self) -> PathBuf {
        self.db_dir.join("broker.db")
    }

    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.base_url, self.redirect_path)
    }
}

fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    match s.to_lowercase().as_str() {
        "none" => Some(RequestsLoggingLevel::None),
        "path" => Some(RequestsLoggingLevel::Path),
        "headers" => Some(RequestsLoggingLevel::Headers),
        _ => {
            warn!("Unknown logging_level '{}', using default", s);
            None
        }
    }
}
