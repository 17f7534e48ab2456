use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub base_url: Option<String>,
    pub redirect_path: Option<String>,
    pub logging_level: Option<String>,
    pub production: Option<bool>,
    pub http_timeout_secs: Option<u64>,

    // Feature configs
    pub security: Option<SecurityConfig>,
    pub secrets: Option<SecretsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_keys: Option<Vec<String>>,
    pub require_api_key: Option<bool>,
    pub require_allowlist: Option<bool>,
    pub allowed_cidrs: Option<Vec<String>>,
    pub allowed_return_domains: Option<Vec<String>>,
}

/// Base64-encoded 32-byte keys. The matching environment variables
/// (STATE_KEY, ENCRYPTION_KEY) take precedence so keys can stay out of
/// files entirely.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SecretsConfig {
    pub state_key: Option<String>,
    pub encryption_key: Option<String>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {:?}", path.as_ref()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path.as_ref()))
    }
}
