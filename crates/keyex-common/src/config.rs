//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("Config not initialized. Call keyex_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Build a configuration from all sources without touching the global.
pub fn load() -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    defaults()?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (KEYEX_SERVER__PORT, KEYEX_FEDERATION__KEY_PATH, etc.)
        .add_source(
            config::Environment::with_prefix("KEYEX")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// The default layer every other source is stacked on.
pub fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    config::Config::builder()
        .set_default("server.name", "localhost")?
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8449)?
        .set_default("federation.key_path", "./data/signing.key")?
        .set_default("federation.key_validity_secs", 86_400)? // 24h
        .set_default("federation.flow_window_bytes", 1 << 17)?
        .set_default("federation.request_timeout_secs", 10)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name published in key metadata (e.g. "example.org").
    /// Maps to the `KEYEX_SERVER__NAME` env var or `server.name` in config.toml.
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    /// Path of the `"<key_id> <base64 seed>"` signing key file.
    pub key_path: String,
    /// How long published keys stay valid, in seconds.
    pub key_validity_secs: u64,
    /// In-flight byte budget for streamed responses on one connection.
    pub flow_window_bytes: u32,
    /// Deadline for a whole streamed call.
    pub request_timeout_secs: u64,
    /// Keys this server used to sign with and has since retired.
    #[serde(default)]
    pub old_verify_keys: Vec<OldVerifyKeyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OldVerifyKeyConfig {
    pub key_id: String,
    /// Standard base64 (padding optional) public key bytes.
    pub public_key: String,
    /// Unix millisecond timestamp at which the key stopped being used.
    pub expired_ts: i64,
}
