//! Configuration loading and validation for Murmur.
//!
//! Loads configuration from `~/.murmur/config.toml` with environment
//! variable overrides. Missing files fall back to defaults so a fresh
//! install runs without any setup beyond an API key.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The root configuration structure.
///
/// Maps directly to `~/.murmur/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion backend settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Gateway (WebSocket server) settings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// On-disk storage locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Identity / system prompt settings
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Delegated-activation and token-refresh tuning
    #[serde(default)]
    pub activation: ActivationConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible endpoint base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key for the endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model to drive sessions with
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}

fn default_model() -> String {
    "moonshotai/kimi-k2-instruct".into()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the per-(user, module, key) settings store
    #[serde(default = "default_settings_dir")]
    pub settings_dir: PathBuf,

    /// Where closed-session transcripts are written
    #[serde(default = "default_session_cache_dir")]
    pub session_cache_dir: PathBuf,
}

fn default_settings_dir() -> PathBuf {
    AppConfig::config_dir().join("cfg")
}

fn default_session_cache_dir() -> PathBuf {
    AppConfig::config_dir().join("session_cache")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
            session_cache_dir: default_session_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Override the built-in system prompt entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// How long to wait for a delegated activation to report readiness
    #[serde(default = "default_activation_timeout_ms")]
    pub timeout_ms: u64,

    /// Settle delay after readiness is observed, before the single retry
    #[serde(default = "default_activation_settle_ms")]
    pub settle_ms: u64,

    /// Refresh integration tokens when expiry is within this margin
    #[serde(default = "default_refresh_margin_secs")]
    pub token_refresh_margin_secs: i64,
}

fn default_activation_timeout_ms() -> u64 {
    5_000
}

fn default_activation_settle_ms() -> u64 {
    250
}

fn default_refresh_margin_secs() -> i64 {
    60
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_activation_timeout_ms(),
            settle_ms: default_activation_settle_ms(),
            token_refresh_margin_secs: default_refresh_margin_secs(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("gateway", &self.gateway)
            .field("storage", &self.storage)
            .field("identity", &self.identity)
            .field("activation", &self.activation)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Environment variable overrides (highest priority):
    /// - `MURMUR_API_KEY` (falls back to `GROQ_API_KEY`)
    /// - `MURMUR_MODEL`
    /// - `MURMUR_BASE_URL`
    /// - `MURMUR_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.provider.api_key.is_none() {
            config.provider.api_key = std::env::var("MURMUR_API_KEY")
                .ok()
                .or_else(|| std::env::var("GROQ_API_KEY").ok());
        }
        if let Ok(model) = std::env::var("MURMUR_MODEL") {
            config.provider.model = model;
        }
        if let Ok(base_url) = std::env::var("MURMUR_BASE_URL") {
            config.provider.base_url = base_url;
        }
        if let Ok(port) = std::env::var("MURMUR_PORT") {
            config.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("MURMUR_PORT is not a port number: {port}"))
            })?;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".murmur")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.base_url.is_empty() {
            return Err(ConfigError::ValidationError(
                "provider.base_url must not be empty".into(),
            ));
        }
        if self.activation.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "activation.timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            gateway: GatewayConfig::default(),
            storage: StorageConfig::default(),
            identity: IdentityConfig::default(),
            activation: ActivationConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
