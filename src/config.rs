//! Configuration management.
//!
//! thermalcast configuration can come from:
//! - Environment variables (THERMALCAST_*)
//! - Config file (~/.config/thermalcast/config.toml)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// thermalcast configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upstream collaborator configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Upstream collaborator configuration (forecast, AI, images, email).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Gemini API key for interpretation generation
    #[serde(default)]
    pub gemini_api_key: Option<String>,

    /// Gemini model name
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,

    /// Meteoblue API key for meteogram images
    #[serde(default)]
    pub meteoblue_api_key: Option<String>,

    /// Brevo API key for transactional email
    #[serde(default)]
    pub brevo_api_key: Option<String>,

    /// Sender address for outgoing report emails
    #[serde(default = "default_sender_email")]
    pub sender_email: String,

    /// Sender display name
    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    /// Timeout for forecast fetches (seconds)
    #[serde(default = "default_forecast_timeout")]
    pub forecast_timeout_seconds: u64,

    /// Timeout for meteogram image fetches (seconds)
    #[serde(default = "default_image_timeout")]
    pub image_timeout_seconds: u64,

    /// Timeout for interpretation generation (seconds)
    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: default_gemini_model(),
            meteoblue_api_key: None,
            brevo_api_key: None,
            sender_email: default_sender_email(),
            sender_name: default_sender_name(),
            forecast_timeout_seconds: default_forecast_timeout(),
            image_timeout_seconds: default_image_timeout(),
            generate_timeout_seconds: default_generate_timeout(),
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-3-pro-preview".to_string()
}

fn default_sender_email() -> String {
    "reports@thermalcast.local".to_string()
}

fn default_sender_name() -> String {
    "ThermalCast".to_string()
}

fn default_forecast_timeout() -> u64 {
    10
}

fn default_image_timeout() -> u64 {
    15
}

fn default_generate_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("thermalcast"))
            .unwrap_or_else(|| PathBuf::from(".thermalcast"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("thermalcast"))
            .unwrap_or_else(|| PathBuf::from(".thermalcast"))
    }

    /// Resolve the database path, defaulting to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("thermalcast.db"))
    }

    /// Gemini key, required for interpretation generation.
    pub fn require_gemini_key(&self) -> Result<&str> {
        self.upstream
            .gemini_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("GEMINI_API_KEY is not configured".to_string()))
    }

    /// Meteoblue key, required for meteogram images.
    pub fn require_meteoblue_key(&self) -> Result<&str> {
        self.upstream
            .meteoblue_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("METEOBLUE_API_KEY is not configured".to_string()))
    }

    /// Brevo key, required for email delivery.
    pub fn require_brevo_key(&self) -> Result<&str> {
        self.upstream
            .brevo_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("BREVO_API_KEY is not configured".to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("THERMALCAST_SERVER_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("THERMALCAST_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(path) = std::env::var("THERMALCAST_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(key) = std::env::var("THERMALCAST_GEMINI_API_KEY") {
            self.upstream.gemini_api_key = Some(key);
        }
        if let Ok(model) = std::env::var("THERMALCAST_GEMINI_MODEL") {
            self.upstream.gemini_model = model;
        }
        if let Ok(key) = std::env::var("THERMALCAST_METEOBLUE_API_KEY") {
            self.upstream.meteoblue_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("THERMALCAST_BREVO_API_KEY") {
            self.upstream.brevo_api_key = Some(key);
        }
        if let Ok(email) = std::env::var("THERMALCAST_SENDER_EMAIL") {
            self.upstream.sender_email = email;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(upstream) = partial.upstream {
            self.upstream = upstream;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    upstream: Option<UpstreamConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.forecast_timeout_seconds, 10);
        assert_eq!(config.upstream.image_timeout_seconds, 15);
    }

    #[test]
    fn test_missing_credentials_are_config_errors() {
        let config = Config::default();
        assert!(matches!(
            config.require_gemini_key(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            config.require_brevo_key(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_partial_toml() {
        let partial: PartialConfig = toml::from_str(
            r#"
            [server]
            port = 9090
            host = "0.0.0.0"

            [upstream]
            gemini_api_key = "k"
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(partial);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.upstream.gemini_api_key.as_deref(), Some("k"));
        // Untouched sections keep defaults
        assert_eq!(config.upstream.gemini_model, default_gemini_model());
    }
}
