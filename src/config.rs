//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Built-in defaults
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Session behavior advertised and applied by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Languages reported in the `opened` message when the client asks for
    /// the supported-language list.
    pub supported_languages: Vec<String>,
    /// Maximum number of concurrently connected sessions.
    pub max_concurrent_sessions: usize,
}

/// Connection authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API key to base64-encoded client secret. An empty secret permits
    /// unsigned requests for that key.
    pub api_keys: HashMap<String, String>,
    /// Minimum response delay for failed signature verification, ms.
    pub min_failure_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            session: SessionConfig {
                supported_languages: vec!["en-us".to_string()],
                max_concurrent_sessions: 100,
            },
            auth: AuthConfig {
                api_keys: HashMap::new(),
                min_failure_delay_ms: 500,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and the environment.
    ///
    /// The `HOST`/`PORT` variables used by deployment platforms are honored
    /// as overrides even though they lack the APP_ prefix.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent sessions must be greater than 0"
            ));
        }

        if self.auth.min_failure_delay_ms > 30_000 {
            return Err(anyhow::anyhow!(
                "Signature failure delay above 30s would starve the connection"
            ));
        }

        for language in &self.session.supported_languages {
            if language.is_empty() || language.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(anyhow::anyhow!(
                    "Supported languages must be lowercase BCP-47 tags (got {language:?})"
                ));
            }
        }

        Ok(())
    }
}
