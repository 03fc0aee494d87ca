//! Static service configuration
//!
//! Everything here is fixed at startup: bind address, database location,
//! signing secret, provider credentials. Settings that admins can change at
//! runtime live in the [`crate::settings`] registry instead.

use serde::{Deserialize, Serialize};

/// Main configuration for the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Record store / vector index database
    pub database: DatabaseConfig,

    /// Token signing and password policy
    pub auth: AuthConfig,

    /// Gemini provider settings
    pub gemini: GeminiConfig,

    /// Session housekeeping
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Debug mode: echoes reset tokens in the forgot-password reply
    #[serde(default)]
    pub debug: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database URL
    pub url: String,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer and reset tokens
    pub jwt_secret: String,

    /// Reset token lifetime in minutes
    #[serde(default = "default_reset_token_minutes")]
    pub reset_token_expire_minutes: i64,

    /// Bootstrap admin username, created at first startup when no admin exists
    #[serde(default)]
    pub bootstrap_admin_username: Option<String>,

    /// Bootstrap admin password
    #[serde(default)]
    pub bootstrap_admin_password: Option<String>,

    /// Bootstrap admin email
    #[serde(default)]
    pub bootstrap_admin_email: Option<String>,
}

fn default_reset_token_minutes() -> i64 {
    60
}

/// Gemini provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key; overridable via GEMINI_API_KEY
    pub api_key: String,

    /// API base URL
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,

    /// Per-attempt request timeout in seconds
    #[serde(default = "default_gemini_timeout")]
    pub timeout_secs: u64,
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_timeout() -> u64 {
    60
}

/// Session housekeeping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted with their messages
    pub inactivity_window_days: i64,

    /// Eviction sweep interval in seconds
    pub eviction_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_window_days: 30,
            eviction_interval_secs: 3600,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                debug: false,
            },
            database: DatabaseConfig {
                url: "sqlite:finrag.db".to_string(),
                max_connections: default_max_connections(),
            },
            auth: AuthConfig {
                jwt_secret: String::new(),
                reset_token_expire_minutes: default_reset_token_minutes(),
                bootstrap_admin_username: None,
                bootstrap_admin_password: None,
                bootstrap_admin_email: None,
            },
            gemini: GeminiConfig {
                api_key: String::new(),
                base_url: default_gemini_base_url(),
                timeout_secs: default_gemini_timeout(),
            },
            sessions: SessionConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let mut config: Self = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables win over file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            self.gemini.api_key = key;
        }
        if let Ok(secret) = std::env::var("FINRAG_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Ok(url) = std::env::var("FINRAG_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(debug) = std::env::var("FINRAG_DEBUG") {
            self.server.debug = debug == "1" || debug.eq_ignore_ascii_case("true");
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.len() < 16 {
            return Err(anyhow::anyhow!(
                "jwt_secret must be at least 16 characters"
            ));
        }

        if self.database.url.is_empty() {
            return Err(anyhow::anyhow!("Database URL cannot be empty"));
        }

        if !self.gemini.base_url.starts_with("http") {
            return Err(anyhow::anyhow!(
                "Invalid Gemini base URL: {}",
                self.gemini.base_url
            ));
        }

        if self.auth.reset_token_expire_minutes <= 0 {
            return Err(anyhow::anyhow!(
                "Reset token lifetime must be greater than 0"
            ));
        }

        if self.sessions.inactivity_window_days <= 0 {
            return Err(anyhow::anyhow!(
                "Session inactivity window must be greater than 0"
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.auth.jwt_secret = "0123456789abcdef0123".to_string();
        config.gemini.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config_rejected_without_secret() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        assert!(config.validate().is_ok());

        config.gemini.base_url = "not-a-url".to_string();
        assert!(config.validate().is_err());

        config = valid_config();
        config.auth.reset_token_expire_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = valid_config();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        config.to_file(&path).unwrap();
        let loaded = ServiceConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.database.url, config.database.url);
    }
}
