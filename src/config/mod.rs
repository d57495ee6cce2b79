//! Configuration management.
//!
//! gymflow configuration can come from:
//! - Environment variables (GYMFLOW_*)
//! - Config file (~/.config/gymflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// gymflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rate limit tier configuration
    #[serde(default)]
    pub rate_limit: RateLimitTiersConfig,
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

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL. None means the in-memory backend is used.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Default TTL applied when callers don't pick a tier (seconds)
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

/// Per-tier request budgets, requests per minute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitTiersConfig {
    #[serde(default = "default_basic_rpm")]
    pub basic_per_minute: u32,

    #[serde(default = "default_pro_rpm")]
    pub pro_per_minute: u32,

    #[serde(default = "default_enterprise_rpm")]
    pub enterprise_per_minute: u32,
}

impl Default for RateLimitTiersConfig {
    fn default() -> Self {
        Self {
            basic_per_minute: default_basic_rpm(),
            pro_per_minute: default_pro_rpm(),
            enterprise_per_minute: default_enterprise_rpm(),
        }
    }
}

fn default_basic_rpm() -> u32 {
    60
}

fn default_pro_rpm() -> u32 {
    300
}

fn default_enterprise_rpm() -> u32 {
    1200
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("gymflow"))
            .unwrap_or_else(|| PathBuf::from(".gymflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("gymflow"))
            .unwrap_or_else(|| PathBuf::from(".gymflow"))
    }

    /// Resolved database path (config value or the default data dir).
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("gymflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("GYMFLOW_SERVER_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                self.server.port = parsed;
            }
        }
        if let Ok(host) = std::env::var("GYMFLOW_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(path) = std::env::var("GYMFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("GYMFLOW_REDIS_URL") {
            if !url.is_empty() {
                self.cache.redis_url = Some(url);
            }
        }
        if let Ok(ttl) = std::env::var("GYMFLOW_CACHE_TTL_SECS") {
            if let Ok(parsed) = ttl.parse::<u64>() {
                self.cache.default_ttl_secs = parsed;
            }
        }
        if let Ok(rpm) = std::env::var("GYMFLOW_RATE_LIMIT_BASIC_RPM") {
            if let Ok(parsed) = rpm.parse::<u32>() {
                self.rate_limit.basic_per_minute = parsed;
            }
        }
        if let Ok(rpm) = std::env::var("GYMFLOW_RATE_LIMIT_PRO_RPM") {
            if let Ok(parsed) = rpm.parse::<u32>() {
                self.rate_limit.pro_per_minute = parsed;
            }
        }
        if let Ok(rpm) = std::env::var("GYMFLOW_RATE_LIMIT_ENTERPRISE_RPM") {
            if let Ok(parsed) = rpm.parse::<u32>() {
                self.rate_limit.enterprise_per_minute = parsed;
            }
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
        if let Some(cache) = partial.cache {
            self.cache = cache;
        }
        if let Some(rate_limit) = partial.rate_limit {
            self.rate_limit = rate_limit;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    cache: Option<CacheConfig>,
    rate_limit: Option<RateLimitTiersConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert_eq!(config.rate_limit.basic_per_minute, 60);
        assert_eq!(config.rate_limit.pro_per_minute, 300);
        assert_eq!(config.rate_limit.enterprise_per_minute, 1200);
        assert!(config.cache.redis_url.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let partial: PartialConfig = toml::from_str(
            r#"
            [server]
            port = 9090
            host = "0.0.0.0"

            [rate_limit]
            basic_per_minute = 10
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_partial(partial);

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.rate_limit.basic_per_minute, 10);
        // Unspecified tier fields fall back to serde defaults
        assert_eq!(config.rate_limit.pro_per_minute, 300);
    }
}
