//! Configuration management for LineSight services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use crate::errors::AppError;
use chrono::{FixedOffset, Weekday};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Question pipeline tuning
    #[serde(default)]
    pub query: QueryConfig,

    /// Known component partitions
    #[serde(default)]
    pub components: ComponentsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Which store implementation backs the pipeline
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Store implementation
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Connection string (required for postgres)
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// JSON fixture file (required for memory)
    pub fixtures_path: Option<String>,

    /// Apply embedded migrations on start
    #[serde(default)]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat-completions endpoint
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    /// API key; required at startup
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature (0.0 - 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Offset from UTC used for calendar arithmetic, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// First day of the week: "sunday" or "monday"
    #[serde(default = "default_week_start")]
    pub week_start: String,

    /// Record limit for the plain predicate path
    #[serde(default = "default_find_limit")]
    pub find_limit: usize,

    /// Record limit for component partition queries
    #[serde(default = "default_partition_limit")]
    pub partition_limit: usize,

    /// Route delimited component names to their partitions
    #[serde(default = "default_enabled")]
    pub component_routing: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ComponentsConfig {
    /// Component identifiers with a dedicated inspection partition
    #[serde(default)]
    pub known: Vec<String>,

    /// Also register partitions found in the store at startup
    #[serde(default)]
    pub discover: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_backend() -> StoreBackend { StoreBackend::Postgres }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_connect_timeout() -> u64 { 10 }
fn default_llm_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_llm_timeout() -> u64 { 30 }
fn default_max_tokens() -> usize { 1000 }
fn default_temperature() -> f32 { 0.2 }
fn default_week_start() -> String { "sunday".to_string() }
fn default_find_limit() -> usize { 20 }
fn default_partition_limit() -> usize { 20 }
fn default_enabled() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "linesight".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            fixtures_path: None,
            run_migrations: false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: None,
            model: default_llm_model(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            week_start: default_week_start(),
            find_limit: default_find_limit(),
            partition_limit: default_partition_limit(),
            component_routing: default_enabled(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl QueryConfig {
    /// Fixed offset used to place calendar boundaries
    pub fn utc_offset(&self) -> Result<FixedOffset, AppError> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            AppError::Configuration {
                message: format!(
                    "query.utc_offset_minutes out of range: {}",
                    self.utc_offset_minutes
                ),
            }
        })
    }

    /// Parsed week start day
    pub fn week_start_day(&self) -> Result<Weekday, AppError> {
        match self.week_start.to_ascii_lowercase().as_str() {
            "sunday" | "sun" => Ok(Weekday::Sun),
            "monday" | "mon" => Ok(Weekday::Mon),
            other => Err(AppError::Configuration {
                message: format!("query.week_start must be sunday or monday, got '{}'", other),
            }),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__LLM__API_KEY=...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("components.known")
                    .try_parsing(true),
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check settings that must be present before serving any question.
    pub fn validate(&self) -> Result<(), AppError> {
        match self.database.backend {
            StoreBackend::Postgres => {
                if self.database.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(AppError::Configuration {
                        message: "database.url is required for the postgres backend".to_string(),
                    });
                }
            }
            StoreBackend::Memory => {
                if self.database.fixtures_path.is_none() {
                    return Err(AppError::Configuration {
                        message: "database.fixtures_path is required for the memory backend"
                            .to_string(),
                    });
                }
            }
        }

        if self.llm.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            return Err(AppError::Configuration {
                message: "llm.api_key is required".to_string(),
            });
        }

        self.query.utc_offset()?;
        self.query.week_start_day()?;
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            query: QueryConfig::default(),
            components: ComponentsConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.database.url = Some("postgres://localhost/linesight".to_string());
        config.llm.api_key = Some("sk-test".to_string());
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.query.find_limit, 20);
        assert_eq!(config.query.partition_limit, 20);
        assert!(config.query.component_routing);
    }

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let mut config = valid_config();
        config.llm.api_key = Some("   ".to_string());

        let err = config.validate().unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn test_missing_database_url_is_configuration_error() {
        let mut config = valid_config();
        config.database.url = None;

        assert!(matches!(
            config.validate(),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_memory_backend_needs_fixtures() {
        let mut config = valid_config();
        config.database.backend = StoreBackend::Memory;
        assert!(config.validate().is_err());

        config.database.fixtures_path = Some("config/fixtures/demo.json".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_week_start_parsing() {
        let mut query = QueryConfig::default();
        assert_eq!(query.week_start_day().unwrap(), Weekday::Sun);

        query.week_start = "Monday".to_string();
        assert_eq!(query.week_start_day().unwrap(), Weekday::Mon);

        query.week_start = "friday".to_string();
        assert!(query.week_start_day().is_err());
    }

    #[test]
    fn test_from_file_reads_shipped_defaults() {
        let config = AppConfig::from_file("../../config/default.toml").unwrap();

        assert_eq!(config.database.backend, StoreBackend::Memory);
        assert_eq!(config.database.fixtures_path.as_deref(), Some("config/fixtures/demo.json"));
        assert!(config.components.known.iter().any(|name| name == "ABC_2"));
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }
}

