use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    error::{AdmissionError, Result},
    redis::RedisConfig,
};

/// Environment variable naming the optional YAML config file
pub const CONFIG_PATH_ENV: &str = "EDGE_QUOTA_CONFIG";
/// Prefix for environment overrides, e.g. `EDGE_QUOTA__QUOTA__LIMIT=500`
pub const ENV_PREFIX: &str = "EDGE_QUOTA";

/// Tokens per window for every identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub limit: u32,
    pub window_seconds: u64,
}

impl QuotaConfig {
    pub fn new(limit: u32, window_seconds: u64) -> Result<Self> {
        let quota = Self {
            limit,
            window_seconds,
        };
        quota.validate()?;
        Ok(quota)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(AdmissionError::ConfigurationInvalid(
                "quota.limit must be positive".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(AdmissionError::ConfigurationInvalid(
                "quota.window_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window_seconds: 60,
        }
    }
}

/// Which bucket store backs the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

/// Process-wide configuration for the admission service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub enabled: bool,
    pub quota: QuotaConfig,
    /// Added to the window length when setting a record's expiry
    pub grace_seconds: u64,
    pub key_prefix: String,
    pub identity_header: String,
    pub bypass: Vec<String>,
    pub store_timeout_ms: u64,
    pub store: StoreBackend,
    pub memory_capacity: u64,
    pub redis: RedisConfig,
    pub http_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quota: QuotaConfig::default(),
            grace_seconds: 0,
            key_prefix: "quota".to_string(),
            identity_header: "x-api-key".to_string(),
            bypass: Vec::new(),
            store_timeout_ms: 50,
            store: StoreBackend::Redis,
            memory_capacity: 100_000,
            redis: RedisConfig::default(),
            http_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then the optional YAML file, then `EDGE_QUOTA__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
            .unwrap_or_else(|| "edge-quota.yaml".to_string());

        let app: AppConfig = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(
                config::File::with_name(&path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("bypass")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        self.quota.validate()?;
        if self.store_timeout_ms == 0 {
            return Err(AdmissionError::ConfigurationInvalid(
                "store_timeout_ms must be positive".to_string(),
            ));
        }
        if self.identity_header.trim().is_empty() {
            return Err(AdmissionError::ConfigurationInvalid(
                "identity_header must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Expiry given to each new bucket record
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.quota.window_seconds + self.grace_seconds)
    }
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<AppConfig> {
    let config: AppConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}
