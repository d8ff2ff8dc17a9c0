use crate::proxy::types::{
    PoolCapacity, ProxyConfig, TlsFiles, DEFAULT_LISTEN_ADDRESS, DEFAULT_POOL_CAPACITY,
    DEFAULT_TIMEOUT,
};
pub use config::ConfigError;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, Map};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `SWITCHPROXY__LISTEN__ADDRESS`
pub const ENV_PREFIX: &str = "SWITCHPROXY";

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub listen: ListenSettings,
    #[serde(default)]
    pub primary: Option<TargetSettings>,
    #[serde(default)]
    pub secondaries: Vec<TargetSettings>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ListenSettings {
    pub address: String,
    pub timeout_secs: u64,
    pub pool_capacity: usize,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
}

/// One upstream a switch forwards to
#[derive(Debug, Deserialize, Clone)]
pub struct TargetSettings {
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Prefix rewrites, applied first match wins in the listed order
    #[serde(default)]
    pub rewrites: Vec<RewriteSettings>,
    /// Attach the tracing pre/post hooks to this target
    #[serde(default)]
    pub log_calls: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RewriteSettings {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

impl TargetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Self::defaults()?
            // Add configuration files if they exist
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Self::environment(None))
            .build()?
            .try_deserialize()
    }

    /// Load from a single configuration file on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Config::builder()
            .set_default("listen.address", DEFAULT_LISTEN_ADDRESS)?
            .set_default("listen.timeout_secs", DEFAULT_TIMEOUT.as_secs())?
            .set_default("listen.pool_capacity", DEFAULT_POOL_CAPACITY as u64)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")
    }

    /// Environment variables with prefix; `source` replaces the process environment
    fn environment(source: Option<Map<String, String>>) -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(source)
    }

    /// Library-level proxy configuration for the listener
    pub fn proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        let pool_capacity = PoolCapacity::try_new(self.listen.pool_capacity).map_err(|_| {
            ConfigError::Message(format!(
                "listen.pool_capacity must be greater than zero, got {}",
                self.listen.pool_capacity
            ))
        })?;

        let mut config = ProxyConfig::new(self.listen.address.clone())
            .with_timeout(Duration::from_secs(self.listen.timeout_secs))
            .with_pool_capacity(pool_capacity);
        config.tls = self.listen.tls.clone();
        Ok(config)
    }
}
