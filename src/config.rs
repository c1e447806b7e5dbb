use async_trait::async_trait;
use dashmap::DashMap;
use std::str::FromStr;
use std::time::Duration;
use std::{env, path::PathBuf};
use tracing::{debug, info};

use crate::error::ConfigurationError;
use crate::resolver::DEFAULT_PACKAGES_DIR;
use crate::retry::RetryPolicy;

pub const PACKAGES_DIR: &str = "RDFC_PACKAGES_DIR";
pub const RETRY_ATTEMPTS: &str = "RDFC_RETRY_ATTEMPTS";
pub const RETRY_DELAY_MS: &str = "RDFC_RETRY_DELAY_MS";
pub const CHANNEL_CAPACITY: &str = "RDFC_CHANNEL_CAPACITY";
pub const HANDSHAKE_TIMEOUT_MS: &str = "RDFC_HANDSHAKE_TIMEOUT_MS";
pub const SHUTDOWN_TIMEOUT_MS: &str = "RDFC_SHUTDOWN_TIMEOUT_MS";
pub const LOG_LEVEL: &str = "RDFC_LOG_LEVEL";
pub const LOG_DIR: &str = "RDFC_LOG_DIR";

/// Read-only source of `RDFC_*` settings.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager;

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        if let Some(path) = &env_file {
            if path.exists() {
                // variables already in the environment win
                dotenvy::from_path(path).ok();
                info!("Loaded .env from {}", path.display());
            } else {
                debug!("no .env at {}", path.display());
            }
        }
        Box::new(Self)
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

/// Fixed settings, for embedding the orchestrator without touching the
/// process environment.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Settings of one orchestrator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub packages_dir: PathBuf,
    pub retry: RetryPolicy,
    pub channel_capacity: usize,
    pub handshake_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            packages_dir: PathBuf::from(DEFAULT_PACKAGES_DIR),
            retry: RetryPolicy::default(),
            channel_capacity: 1,
            handshake_timeout: Duration::from_millis(5000),
            shutdown_timeout: Duration::from_millis(3000),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl OrchestratorConfig {
    /// Read every `RDFC_*` key, falling back to the defaults for unset ones.
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        let source = &config.0;

        let attempts: u32 = parse(source.as_ref(), RETRY_ATTEMPTS).await?.unwrap_or(defaults.retry.attempts);
        let delay = millis(source.as_ref(), RETRY_DELAY_MS).await?.unwrap_or(defaults.retry.delay);
        let channel_capacity = parse(source.as_ref(), CHANNEL_CAPACITY)
            .await?
            .unwrap_or(defaults.channel_capacity);
        if attempts == 0 {
            return Err(invalid(RETRY_ATTEMPTS, "0", "at least one attempt is needed"));
        }
        if channel_capacity == 0 {
            return Err(invalid(CHANNEL_CAPACITY, "0", "capacity must be positive"));
        }

        Ok(Self {
            packages_dir: source
                .get(PACKAGES_DIR)
                .await
                .map(PathBuf::from)
                .unwrap_or(defaults.packages_dir),
            retry: RetryPolicy::new(attempts, delay),
            channel_capacity,
            handshake_timeout: millis(source.as_ref(), HANDSHAKE_TIMEOUT_MS)
                .await?
                .unwrap_or(defaults.handshake_timeout),
            shutdown_timeout: millis(source.as_ref(), SHUTDOWN_TIMEOUT_MS)
                .await?
                .unwrap_or(defaults.shutdown_timeout),
            log_level: source.get(LOG_LEVEL).await.unwrap_or(defaults.log_level),
            log_dir: source
                .get(LOG_DIR)
                .await
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

async fn parse<T>(source: &dyn ConfigManagerType, key: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match source.get(key).await {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(key, &raw, e)),
    }
}

async fn millis(source: &dyn ConfigManagerType, key: &str) -> Result<Option<Duration>, ConfigurationError> {
    Ok(parse::<u64>(source, key).await?.map(Duration::from_millis))
}
