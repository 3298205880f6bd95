use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use pingora::services::background::BackgroundService;
use serde::Deserialize;
use thiserror::Error;

use crate::billing::BillingConfig;
use crate::limiter::DEFAULT_STORE_TIMEOUT;
use crate::quota::QuotaPolicy;

const DEFAULT_LISTEN: &str = "0.0.0.0:3001";
const RELOAD_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Gateway settings, read from the same YAML file as Pingora's server options.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Path to the backend routing file.
    pub backend: String,
    /// Path to the SQLite plan directory.
    pub plan_db: String,
    /// Shared usage counter store. In-process counters are used when absent.
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Tiers to override or add on top of the built-in quota table.
    #[serde(default)]
    pub quotas: Option<QuotaPolicy>,
    #[serde(default)]
    pub billing: BillingConfig,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

impl ServerConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        read_yaml(path.as_ref())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        match &self.quotas {
            Some(overrides) => QuotaPolicy::default().with_overrides(overrides),
            None => QuotaPolicy::default(),
        }
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve(base: &Path, path: &str) -> PathBuf {
    if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    }
}

/// Routing table for the address lookup backends.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub prefix: String,
    pub backend: Backend,
}

#[derive(Debug, Deserialize)]
pub struct Backend {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Backend {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Config = read_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid("no backends configured".into()));
        }
        for b in &self.backends {
            if !b.prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "prefix '{}' must start with '/'",
                    b.prefix
                )));
            }
            if b.backend.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend for '{}' has port 0",
                    b.prefix
                )));
            }
        }
        Ok(())
    }

    /// Backend with the longest prefix matching `path`.
    pub fn route(&self, path: &str) -> Option<&BackendConfig> {
        self.backends
            .iter()
            .filter(|b| path.starts_with(&b.prefix))
            .max_by_key(|b| b.prefix.len())
    }
}

/// Background service that periodically reloads the backend routing file.
///
/// A file that fails to read, parse or validate is logged and ignored; the
/// previous table stays in effect.
pub struct ConfigReloader {
    pub path: PathBuf,
    pub config: Arc<RwLock<Config>>,
}

impl ConfigReloader {
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = Config::from_yaml_file(&self.path)?;
        let mut config = self
            .config
            .write()
            .map_err(|_| ConfigError::Invalid("backend config lock poisoned".into()))?;
        *config = fresh;
        Ok(())
    }
}

#[async_trait]
impl BackgroundService for ConfigReloader {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(RELOAD_INTERVAL) => {}
            }

            if let Err(e) = self.reload() {
                log::error!("Failed to reload backend config: {}", e);
            }
        }
    }
}
