//! Runtime configuration.
//!
//! Loaded from TOML; every field has a default so a partial (or empty)
//! file is valid. Environment variables override the file:
//!
//! | Variable              | Field                 |
//! |-----------------------|-----------------------|
//! | `HEARTH_BIND_ADDR`    | `gateway.bind_addr`   |
//! | `HEARTH_DATA_DIR`     | `storage.data_dir`    |
//! | `HEARTH_BUS_CAPACITY` | `bus_capacity`        |
//!
//! Gateway sign-in tokens live only in the file, under `[gateway.tokens]`
//! as `"token" = "uid"` pairs.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BUS_CAPACITY;
use crate::client::ClientConfig;
use crate::server::GatewayConfig;
use crate::store::StoreConfig;

pub const ENV_BIND_ADDR: &str = "HEARTH_BIND_ADDR";
pub const ENV_DATA_DIR: &str = "HEARTH_DATA_DIR";
pub const ENV_BUS_CAPACITY: &str = "HEARTH_BUS_CAPACITY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

/// Persistence section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// RocksDB directory; the store is in memory when unset
    pub data_dir: Option<PathBuf>,
    pub sync_writes: bool,
    pub block_cache_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_writes: false,
            block_cache_size: 64 * 1024 * 1024,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    pub gateway: GatewayConfig,
    pub storage: StorageSettings,
    pub client: ClientConfig,
    /// Buffered permission errors per bus listener
    pub bus_capacity: usize,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            storage: StorageSettings::default(),
            client: ClientConfig::default(),
            bus_capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

impl HearthConfig {
    /// Read `path` and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&text)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            self.gateway.bind_addr = addr;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.storage.data_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_BUS_CAPACITY) {
            self.bus_capacity = match value.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::Env {
                        var: ENV_BUS_CAPACITY,
                        value,
                    })
                }
            };
        }
        Ok(())
    }

    /// RocksDB settings, or None for an in-memory store.
    pub fn store_config(&self) -> Option<StoreConfig> {
        let path = self.storage.data_dir.clone()?;
        Some(StoreConfig {
            path,
            block_cache_size: self.storage.block_cache_size,
            sync_writes: self.storage.sync_writes,
            ..StoreConfig::default()
        })
    }
}
