//! Configuration loaded from `~/.spm/config.toml`.
//!
//! Every section and key is optional; a missing file yields the defaults.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::logging::LogConfig;
use crate::metadata::{DEFAULT_INTERFACE_NAME, DEFAULT_INTERFACE_NAMESPACE, EntryPointContract};

/// Default archive size cap (100 MiB).
pub const DEFAULT_MAX_ARCHIVE_BYTES: u64 = 100 * 1024 * 1024;

/// Default read buffer size for the response body.
pub const DEFAULT_CHUNK_SIZE: usize = 81_920;

/// Default request timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Configuration file name inside [`spm_dir`].
const CONFIG_FILE: &str = "config.toml";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Returns the application directory (`~/.spm`).
#[must_use]
pub fn spm_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".spm")
}

/// Download settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Largest archive accepted, in bytes.
    pub max_archive_bytes: u64,
    /// Size of each body read.
    pub chunk_size: usize,
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            user_agent: format!("spm/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Plugin contract and host settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub interface_namespace: String,
    pub interface_name: String,
    /// API level of the host, used for readiness checks when known.
    pub host_api_level: Option<i32>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            interface_namespace: DEFAULT_INTERFACE_NAMESPACE.to_string(),
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            host_api_level: None,
        }
    }
}

impl PluginConfig {
    /// Interface the entry type must implement.
    #[must_use]
    pub fn contract(&self) -> EntryPointContract {
        EntryPointContract::new(&self.interface_namespace, &self.interface_name)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub plugin: PluginConfig,
    pub log: LogConfig,
}

impl Config {
    /// Returns the default config file path.
    #[must_use]
    pub fn path() -> PathBuf {
        spm_dir().join(CONFIG_FILE)
    }

    /// Loads `~/.spm/config.toml`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path())
    }

    /// Loads a config file, returning defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.log.level = LogConfig::parse_level(&config.log.level);
        Ok(config)
    }
}
