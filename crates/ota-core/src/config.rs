//! Daemon configuration loading.
//!
//! A small TOML file, read once at process start. A missing file is not an
//! error: every field has a working default, and most hosts run without a
//! trust anchor until their fleet starts signing packages.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ota/config.toml";

/// Default control-plane socket location.
pub const DEFAULT_SOCKET_PATH: &str = "/run/ota/ota.sock";

/// Errors that can occur when loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An I/O error occurred while reading the file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML content could not be deserialized.
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Process-wide configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// PEM public key used to verify signed manifests. Absent means no
    /// trust anchor: unsigned packages apply, signed ones are rejected.
    #[serde(default)]
    pub keyfile: Option<PathBuf>,

    /// Where staging directories are created. Defaults to the system
    /// temporary directory.
    #[serde(default)]
    pub staging_root: Option<PathBuf>,

    /// Control-plane Unix socket path.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Io` for any read failure other than the file
    /// not existing, or `ConfigError::Parse` for malformed TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(toml::from_str(&content)?)
    }

    /// Resolve the configuration file path: explicit flag, then the
    /// `OTA_CONFIG` environment variable, then the system default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(env_path) = std::env::var("OTA_CONFIG") {
            return PathBuf::from(env_path);
        }
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Effective control-plane socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
    }
}
