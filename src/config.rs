//! Configuration for ptyadapter.
//!
//! Loaded from `~/.ptyadapter/config.toml` when it exists. Every field is
//! optional; command-line flags win over file values.
//!
//! ```toml
//! # Always turn terminal mouse reporting on (same as --mouse)
//! mouse = false
//!
//! # Log level or EnvFilter directive; PTYADAPTER_LOG overrides it
//! log_level = "info"
//!
//! [environment]
//! # Drop TERM from the child's environment
//! clear_term = true
//! # Extra variables copied into the child's environment when set
//! propagate = ["LANG"]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Force mouse reporting on
    pub mouse: bool,
    /// Default log level
    pub log_level: String,
    /// Child environment settings
    pub environment: EnvironmentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mouse: false,
            log_level: "info".to_string(),
            environment: EnvironmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub clear_term: bool,
    pub propagate: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            clear_term: true,
            propagate: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration file. A missing file gives the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `~/.ptyadapter`, where the config and log files live
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ptyadapter"))
}

fn config_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("config.toml"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
