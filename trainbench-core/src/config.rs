//! Service configuration.
//!
//! Loaded once at startup and passed into each component's constructor; there
//! is no ambient global configuration anywhere in the crate.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server binding.
    #[serde(default)]
    pub server: ServerConfig,
    /// Experiment storage.
    #[serde(default)]
    pub experiments: ExperimentsConfig,
    /// Seed applied to the numeric backend and RNGs at startup.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            experiments: ExperimentsConfig::default(),
            seed: default_seed(),
        }
    }
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8600
}

/// Experiment storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentsConfig {
    /// Directory holding one subdirectory per experiment.
    #[serde(default = "default_experiments_dir")]
    pub dir: PathBuf,
    /// Length of generated experiment identifiers.
    #[serde(default = "default_id_len")]
    pub id_len: usize,
}

impl Default for ExperimentsConfig {
    fn default() -> Self {
        Self {
            dir: default_experiments_dir(),
            id_len: default_id_len(),
        }
    }
}

fn default_experiments_dir() -> PathBuf {
    PathBuf::from(".trainbench/experiments")
}

fn default_id_len() -> usize {
    12
}

fn default_seed() -> u64 {
    42
}

impl AppConfig {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file doesn't exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        Ok(crate::persist::load_yaml(path)?.unwrap_or_default())
    }
}
