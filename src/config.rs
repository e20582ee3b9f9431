//! Configuration management for agefs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default name of the per-source-tree ignore policy file
pub const DEFAULT_POLICY_FILE_NAME: &str = ".ageignore";

/// Default attribute/entry cache lifetime handed to the kernel (ms)
pub const DEFAULT_TTL_MS: u64 = 1000;

/// Default number of request workers
pub const DEFAULT_WORKERS: usize = 16;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity (private key) file used when `--identity` is not given
    pub identity_file: Option<PathBuf>,

    /// Name of the ignore policy file looked up at the root of the source tree
    pub policy_file_name: String,

    /// Mount configuration
    pub mount: MountConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Mount read-only
    pub read_only: bool,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Attribute cache TTL in milliseconds
    pub attr_ttl_ms: u64,

    /// Entry cache TTL in milliseconds
    pub entry_ttl_ms: u64,

    /// Size of the blocking request worker pool
    pub workers: usize,

    /// Filesystem name shown in the mount table
    pub fs_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            identity_file: None,
            policy_file_name: DEFAULT_POLICY_FILE_NAME.to_string(),
            mount: MountConfig::default(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            read_only: false,
            allow_other: false,
            attr_ttl_ms: DEFAULT_TTL_MS,
            entry_ttl_ms: DEFAULT_TTL_MS,
            workers: DEFAULT_WORKERS,
            fs_name: "agefs".to_string(),
        }
    }
}

impl Config {
    /// Default location of the config file (`~/.config/agefs/config.json`)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agefs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => serde_json::from_str::<Config>(&content).map_err(|e| {
                Error::Config(format!("Failed to parse config file: {}", e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(Error::Config(format!("Failed to read config file: {}", e)));
            }
        };

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(identity) = std::env::var("AGEFS_IDENTITY") {
            let identity = identity.trim();
            if !identity.is_empty() {
                self.identity_file = Some(PathBuf::from(identity));
            }
        }

        if let Ok(workers) = std::env::var("AGEFS_WORKERS") {
            if let Ok(n) = workers.trim().parse::<usize>() {
                self.mount.workers = n;
            }
        }

        if let Ok(allow_other) = std::env::var("AGEFS_ALLOW_OTHER") {
            match allow_other.trim() {
                "1" | "true" | "yes" => self.mount.allow_other = true,
                "0" | "false" | "no" => self.mount.allow_other = false,
                _ => {}
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.mount.workers == 0 {
            return Err(Error::InvalidConfig(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.policy_file_name.is_empty()
            || self.policy_file_name.contains('/')
            || self.policy_file_name == "."
            || self.policy_file_name == ".."
        {
            return Err(Error::InvalidConfig(format!(
                "Policy file name must be a plain file name, got {:?}",
                self.policy_file_name
            )));
        }

        Ok(())
    }
}
