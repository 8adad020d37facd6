//! Configuration file handling for `config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Durations are stored as milliseconds and exposed as [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::channel::port::default_runtime_dir;
use crate::process::discovery::StartupAction;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {key} - {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the channel and window sockets
    pub runtime_dir: Option<PathBuf>,
    pub host: HostSettings,
    pub plugin: PluginSettings,
    pub timeouts: Timeouts,
}

/// How the host application is found or started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub startup: StartupAction,
    /// Executable used by `start-user-specified`
    pub executable: Option<PathBuf>,
    /// Process name used to find running hosts and to resolve the default executable
    pub process_name: String,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            startup: StartupAction::default(),
            executable: None,
            process_name: "hostdrive".to_string(),
            arguments: vec!["host".to_string(), "--exit-after-session".to_string()],
            working_directory: None,
        }
    }
}

/// The plugin module the host must load before it can serve tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub path: Option<PathBuf>,
}

/// Timeouts and intervals, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Bound on the plugin load polling loop
    pub plugin_load: u64,
    /// Interval between plugin load attempts
    pub plugin_poll: u64,
    /// Bound on window/idle waits and on the readiness ping loop
    pub ready: u64,
    pub ready_poll: u64,
    /// Host-side watchdog; 0 disables liveness checking
    pub watchdog: u64,
    /// Client keep-alive ping interval
    pub keep_alive: u64,
    /// Bound on a single remote ping or shutdown call
    pub call: u64,
    /// How long a created host may take to exit after a graceful shutdown
    pub exit_grace: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            plugin_load: 60_000,
            plugin_poll: 200,
            ready: 60_000,
            ready_poll: 500,
            watchdog: 60_000,
            keep_alive: 5_000,
            call: 30_000,
            exit_grace: 10_000,
        }
    }
}

impl Timeouts {
    pub fn plugin_load(&self) -> Duration {
        Duration::from_millis(self.plugin_load)
    }

    pub fn plugin_poll(&self) -> Duration {
        Duration::from_millis(self.plugin_poll)
    }

    pub fn ready(&self) -> Duration {
        Duration::from_millis(self.ready)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive)
    }

    pub fn call(&self) -> Duration {
        Duration::from_millis(self.call)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("timeouts.plugin_poll", self.plugin_poll),
            ("timeouts.ready_poll", self.ready_poll),
            ("timeouts.keep_alive", self.keep_alive),
        ];
        for (key, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "interval must be greater than zero".to_string(),
                });
            }
        }
        if self.watchdog != 0 && self.keep_alive >= self.watchdog {
            return Err(ConfigError::InvalidValue {
                key: "timeouts.keep_alive".to_string(),
                reason: format!(
                    "keep-alive interval ({}ms) must be shorter than the watchdog timeout ({}ms)",
                    self.keep_alive, self.watchdog
                ),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match default_config_path() {
                Some(path) => Self::load_from(&path),
                None => Ok(Self::default()),
            },
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.timeouts.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Directory holding the channel and window sockets.
    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir.clone().unwrap_or_else(default_runtime_dir)
    }
}

/// `~/.config/hostdrive/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hostdrive").join("config.toml"))
}
