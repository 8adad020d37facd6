//! Channel naming and socket locations.

use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{HostError, Result};

/// Fixed service identifier every port name starts with.
pub const SERVICE_NAME: &str = "hostdrive";

/// Appended to the base name to name the callback leg.
pub const CALLBACK_SUFFIX: &str = ".Callback";

/// Environment variable overriding the runtime directory.
pub const RUNTIME_DIR_ENV: &str = "HOSTDRIVE_RUNTIME_DIR";

const MAX_PORT_NAME_LEN: usize = 64;

/// Shared base name of a channel pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortName(String);

impl PortName {
    /// `hostdrive.<uuid>`, unique per call.
    pub fn unique() -> Self {
        Self(format!("{SERVICE_NAME}.{}", Uuid::new_v4().simple()))
    }

    /// Validate a port name received from the outside.
    ///
    /// Names become file names, so only ASCII alphanumerics, `.`, `-` and `_`
    /// are accepted.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_PORT_NAME_LEN {
            return Err(HostError::Protocol(format!(
                "port name must be 1 to {MAX_PORT_NAME_LEN} characters: {name:?}"
            )));
        }
        if name.starts_with('.')
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(HostError::Protocol(format!("invalid port name: {name:?}")));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the callback leg.
    pub fn callback(&self) -> String {
        format!("{}{CALLBACK_SUFFIX}", self.0)
    }
}

impl fmt::Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Socket files of a channel pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    /// Inbound service leg; the host listens
    pub service: PathBuf,
    /// Outbound callback leg; the client listens
    pub callback: PathBuf,
}

impl ChannelPaths {
    pub fn resolve(runtime_dir: &Path, port: &PortName) -> Self {
        Self {
            service: runtime_dir.join(format!("{port}.sock")),
            callback: runtime_dir.join(format!("{}.sock", port.callback())),
        }
    }
}

/// `$HOSTDRIVE_RUNTIME_DIR`, else the user runtime dir, else the temp dir.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os(RUNTIME_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(std::env::temp_dir)
}
