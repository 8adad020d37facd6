//! Error types shared by every layer of the crate.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::process::discovery::DiscoveryError;

/// Result alias used throughout the library.
pub type Result<T, E = HostError> = std::result::Result<T, E>;

/// Errors raised while supervising a host or talking to its test driver.
#[derive(Debug, Error)]
pub enum HostError {
    /// The plugin module never showed up in the host's loaded modules.
    #[error("Timeout waiting for the host to load plugin module: {}", .0.display())]
    PluginLoadTimeout(PathBuf),

    /// The host never created its main window.
    #[error("Timeout after {0:?} waiting for the host to create its main window")]
    WindowTimeout(Duration),

    /// The host created a window but never became idle.
    #[error("Timeout after {0:?} waiting for the host to enter an idle state")]
    IdleTimeout(Duration),

    /// The remote test driver never answered a ping.
    #[error("Remote test driver did not respond within {0:?}")]
    ReadyTimeout(Duration),

    /// A single remote call did not complete in time.
    #[error("Remote call did not complete within {0:?}")]
    CallTimeout(Duration),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Queued work was discarded because the executor shut down first.
    #[error("Work item was interrupted before it could run")]
    Interrupted,

    /// The remote inner driver reported a fault.
    #[error("Remote test driver failed: {0}")]
    Remote(String),

    /// A local inner driver reported a fault.
    #[error("Test driver failed: {0}")]
    Driver(String),

    /// The peer is unreachable or the connection was closed.
    #[error("Channel transport failure: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("The host process terminated abruptly")]
    ProcessExited,

    #[error("The resource has already been disposed")]
    Disposed,

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether this error means the remote side is already gone.
    ///
    /// [`HostError::Disposed`] is not: it is the caller using a handle it
    /// closed itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
