//! Supervision of the external host process.
//!
//! A [`HostSupervisor`] starts or adopts a host, bootstraps it through its UI
//! input channel until it serves a test driver over a channel pair, and hands
//! out a [`RemoteTestDriver`] for it. Dropping the supervisor shuts the
//! session down and, for a host it created, terminates the process.

mod bootstrap;
mod dispose;


use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::channel::{CallbackServer, ChannelPaths, PortName};
use crate::command::{CommandInjector, SocketInjector};
use crate::config::{Config, ConfigError, Timeouts};
use crate::error::Result;
use crate::process::discovery::{HostTarget, LaunchSpec};
use crate::process::inspect::{HostInspector, ProcInspector};
use crate::process::HostProcess;
use crate::remote::RemoteTestDriver;

/// What the supervisor needs besides the host itself.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Plugin module the host must load
    pub plugin_path: PathBuf,
    /// Directory for the channel sockets
    pub runtime_dir: PathBuf,
    pub timeouts: Timeouts,
}

impl SupervisorSettings {
    pub fn new(plugin_path: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_path: plugin_path.into(),
            runtime_dir: runtime_dir.into(),
            timeouts: Timeouts::default(),
        }
    }

    /// Settings from configuration; `plugin` overrides `[plugin] path`.
    pub fn from_config(config: &Config, plugin: Option<PathBuf>) -> Result<Self, ConfigError> {
        let plugin_path = plugin
            .or_else(|| config.plugin.path.clone())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "plugin.path".to_string(),
                reason: "no plugin module configured".to_string(),
            })?;
        Ok(Self {
            plugin_path,
            runtime_dir: config.runtime_dir(),
            timeouts: config.timeouts.clone(),
        })
    }
}

/// The OS-specific collaborators: how commands reach the host and how the
/// host is observed.
#[derive(Clone)]
pub struct Seams {
    pub injector: Arc<dyn CommandInjector>,
    pub inspector: Arc<dyn HostInspector>,
}

impl Seams {
    pub fn native(settings: &SupervisorSettings) -> Self {
        Self {
            injector: Arc::new(SocketInjector),
            inspector: Arc::new(ProcInspector::new(&settings.runtime_dir)),
        }
    }
}

/// Owns one host session from bootstrap to disposal.
pub struct HostSupervisor {
    process: HostProcess,
    settings: SupervisorSettings,
    port: PortName,
    paths: ChannelPaths,
    seams: Seams,
    callbacks: Option<Arc<CallbackServer>>,
    remote: Option<RemoteTestDriver>,
    disposed: bool,
}

impl HostSupervisor {
    /// Start a new host and bootstrap it. The supervisor owns its lifetime.
    pub fn create(spec: &LaunchSpec, settings: SupervisorSettings) -> Result<Self> {
        let seams = Seams::native(&settings);
        Self::launch(HostTarget::Create(spec.clone()), settings, seams)
    }

    /// Bootstrap a running host. It is never terminated by the supervisor.
    pub fn attach(pid: u32, settings: SupervisorSettings) -> Result<Self> {
        let seams = Seams::native(&settings);
        Self::launch(HostTarget::Attach { pid }, settings, seams)
    }

    /// Obtain the host and run the bootstrap sequence.
    ///
    /// On failure the partially started session is disposed before the
    /// error is returned.
    pub fn launch(target: HostTarget, settings: SupervisorSettings, seams: Seams) -> Result<Self> {
        let process = match &target {
            HostTarget::Create(spec) => HostProcess::spawn(spec, &settings.runtime_dir)?,
            HostTarget::Attach { pid } => HostProcess::attach(*pid)?,
        };

        let port = PortName::unique();
        let paths = ChannelPaths::resolve(&settings.runtime_dir, &port);
        let mut supervisor = Self {
            process,
            settings,
            port,
            paths,
            seams,
            callbacks: None,
            remote: None,
            disposed: false,
        };

        supervisor.bootstrap()?;
        info!(
            pid = supervisor.pid(),
            port = %supervisor.port,
            "Host bootstrapped"
        );
        Ok(supervisor)
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_attached(&self) -> bool {
        self.process.is_attached()
    }

    pub fn port(&self) -> &PortName {
        &self.port
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }
}

impl Drop for HostSupervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}
