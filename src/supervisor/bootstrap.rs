use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::HostSupervisor;
use crate::channel::{CallbackServer, ClientChannel};
use crate::command::CommandMessage;
use crate::error::{HostError, Result};
use crate::process::inspect::WindowHandle;
use crate::remote::RemoteTestDriver;

impl HostSupervisor {
    /// Load the plugin, start the endpoint, and open the local callback leg.
    pub(super) fn bootstrap(&mut self) -> Result<()> {
        self.load_plugin()?;
        self.create_endpoint()?;

        let callbacks = CallbackServer::bind(&self.paths.callback)?;
        self.callbacks = Some(Arc::new(callbacks));
        Ok(())
    }

    /// Inject the load command until the plugin shows up among the host's
    /// modules. A host that already has it loaded gets no command at all.
    fn load_plugin(&mut self) -> Result<()> {
        let plugin = self.settings.plugin_path.clone();
        let timeout = self.settings.timeouts.plugin_load();
        let poll = self.settings.timeouts.plugin_poll();
        let expression = CommandMessage::load_module(&plugin).to_expression();
        let deadline = Instant::now() + timeout;

        loop {
            self.process.ensure_running()?;
            if self.seams.inspector.has_module(self.pid(), &plugin)? {
                info!(plugin = %plugin.display(), "Plugin loaded");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HostError::PluginLoadTimeout(plugin));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let window = self.wait_for_input_ready(remaining)?;
            debug!(plugin = %plugin.display(), "Sending load command");
            if let Err(e) = self.seams.injector.send(&window, &expression) {
                debug!(error = %e, "Load command not delivered; retrying");
            }
            thread::sleep(poll);
        }
    }

    /// Send the create-endpoint command from a detached thread.
    ///
    /// The command does not complete until the session ends, so nobody waits
    /// for it; readiness is established by pinging instead.
    fn create_endpoint(&mut self) -> Result<()> {
        let window = self.wait_for_input_ready(self.settings.timeouts.ready())?;
        let expression =
            CommandMessage::create_endpoint(&self.port, self.settings.timeouts.watchdog())
                .to_expression();
        let injector = Arc::clone(&self.seams.injector);
        let port = self.port.clone();

        thread::Builder::new()
            .name("create-endpoint".to_string())
            .spawn(move || match injector.send(&window, &expression) {
                Ok(()) => debug!(%port, "Host finished serving the endpoint"),
                Err(e) => warn!(%port, error = %e, "Create-endpoint command failed"),
            })?;
        Ok(())
    }

    /// Wait until the host has a main window and is idle, failing early if
    /// it exits. Polls at the readiness interval.
    fn wait_for_input_ready(&mut self, timeout: Duration) -> Result<WindowHandle> {
        let poll = self.settings.timeouts.ready_poll();
        let pid = self.pid();
        let deadline = Instant::now() + timeout;
        let mut window_seen = false;

        loop {
            self.process.ensure_running()?;
            if let Some(window) = self.seams.inspector.main_window(pid) {
                window_seen = true;
                if self.seams.inspector.is_input_idle(pid) {
                    return Ok(window);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(if window_seen {
                    HostError::IdleTimeout(timeout)
                } else {
                    HostError::WindowTimeout(timeout)
                });
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    /// A driver proxy for the host, once the host answers a ping.
    ///
    /// Pings every readiness interval until one succeeds or the readiness
    /// timeout passes. The host exiting in between fails immediately.
    pub fn remote_driver(&mut self) -> Result<RemoteTestDriver> {
        if self.disposed {
            return Err(HostError::Disposed);
        }
        if let Some(remote) = &self.remote {
            if remote.is_connected() {
                return Ok(remote.clone());
            }
        }
        self.remote = None;

        let callbacks = self
            .callbacks
            .clone()
            .ok_or_else(|| HostError::invalid_operation("host was not bootstrapped"))?;
        let timeout = self.settings.timeouts.ready();
        let poll = self.settings.timeouts.ready_poll();
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;

        loop {
            self.process.ensure_running()?;
            attempts += 1;
            match self.ping_once(&callbacks) {
                Ok(remote) => {
                    info!(attempts, "Remote driver is ready");
                    self.remote = Some(remote.clone());
                    return Ok(remote);
                }
                Err(e) => debug!(attempts, error = %e, "Remote driver not ready"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(HostError::ReadyTimeout(timeout));
            }
            thread::sleep(poll.min(deadline - now));
        }
    }

    fn ping_once(&self, callbacks: &Arc<CallbackServer>) -> Result<RemoteTestDriver> {
        let channel = ClientChannel::connect(&self.paths.service)?;
        let remote = RemoteTestDriver::new(
            Arc::new(channel),
            Arc::clone(callbacks),
            self.settings.timeouts.call(),
        );
        remote.ping()?;
        Ok(remote)
    }
}
