use tracing::{debug, info, warn};

use super::HostSupervisor;
use crate::error::Result;
use crate::remote::RemoteTestDriver;

impl HostSupervisor {
    /// End the session and release the host.
    ///
    /// Asks the remote driver to shut down and closes both channel legs. A
    /// created host that accepted the shutdown gets the exit grace period
    /// before it is killed; one that never heard it is killed at once. An
    /// attached host is left running. Safe to call more than once.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        debug!(pid = self.pid(), "Disposing host supervisor");

        let shut_down = match self.shutdown_remote() {
            Ok(()) => {
                debug!("Remote driver shut down");
                true
            }
            Err(e) if e.is_transport() => {
                debug!(error = %e, "Remote driver already gone");
                false
            }
            Err(e) => {
                warn!(error = %e, "Graceful shutdown of the remote driver failed");
                false
            }
        };

        if let Some(remote) = self.remote.take() {
            remote.close();
        }
        if let Some(callbacks) = self.callbacks.take() {
            callbacks.close();
        }

        if self.process.is_attached() {
            info!(pid = self.pid(), "Leaving attached host running");
            return;
        }
        if self.process.has_exited() {
            return;
        }
        // A host that never received the shutdown will not exit on its own.
        if shut_down {
            let grace = self.settings.timeouts.exit_grace();
            if self.process.wait_for_exit(grace) {
                return;
            }
            debug!(pid = self.pid(), ?grace, "Host did not exit in time");
        }
        self.process.kill();
    }

    /// Shut down through the current driver, or a fresh service connection
    /// when none is open.
    fn shutdown_remote(&self) -> Result<()> {
        if let Some(remote) = self.remote.as_ref().filter(|remote| remote.is_connected()) {
            return remote.shutdown();
        }
        RemoteTestDriver::connect_service(&self.paths, self.settings.timeouts.call())?.shutdown()
    }
}
