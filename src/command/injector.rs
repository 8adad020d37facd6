use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use tracing::trace;

use crate::error::{HostError, Result};
use crate::process::inspect::WindowHandle;

/// Delivers an opaque payload to a host window.
///
/// `send` is synchronous: it returns once the host has finished handling the
/// payload, which for some commands is only when the session ends.
pub trait CommandInjector: Send + Sync {
    fn send(&self, window: &WindowHandle, payload: &str) -> Result<()>;
}

/// Writes the payload to the window's inbox socket and waits for the host to
/// close the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketInjector;

impl CommandInjector for SocketInjector {
    fn send(&self, window: &WindowHandle, payload: &str) -> Result<()> {
        let mut stream = UnixStream::connect(window.path()).map_err(|e| {
            HostError::transport(format!(
                "failed to reach host window {}: {e}",
                window.path().display()
            ))
        })?;

        trace!(window = %window.path().display(), payload = payload.trim_end(), "Injecting command");
        stream
            .write_all(payload.as_bytes())
            .and_then(|_| stream.shutdown(Shutdown::Write))
            .map_err(|e| HostError::transport(format!("failed to send command: {e}")))?;

        // The host closes its end once the command has completed.
        let mut reply = Vec::new();
        stream
            .read_to_end(&mut reply)
            .map_err(|e| HostError::transport(format!("command was not acknowledged: {e}")))?;
        Ok(())
    }
}
