//! Reference host application.
//!
//! A single-threaded program with a command inbox standing in for its main
//! window. Commands arrive one per connection and run on the main thread in
//! arrival order; closing the connection acknowledges a command. While an
//! endpoint is being served the main thread is blocked, which is exactly the
//! thread-affinity constraint remote test sessions are built around.

mod module;

pub use module::MappedModule;

use std::io::Read;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::channel::endpoint::{bind_socket, SocketFile};
use crate::channel::{Endpoint, PortName};
use crate::command::{CommandMessage, CREATE_ENDPOINT, LOAD_MODULE, QUIT};
use crate::driver::ProcessTestDriver;
use crate::error::{HostError, Result};
use crate::process::inspect::window_path;
use crate::remote::HostedDriver;

/// Commands larger than this are rejected unread.
const MAX_COMMAND_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub runtime_dir: PathBuf,
    /// Exit once the first endpoint session has ended
    pub exit_after_session: bool,
}

enum Flow {
    Continue,
    Exit,
}

pub struct HostApp {
    options: HostOptions,
    modules: Vec<MappedModule>,
}

impl HostApp {
    pub fn new(options: HostOptions) -> Self {
        Self {
            options,
            modules: Vec::new(),
        }
    }

    /// The inbox this process listens on.
    pub fn window(&self) -> PathBuf {
        window_path(&self.options.runtime_dir, std::process::id())
    }

    pub fn modules(&self) -> &[MappedModule] {
        &self.modules
    }

    /// Run the command loop until told to quit.
    pub fn run(&mut self) -> Result<()> {
        let path = self.window();
        let listener = bind_socket(&path)?;
        listener.set_nonblocking(false)?;
        let _window = SocketFile(path.clone());
        info!(window = %path.display(), "Host ready for commands");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to accept command connection");
                    continue;
                }
            };
            // The connection stays open until the command completes.
            if let Flow::Exit = self.handle(stream) {
                break;
            }
        }

        info!("Host exiting");
        Ok(())
    }

    fn handle(&mut self, mut stream: UnixStream) -> Flow {
        let mut payload = String::new();
        if let Err(e) = (&mut stream)
            .take(MAX_COMMAND_SIZE)
            .read_to_string(&mut payload)
        {
            warn!(error = %e, "Failed to read command");
            return Flow::Continue;
        }

        let message = match CommandMessage::parse(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed command");
                return Flow::Continue;
            }
        };

        debug!(command = %message, "Executing command");
        match self.execute(&message) {
            Ok(flow) => flow,
            Err(e) => {
                warn!(command = message.name(), error = %e, "Command failed");
                Flow::Continue
            }
        }
    }

    fn execute(&mut self, message: &CommandMessage) -> Result<Flow> {
        match message.name() {
            LOAD_MODULE => {
                let path = argument(message, 0)?;
                self.load_module(Path::new(path))?;
                Ok(Flow::Continue)
            }
            CREATE_ENDPOINT => {
                let port = PortName::new(argument(message, 0)?)?;
                let watchdog = argument(message, 1)?.parse::<u64>().map_err(|e| {
                    HostError::Protocol(format!("invalid watchdog timeout: {e}"))
                })?;
                self.serve_endpoint(port, Duration::from_millis(watchdog))?;
                if self.options.exit_after_session {
                    return Ok(Flow::Exit);
                }
                Ok(Flow::Continue)
            }
            QUIT => Ok(Flow::Exit),
            other => Err(HostError::invalid_operation(format!(
                "unknown command: {other}"
            ))),
        }
    }

    fn load_module(&mut self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize()?;
        if self.modules.iter().any(|module| module.path() == canonical) {
            debug!(module = %canonical.display(), "Module already loaded");
            return Ok(());
        }
        let module = MappedModule::open(&canonical)?;
        info!(module = %module.path().display(), "Loaded module");
        self.modules.push(module);
        Ok(())
    }

    /// Serve one test-driver session on this thread.
    fn serve_endpoint(&mut self, port: PortName, watchdog: Duration) -> Result<()> {
        if self.modules.is_empty() {
            return Err(HostError::invalid_operation(
                "no plugin module is loaded; cannot create an endpoint",
            ));
        }
        let driver = HostedDriver::new(Box::new(ProcessTestDriver::new()), watchdog)?;
        Endpoint::new(&self.options.runtime_dir, port, driver).serve()
    }
}

fn argument(message: &CommandMessage, index: usize) -> Result<&str> {
    message
        .arguments()
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| {
            HostError::Protocol(format!(
                "{} expects at least {} argument(s)",
                message.name(),
                index + 1
            ))
        })
}
