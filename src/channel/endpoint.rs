//! Host side of a channel pair.

use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::port::{ChannelPaths, PortName};
use super::protocol::{
    read_message, write_message, Call, CallbackFrame, FaultKind, Outcome, RequestFrame,
    ResponseFrame, CALLBACK_ACK,
};
use crate::driver::{EventSink, SharedSink, TestEvent};
use crate::error::{HostError, Result};
use crate::executor::panic_message;
use crate::remote::HostedDriver;

/// Maximum number of concurrent client connections allowed.
const MAX_CONNECTIONS: usize = 16;

/// How long the client may take to acknowledge a callback frame.
const CALLBACK_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Publishes a [`HostedDriver`] on the service leg of a channel pair and
/// sends its events back over the callback leg.
pub struct Endpoint {
    port: PortName,
    paths: ChannelPaths,
    driver: Arc<HostedDriver>,
}

impl Endpoint {
    pub fn new(runtime_dir: &Path, port: PortName, driver: Arc<HostedDriver>) -> Self {
        let paths = ChannelPaths::resolve(runtime_dir, &port);
        Self {
            port,
            paths,
            driver,
        }
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// Listen for calls and serve them until the session shuts down.
    ///
    /// Blocks the calling thread, which becomes the driver's session thread.
    /// The socket file is removed before returning.
    pub fn serve(&self) -> Result<()> {
        let listener = bind_socket(&self.paths.service)?;
        let _socket = SocketFile(self.paths.service.clone());

        let stop = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Connections::default());
        let callbacks = Arc::new(CallbackClient::new(self.paths.callback.clone()));

        let accept = {
            let stop = Arc::clone(&stop);
            let connections = Arc::clone(&connections);
            let driver = Arc::clone(&self.driver);
            thread::Builder::new()
                .name("endpoint-accept".to_string())
                .spawn(move || accept_loop(listener, driver, callbacks, stop, connections))?
        };

        info!(port = %self.port, "Endpoint listening");
        let result = self.driver.wait_for_shutdown();

        stop.store(true, Ordering::Relaxed);
        let _ = accept.join();
        connections.close_all();

        info!(port = %self.port, "Endpoint closed");
        result
    }
}

/// Bind a listener with owner-only permissions, replacing a stale socket file.
///
/// A socket that still accepts connections belongs to someone else and is
/// left alone.
pub(crate) fn bind_socket(path: &Path) -> Result<UnixListener> {
    if UnixStream::connect(path).is_ok() {
        return Err(HostError::transport(format!(
            "{} is already in use by a live listener",
            path.display()
        )));
    }
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)
        .map_err(|e| HostError::transport(format!("failed to bind {}: {e}", path.display())))?;
    fs::set_permissions(path, Permissions::from_mode(0o600))?;

    // Non-blocking so the accept loop can notice shutdown
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Removes a socket file when dropped.
pub(crate) struct SocketFile(pub(crate) PathBuf);

impl Drop for SocketFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

/// Open client connections, so they can be closed when the session ends.
#[derive(Default)]
struct Connections {
    open: Mutex<HashMap<u64, UnixStream>>,
    next_id: AtomicU64,
}

impl Connections {
    fn register(&self, stream: &UnixStream) -> Option<u64> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if open.len() >= MAX_CONNECTIONS {
            warn!("Connection limit reached ({MAX_CONNECTIONS}), rejecting");
            return None;
        }
        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Failed to clone accepted connection");
                return None;
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        open.insert(id, handle);
        Some(id)
    }

    fn release(&self, id: u64) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn close_all(&self) {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, stream) in open.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn accept_loop(
    listener: UnixListener,
    driver: Arc<HostedDriver>,
    callbacks: Arc<CallbackClient>,
    stop: Arc<AtomicBool>,
    connections: Arc<Connections>,
) {
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                // Accepted sockets may inherit non-blocking mode from the listener.
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(error = %e, "Failed to configure accepted connection");
                    continue;
                }
                let Some(id) = connections.register(&stream) else {
                    continue;
                };

                debug!(connection = id, "Client connected");
                let driver = Arc::clone(&driver);
                let callbacks = Arc::clone(&callbacks);
                let connections = Arc::clone(&connections);
                thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, driver, callbacks) {
                        debug!(connection = id, error = %e, "Connection handler stopped");
                    }
                    connections.release(id);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Read requests until the client goes away.
///
/// Ping and shutdown are answered right here so they are never queued
/// behind a running test; every other call gets its own worker thread.
fn handle_connection(
    stream: UnixStream,
    driver: Arc<HostedDriver>,
    callbacks: Arc<CallbackClient>,
) -> Result<()> {
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut reader = stream;

    loop {
        let frame: RequestFrame = match read_message(&mut reader) {
            Ok(frame) => frame,
            Err(HostError::Transport(_)) => {
                debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        trace!(id = frame.id, call = frame.call.name(), "Request received");

        match frame.call {
            Call::Ping => {
                let outcome = match driver.ping() {
                    Ok(()) => Outcome::Pong,
                    Err(e) => Outcome::fault(&e),
                };
                respond(&writer, frame.id, outcome);
            }
            Call::Shutdown => {
                respond(&writer, frame.id, Outcome::Done);
                driver.shutdown();
            }
            call => {
                let driver = Arc::clone(&driver);
                let writer = Arc::clone(&writer);
                let sink: SharedSink = Arc::new(RemoteSink {
                    request_id: frame.id,
                    client: Arc::clone(&callbacks),
                });
                thread::spawn(move || {
                    let outcome = serve_call(&driver, call, sink);
                    respond(&writer, frame.id, outcome);
                });
            }
        }
    }
}

fn serve_call(driver: &HostedDriver, call: Call, sink: SharedSink) -> Outcome {
    let name = call.name();
    let result = panic::catch_unwind(AssertUnwindSafe(|| match call {
        Call::Initialize { options } => driver.initialize(options).map(|_| Outcome::Done),
        Call::Explore { package } => driver.explore(package, sink).map(Outcome::Explored),
        Call::Run { package, options } => driver.run(package, options, sink).map(Outcome::Ran),
        Call::Ping => driver.ping().map(|_| Outcome::Pong),
        Call::Shutdown => {
            driver.shutdown();
            Ok(Outcome::Done)
        }
    }));

    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            debug!(call = name, error = %e, "Call failed");
            Outcome::fault(&e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!(call = name, panic = %message, "Driver panicked");
            Outcome::Fault {
                kind: FaultKind::Panicked,
                message,
            }
        }
    }
}

fn respond(writer: &Mutex<UnixStream>, id: u64, outcome: Outcome) {
    let mut stream = writer.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = write_message(&mut *stream, &ResponseFrame { id, outcome }) {
        debug!(id, error = %e, "Failed to deliver response");
    }
}

/// Host end of the callback leg. Connects on first use.
pub(crate) struct CallbackClient {
    path: PathBuf,
    stream: Mutex<Option<UnixStream>>,
}

impl CallbackClient {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            stream: Mutex::new(None),
        }
    }

    /// Deliver one event and wait for the client's acknowledgement.
    pub(crate) fn send(&self, request_id: u64, event: TestEvent) -> Result<()> {
        let mut slot = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stream = match slot.take() {
            Some(stream) => stream,
            None => self.connect()?,
        };

        write_message(&mut stream, &CallbackFrame { request_id, event })?;
        let mut ack = [0u8; 1];
        stream
            .read_exact(&mut ack)
            .map_err(|e| HostError::transport(format!("callback not acknowledged: {e}")))?;
        if ack[0] != CALLBACK_ACK {
            return Err(HostError::Protocol(format!(
                "unexpected callback acknowledgement: {:#04x}",
                ack[0]
            )));
        }

        *slot = Some(stream);
        Ok(())
    }

    fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.path).map_err(|e| {
            HostError::transport(format!(
                "failed to connect callback channel {}: {e}",
                self.path.display()
            ))
        })?;
        stream.set_read_timeout(Some(CALLBACK_ACK_TIMEOUT))?;
        Ok(stream)
    }
}

/// Sink handed to the inner driver for one request.
struct RemoteSink {
    request_id: u64,
    client: Arc<CallbackClient>,
}

impl EventSink for RemoteSink {
    fn publish(&self, event: TestEvent) {
        if let Err(e) = self.client.send(self.request_id, event) {
            warn!(request_id = self.request_id, error = %e, "Dropped callback event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{
        DriverOptions, ExploreReport, RunOptions, RunReport, TestDriver, TestPackage,
    };
    use std::io::Write;
    use tempfile::TempDir;

    struct PanickingDriver;

    impl TestDriver for PanickingDriver {
        fn initialize(&mut self, _options: &DriverOptions) -> Result<()> {
            Ok(())
        }

        fn explore(&mut self, _package: &TestPackage, _sink: SharedSink) -> Result<ExploreReport> {
            panic!("explore blew up")
        }

        fn run(
            &mut self,
            _package: &TestPackage,
            _options: &RunOptions,
            _sink: SharedSink,
        ) -> Result<RunReport> {
            Err(HostError::Driver("no tests".to_string()))
        }
    }

    #[test]
    fn test_bind_socket_replaces_stale_file_with_private_socket() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("stale.sock");
        fs::write(&path, b"stale").expect("Failed to write stale file");

        let _listener = bind_socket(&path).expect("bind");
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(SocketFile(path.clone()));
        assert!(!path.exists());
    }

    #[test]
    fn test_bind_socket_leaves_live_listener_alone() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("live.sock");
        let _owner = bind_socket(&path).expect("bind");

        let second = bind_socket(&path);
        assert!(matches!(second, Err(HostError::Transport(_))));
        assert!(path.exists());
        UnixStream::connect(&path).expect("owner still reachable");
    }

    #[test]
    fn test_serve_call_turns_panics_and_errors_into_faults() {
        let driver = HostedDriver::new(Box::new(PanickingDriver), Duration::ZERO).expect("driver");
        let serving = Arc::clone(&driver);
        let handle = thread::spawn(move || serving.wait_for_shutdown());
        while driver.ping().is_err() {
            thread::sleep(Duration::from_millis(5));
        }

        let sink: SharedSink = Arc::new(crate::driver::NullSink);
        let explored = serve_call(
            &driver,
            Call::Explore {
                package: TestPackage::default(),
            },
            Arc::clone(&sink),
        );
        assert!(matches!(
            explored,
            Outcome::Fault { kind: FaultKind::Panicked, ref message } if message == "explore blew up"
        ));

        let ran = serve_call(
            &driver,
            Call::Run {
                package: TestPackage::default(),
                options: RunOptions::default(),
            },
            sink,
        );
        assert!(matches!(ran, Outcome::Fault { kind: FaultKind::Driver, .. }));

        driver.shutdown();
        handle.join().expect("serving thread panicked").expect("serve");
    }

    #[test]
    fn test_callback_client_waits_for_ack() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("cb.sock");
        let listener = UnixListener::bind(&path).expect("bind");

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut frames = Vec::new();
            for _ in 0..2 {
                let frame: CallbackFrame = read_message(&mut stream).expect("frame");
                frames.push(frame);
                stream.write_all(&[CALLBACK_ACK]).expect("ack");
            }
            frames
        });

        let client = CallbackClient::new(path);
        for message in ["first", "second"] {
            client
                .send(
                    9,
                    TestEvent::Log {
                        message: message.to_string(),
                    },
                )
                .expect("send");
        }

        let frames = server.join().expect("server panicked");
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|frame| frame.request_id == 9));
    }

    #[test]
    fn test_callback_client_without_listener_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let client = CallbackClient::new(temp_dir.path().join("missing.sock"));
        let result = client.send(
            1,
            TestEvent::Log {
                message: "lost".to_string(),
            },
        );
        assert!(matches!(result, Err(HostError::Transport(_))));
    }
}
