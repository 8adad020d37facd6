//! Client side of a channel pair.

use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::endpoint::{bind_socket, SocketFile};
use super::protocol::{
    read_message, write_message, Call, CallbackFrame, Outcome, RequestFrame, ResponseFrame,
    CALLBACK_ACK,
};
use crate::driver::SharedSink;
use crate::error::{HostError, Result};

#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, mpsc::Sender<Outcome>>,
    disconnected: bool,
}

/// Connection to the service leg.
///
/// Any number of threads may have calls in flight at once; a reader thread
/// routes each response to its caller by request id.
pub struct ClientChannel {
    writer: Mutex<UnixStream>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ClientChannel {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).map_err(|e| {
            HostError::transport(format!(
                "failed to connect to service channel {}: {e}",
                path.display()
            ))
        })?;
        let mut reader_stream = stream.try_clone()?;
        let pending = Arc::new(Mutex::new(Pending::default()));

        let reader = {
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("channel-reader".to_string())
                .spawn(move || read_responses(&mut reader_stream, &pending))?
        };

        debug!(path = %path.display(), "Connected to service channel");
        Ok(Self {
            writer: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// Reserve a request id, e.g. to register a callback sink before calling.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.lock_pending().disconnected
    }

    /// Send `call` as request `id` and wait for its outcome.
    ///
    /// `None` waits as long as the connection stays open. After
    /// [`close`](Self::close) every call fails with [`HostError::Disposed`].
    pub fn call(&self, id: u64, call: Call, timeout: Option<Duration>) -> Result<Outcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HostError::Disposed);
        }
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = self.lock_pending();
            if pending.disconnected {
                return Err(HostError::transport("the service channel is closed"));
            }
            pending.waiters.insert(id, tx);
        }

        trace!(id, call = call.name(), "Sending request");
        let sent = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            write_message(&mut *writer, &RequestFrame { id, call })
        };
        if let Err(e) = sent {
            self.lock_pending().waiters.remove(&id);
            return Err(e);
        }

        let received = match timeout {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => {
                self.lock_pending().waiters.remove(&id);
                Err(HostError::CallTimeout(timeout.unwrap_or_default()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(HostError::transport(
                "the service channel closed before the call completed",
            )),
        }
    }

    /// Close the connection. Calls in flight fail with a transport error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writer.shutdown(Shutdown::Both);
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            let _ = reader.join();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_responses(stream: &mut UnixStream, pending: &Mutex<Pending>) {
    loop {
        match read_message::<ResponseFrame, _>(stream) {
            Ok(frame) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .waiters
                    .remove(&frame.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(frame.outcome);
                    }
                    None => debug!(id = frame.id, "Response for an abandoned request"),
                }
            }
            Err(e) => {
                debug!(error = %e, "Service channel reader stopped");
                break;
            }
        }
    }

    // Dropping the senders wakes every waiter with a disconnect.
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    pending.disconnected = true;
    pending.waiters.clear();
}

type Sinks = Arc<Mutex<HashMap<u64, SharedSink>>>;
type Connections = Arc<Mutex<HashMap<u64, UnixStream>>>;

/// Listener for the callback leg.
///
/// Events arriving for a registered request id go to that request's sink;
/// every frame is acknowledged once delivered.
pub struct CallbackServer {
    path: PathBuf,
    sinks: Sinks,
    connections: Connections,
    stop: Arc<AtomicBool>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackServer {
    pub fn bind(path: &Path) -> Result<Self> {
        let listener = bind_socket(path)?;
        let sinks: Sinks = Arc::new(Mutex::new(HashMap::new()));
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let accept = {
            let sinks = Arc::clone(&sinks);
            let connections = Arc::clone(&connections);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("callback-accept".to_string())
                .spawn(move || accept_callbacks(listener, sinks, connections, stop))?
        };

        debug!(path = %path.display(), "Callback channel listening");
        Ok(Self {
            path: path.to_path_buf(),
            sinks,
            connections,
            stop,
            accept: Mutex::new(Some(accept)),
        })
    }

    pub fn register(&self, request_id: u64, sink: SharedSink) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id, sink);
    }

    /// Callback connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn unregister(&self, request_id: u64) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&request_id);
    }

    /// Stop listening and remove the socket file. Safe to call repeatedly.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let accept = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(accept) = accept else {
            return;
        };
        let _ = accept.join();

        for (_, stream) in self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        drop(SocketFile(self.path.clone()));
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_callbacks(
    listener: UnixListener,
    sinks: Sinks,
    connections: Connections,
    stop: Arc<AtomicBool>,
) {
    let mut next_id = 0u64;
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(error = %e, "Failed to configure callback connection");
                    continue;
                }
                let id = next_id;
                next_id += 1;
                match stream.try_clone() {
                    Ok(handle) => {
                        connections
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(id, handle);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to clone callback connection");
                        continue;
                    }
                }
                let sinks = Arc::clone(&sinks);
                let connections = Arc::clone(&connections);
                thread::spawn(move || {
                    deliver_callbacks(stream, sinks);
                    connections
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => {
                warn!(error = %e, "Callback accept error");
                break;
            }
        }
    }
}

fn deliver_callbacks(mut stream: UnixStream, sinks: Sinks) {
    loop {
        let frame: CallbackFrame = match read_message(&mut stream) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "Callback connection closed");
                return;
            }
        };

        let sink = sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame.request_id)
            .cloned();
        match sink {
            Some(sink) => sink.publish(frame.event),
            None => debug!(request_id = frame.request_id, "Event for an unknown request"),
        }

        if let Err(e) = stream.write_all(&[CALLBACK_ACK]) {
            debug!(error = %e, "Failed to acknowledge callback");
            return;
        }
    }
}
