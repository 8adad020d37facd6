use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::driver::{DriverOptions, ExploreReport, RunOptions, RunReport, TestEvent, TestPackage};
use crate::error::{HostError, Result};

/// Sanity bound on a frame's length prefix (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Byte the client writes back for every callback frame it delivered.
pub const CALLBACK_ACK: u8 = 0x06;

/// Calls exposed by the host-side driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Call {
    Initialize { options: DriverOptions },
    Explore { package: TestPackage },
    Run { package: TestPackage, options: RunOptions },
    Ping,
    Shutdown,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Initialize { .. } => "initialize",
            Call::Explore { .. } => "explore",
            Call::Run { .. } => "run",
            Call::Ping => "ping",
            Call::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub call: Call,
}

/// Category of a failed call, so the client can rebuild the matching error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The inner driver failed
    Driver,
    /// The session is not in a state that accepts the call
    InvalidOperation,
    /// The call was queued but the session shut down before it ran
    Interrupted,
    /// The inner driver panicked
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Done,
    Explored(ExploreReport),
    Ran(RunReport),
    Pong,
    Fault { kind: FaultKind, message: String },
}

impl Outcome {
    /// Describe a host-side error for the wire.
    pub fn fault(error: &HostError) -> Self {
        let kind = match error {
            HostError::InvalidOperation(_) | HostError::Disposed => FaultKind::InvalidOperation,
            HostError::Interrupted => FaultKind::Interrupted,
            _ => FaultKind::Driver,
        };
        let message = match error {
            HostError::Driver(message) | HostError::InvalidOperation(message) => message.clone(),
            other => other.to_string(),
        };
        Outcome::Fault { kind, message }
    }

    /// Rebuild the client-side error for a fault.
    pub fn into_error(kind: FaultKind, message: String) -> HostError {
        match kind {
            FaultKind::InvalidOperation => HostError::InvalidOperation(message),
            FaultKind::Interrupted => HostError::Interrupted,
            FaultKind::Driver => HostError::Remote(message),
            FaultKind::Panicked => HostError::Remote(format!("driver panicked: {message}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub outcome: Outcome,
}

/// An event raised while serving request `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackFrame {
    pub request_id: u64,
    pub event: TestEvent,
}

/// Write a length-prefixed JSON message to a stream.
///
/// Format: 4-byte big-endian length prefix + JSON data
pub fn write_message<T: Serialize, W: Write>(stream: &mut W, message: &T) -> Result<()> {
    let json = serde_json::to_vec(message)
        .map_err(|e| HostError::Protocol(format!("failed to serialize message: {e}")))?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(HostError::Protocol(format!(
            "message too large: {} bytes",
            json.len()
        )));
    }
    let len_bytes = (json.len() as u32).to_be_bytes();

    stream
        .write_all(&len_bytes)
        .and_then(|_| stream.write_all(&json))
        .and_then(|_| stream.flush())
        .map_err(|e| HostError::transport(format!("failed to write message: {e}")))
}

/// Read a length-prefixed JSON message from a stream.
pub fn read_message<T: for<'de> Deserialize<'de>, R: Read>(stream: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .map_err(|e| HostError::transport(format!("failed to read message length: {e}")))?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    // Prevent a bogus length claim from allocating unbounded memory
    if len > MAX_MESSAGE_SIZE {
        return Err(HostError::Protocol(format!("message too large: {len} bytes")));
    }

    let mut json_bytes = vec![0u8; len];
    stream
        .read_exact(&mut json_bytes)
        .map_err(|e| HostError::transport(format!("failed to read message body: {e}")))?;

    serde_json::from_slice(&json_bytes)
        .map_err(|e| HostError::Protocol(format!("failed to deserialize message: {e}")))
}
