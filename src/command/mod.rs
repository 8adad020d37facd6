//! Bootstrap commands injected through the host's UI input channel.
//!
//! A command is one line of the host's scripting syntax:
//! `(command "_NAME" "arg1" "arg2")\n`. The leading underscore keeps the host
//! from echoing the command interactively.

mod injector;
pub mod literal;

pub use injector::{CommandInjector, SocketInjector};

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::channel::PortName;
use crate::error::{HostError, Result};

/// Loads the plugin module whose path is the single argument.
pub const LOAD_MODULE: &str = "LOADMODULE";

/// Opens the channel endpoint and blocks the host thread serving it.
/// Arguments: port name, watchdog timeout in milliseconds.
pub const CREATE_ENDPOINT: &str = "CREATEENDPOINTANDWAIT";

/// Asks the host application to exit.
pub const QUIT: &str = "QUIT";

const PREFIX: &str = "(command";

/// A named command with positional string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    name: String,
    arguments: Vec<String>,
}

impl CommandMessage {
    pub fn new(name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    pub fn load_module(path: &Path) -> Self {
        Self::new(LOAD_MODULE, vec![path.display().to_string()])
    }

    pub fn create_endpoint(port: &PortName, watchdog: Duration) -> Self {
        Self::new(
            CREATE_ENDPOINT,
            vec![port.to_string(), watchdog.as_millis().to_string()],
        )
    }

    pub fn quit() -> Self {
        Self::new(QUIT, Vec::new())
    }

    /// Global command name, without the echo-suppressing underscore.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Render the command in the host's scripting syntax.
    pub fn to_expression(&self) -> String {
        let mut expression = format!("{PREFIX} {}", literal::quote(&format!("_{}", self.name)));
        for argument in &self.arguments {
            expression.push(' ');
            expression.push_str(&literal::quote(argument));
        }
        expression.push_str(")\n");
        expression
    }

    /// Parse an expression produced by [`to_expression`](Self::to_expression).
    pub fn parse(expression: &str) -> Result<Self> {
        let malformed =
            |reason: &str| HostError::Protocol(format!("malformed command ({reason}): {expression:?}"));

        let mut rest = expression
            .trim_end()
            .strip_prefix(PREFIX)
            .ok_or_else(|| malformed("missing '(command'"))?;

        let mut literals = Vec::new();
        loop {
            let trimmed = rest.trim_start();
            if trimmed.len() == rest.len() && !literals.is_empty() && !trimmed.starts_with(')') {
                return Err(malformed("arguments must be separated by whitespace"));
            }
            rest = trimmed;
            if let Some(tail) = rest.strip_prefix(')') {
                if !tail.is_empty() {
                    return Err(malformed("trailing text after ')'"));
                }
                break;
            }
            if rest.is_empty() {
                return Err(malformed("missing ')'"));
            }
            let (value, tail) = literal::unquote(rest)?;
            literals.push(value);
            rest = tail;
        }

        let mut literals = literals.into_iter();
        let name = literals.next().ok_or_else(|| malformed("missing command name"))?;
        let name = name.strip_prefix('_').unwrap_or(&name).to_string();
        if name.is_empty() {
            return Err(malformed("empty command name"));
        }

        Ok(Self {
            name,
            arguments: literals.collect(),
        })
    }
}

impl fmt::Display for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for argument in &self.arguments {
            write!(f, " {argument:?}")?;
        }
        Ok(())
    }
}
