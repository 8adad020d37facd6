pub mod channel;
pub mod command;
pub mod commands;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod host;
pub mod logging;
pub mod process;
pub mod remote;
pub mod supervisor;
pub mod watchdog;

pub use error::{HostError, Result};
