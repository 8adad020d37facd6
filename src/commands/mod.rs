//! Command implementations for the `hostdrive` binary.

pub mod config;
pub mod host;
pub mod ping;
pub mod run;

mod console;

pub use console::ConsoleSink;
