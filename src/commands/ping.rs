//! Ping command - check that a host serves a test driver on a port.

use anyhow::{Context, Result};
use colored::Colorize;

use crate::channel::{ChannelPaths, PortName};
use crate::config::Config;
use crate::remote::RemoteTestDriver;

/// Execute the ping command, optionally ending the session afterwards.
pub fn execute(config: &Config, port: &str, shutdown: bool) -> Result<()> {
    let port = PortName::new(port).context("Invalid port name")?;
    let paths = ChannelPaths::resolve(&config.runtime_dir(), &port);

    // The callback leg belongs to the session's own client.
    let remote = RemoteTestDriver::connect_service(&paths, config.timeouts.call())
        .with_context(|| format!("No endpoint listening on port {port}"))?;
    remote
        .ping()
        .with_context(|| format!("Host on port {port} did not answer"))?;
    println!("{} Host on port {port} is serving", "✓".green().bold());

    if shutdown {
        remote.shutdown().context("Failed to end the session")?;
        println!("{} Session on port {port} ended", "✓".green().bold());
    }
    Ok(())
}
