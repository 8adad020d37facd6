//! Config command - show the effective configuration.

use anyhow::Result;
use colored::Colorize;

use crate::config::{default_config_path, Config};

/// Print the effective configuration as TOML.
pub fn show(config: &Config) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

/// Print where the configuration file is read from.
pub fn path() -> Result<()> {
    match default_config_path() {
        Some(path) => {
            let state = if path.exists() {
                "exists".green()
            } else {
                "not created".dimmed()
            };
            println!("{} ({state})", path.display());
        }
        None => println!("{}", "No configuration directory on this platform".dimmed()),
    }
    Ok(())
}
