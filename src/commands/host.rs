//! Host command - run the reference host application in the foreground.

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::channel::port::RUNTIME_DIR_ENV;
use crate::config::Config;
use crate::host::{HostApp, HostOptions};

/// Execute the host command.
///
/// The runtime directory comes from `--runtime-dir`, then from the
/// environment a supervisor sets for the hosts it starts, then from the
/// configuration.
pub fn execute(config: &Config, runtime_dir: Option<PathBuf>, exit_after_session: bool) -> Result<()> {
    let runtime_dir = runtime_dir
        .or_else(|| {
            std::env::var_os(RUNTIME_DIR_ENV)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| config.runtime_dir());

    let mut app = HostApp::new(HostOptions {
        runtime_dir,
        exit_after_session,
    });
    app.run().context("Host application failed")
}
