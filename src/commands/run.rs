//! Run command - explore or run a test package inside a host application.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::console::{print_summary, ConsoleSink};
use crate::config::Config;
use crate::driver::{DriverOptions, RunOptions, TestDriver, TestPackage, DEFAULT_TEST_TIMEOUT_MS};
use crate::process::discovery::{resolve_target, HostTarget, ProcFinder, StartupRequest};
use crate::remote::KeepAlive;
use crate::supervisor::{HostSupervisor, Seams, SupervisorSettings};

/// Arguments of `hostdrive run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub files: Vec<PathBuf>,
    /// `Some(true)` for `--attach`, `Some(false)` for `--no-attach`
    pub attach: Option<bool>,
    pub host_exe: Option<PathBuf>,
    pub plugin: Option<PathBuf>,
    pub filter: Option<String>,
    pub explore_only: bool,
    pub properties: Vec<(String, String)>,
    pub test_timeout_ms: Option<u64>,
    pub verbose: bool,
}

/// Execute the run command.
/// Usage: hostdrive run [--attach|--no-attach] [--host-exe <path>] [--plugin <path>] FILES...
pub fn execute(config: &Config, args: RunArgs) -> Result<()> {
    if args.files.is_empty() {
        bail!("No test files given");
    }
    let files = args
        .files
        .iter()
        .map(|file| {
            file.canonicalize()
                .with_context(|| format!("Test file not found: {}", file.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let request = StartupRequest {
        attach: args.attach,
        executable: args.host_exe.clone(),
    };
    let target = resolve_target(&request, &config.host, &ProcFinder)
        .context("Failed to choose a host process")?;
    let settings = SupervisorSettings::from_config(config, args.plugin.clone())?;
    let plugin = settings
        .plugin_path
        .canonicalize()
        .with_context(|| format!("Plugin module not found: {}", settings.plugin_path.display()))?;
    let settings = SupervisorSettings {
        plugin_path: plugin,
        ..settings
    };

    match &target {
        HostTarget::Attach { pid } => {
            println!("{} Attaching to host (pid {pid})...", "→".cyan().bold())
        }
        HostTarget::Create(spec) => println!(
            "{} Starting host {}...",
            "→".cyan().bold(),
            spec.executable.display()
        ),
    }

    let seams = Seams::native(&settings);
    let keep_alive_interval = settings.timeouts.keep_alive();
    let mut supervisor =
        HostSupervisor::launch(target, settings, seams).context("Failed to bootstrap the host")?;
    let mut remote = supervisor
        .remote_driver()
        .context("Host did not start its test driver")?;
    println!(
        "{} Host ready (pid {}, port {})",
        "✓".green().bold(),
        supervisor.pid(),
        supervisor.port()
    );

    let mut keep_alive = KeepAlive::for_driver(&remote, keep_alive_interval)?;
    {
        let remote = remote.clone();
        let handler = ctrlc::set_handler(move || {
            eprintln!("{} Interrupted, ending the host session", "!".yellow().bold());
            if let Err(e) = remote.shutdown() {
                debug!(error = %e, "Shutdown after interrupt failed");
            }
        });
        if let Err(e) = handler {
            warn!(error = %e, "Failed to install the Ctrl+C handler");
        }
    }

    remote
        .initialize(&DriverOptions {
            properties: args.properties.iter().cloned().collect::<BTreeMap<_, _>>(),
            test_timeout_ms: args.test_timeout_ms.unwrap_or(DEFAULT_TEST_TIMEOUT_MS),
        })
        .context("Failed to initialize the remote test driver")?;

    let package = TestPackage::new(files);
    let sink = Arc::new(ConsoleSink {
        verbose: args.verbose,
    });

    let outcome = if args.explore_only {
        remote
            .explore(&package, sink)
            .context("Exploration failed")
            .map(|report| {
                println!();
                println!("{} {} test(s) found", "✓".green().bold(), report.tests.len());
                for test in &report.tests {
                    println!("  {}", test.name);
                }
                true
            })
    } else {
        let options = RunOptions {
            filter: args.filter.clone(),
        };
        remote
            .run(&package, &options, sink)
            .context("Test run failed")
            .map(|report| {
                print_summary(&report);
                report.is_success()
            })
    };

    keep_alive.stop();
    drop(supervisor);

    if !outcome? {
        bail!("Some tests failed");
    }
    Ok(())
}

/// Parse `KEY=VALUE` from the command line.
pub fn parse_property(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty property name in '{raw}'"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}
