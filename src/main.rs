use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use hostdrive::commands::{config, host, ping, run};
use hostdrive::config::Config;
use hostdrive::logging::init_logging;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hostdrive")]
#[command(about = "Drive test suites inside single-threaded host applications", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/hostdrive/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run (or only explore) test files inside a host application
    Run {
        /// Test files to run
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Attach to the running host instead of starting one
        #[arg(long, conflicts_with = "no_attach")]
        attach: bool,

        /// Never attach, even if configured to
        #[arg(long)]
        no_attach: bool,

        /// Host executable to start
        #[arg(long)]
        host_exe: Option<PathBuf>,

        /// Plugin module the host must load (overrides the configuration)
        #[arg(long)]
        plugin: Option<PathBuf>,

        /// Only run tests whose name contains this text
        #[arg(long)]
        filter: Option<String>,

        /// List the tests without running them
        #[arg(long)]
        explore_only: bool,

        /// Driver property as KEY=VALUE (repeatable), e.g. interpreter=sh
        #[arg(short = 'D', long = "property", value_parser = run::parse_property)]
        properties: Vec<(String, String)>,

        /// Per-test timeout in milliseconds
        #[arg(long)]
        test_timeout: Option<u64>,
    },

    /// Run the reference host application
    Host {
        /// Directory for the window and channel sockets
        #[arg(long)]
        runtime_dir: Option<PathBuf>,

        /// Exit once the first test session has ended
        #[arg(long)]
        exit_after_session: bool,
    },

    /// Check that a host serves a test driver on a port
    Ping {
        /// Port name printed by `hostdrive run`
        #[arg(long)]
        port: String,

        /// End the session after a successful ping
        #[arg(long)]
        shutdown: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the configuration file location
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Run {
            files,
            attach,
            no_attach,
            host_exe,
            plugin,
            filter,
            explore_only,
            properties,
            test_timeout,
        } => {
            let attach = match (attach, no_attach) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            run::execute(
                &config,
                run::RunArgs {
                    files,
                    attach,
                    host_exe,
                    plugin,
                    filter,
                    explore_only,
                    properties,
                    test_timeout_ms: test_timeout,
                    verbose: cli.verbose > 0,
                },
            )
        }
        Commands::Host {
            runtime_dir,
            exit_after_session,
        } => host::execute(&config, runtime_dir, exit_after_session),
        Commands::Ping { port, shutdown } => ping::execute(&config, &port, shutdown),
        Commands::Config { command } => match command {
            ConfigCommands::Show => config::show(&config),
            ConfigCommands::Path => config::path(),
        },
    }
}
