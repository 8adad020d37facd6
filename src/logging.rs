//! Logging setup for the `hostdrive` binary.
//!
//! Library code only emits `tracing` events; the binary decides where they go.
//! Output goes to stderr so a host's stdout stays free for its own use.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `verbosity` selects the default level:
/// 0 → info, 1 → debug, 2+ → trace.
pub fn init_logging(verbosity: u8) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity))),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
