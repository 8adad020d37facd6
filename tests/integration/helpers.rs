//! Shared test helpers for session integration tests

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use hostdrive::config::Timeouts;
use hostdrive::driver::{DriverOptions, INTERPRETER_PROPERTY};

/// Test helper: Write a shell test script and return its path
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(format!("{name}.sh"));
    fs::write(&path, format!("{body}\n")).expect("Failed to write test script");
    path
}

/// Test helper: Driver options running every file through `sh`
pub fn shell_options() -> DriverOptions {
    let mut options = DriverOptions::default();
    options
        .properties
        .insert(INTERPRETER_PROPERTY.to_string(), "sh".to_string());
    options.test_timeout_ms = 10_000;
    options
}

/// Test helper: Timeouts short enough for tests
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        plugin_load: 10_000,
        plugin_poll: 50,
        ready: 10_000,
        ready_poll: 50,
        watchdog: 10_000,
        keep_alive: 500,
        call: 5_000,
        exit_grace: 5_000,
    }
}

/// Test helper: Poll `condition` for up to five seconds
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}
