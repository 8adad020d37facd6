//! End-to-end supervision of the `hostdrive` binary running as a host

use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::TempDir;

use hostdrive::command::{CommandInjector, CommandMessage, SocketInjector};
use hostdrive::driver::{CollectingSink, RunOptions, TestDriver, TestPackage};
use hostdrive::process::discovery::LaunchSpec;
use hostdrive::process::inspect::{window_path, WindowHandle};
use hostdrive::process::is_process_alive;
use hostdrive::supervisor::{HostSupervisor, SupervisorSettings};
use hostdrive::HostError;

use super::helpers::{fast_timeouts, shell_options, wait_until, write_script};

const HOST_EXE: &str = env!("CARGO_BIN_EXE_hostdrive");

fn host_arguments(temp_dir: &Path, exit_after_session: bool) -> Vec<String> {
    let mut arguments = vec![
        "--config".to_string(),
        temp_dir.join("no-config.toml").display().to_string(),
        "host".to_string(),
    ];
    if exit_after_session {
        arguments.push("--exit-after-session".to_string());
    }
    arguments
}

fn settings(temp_dir: &TempDir) -> SupervisorSettings {
    let plugin = temp_dir.path().join("testing-plugin.so");
    fs::write(&plugin, b"plugin image").expect("Failed to write plugin");
    SupervisorSettings {
        plugin_path: plugin,
        runtime_dir: temp_dir.path().join("run"),
        timeouts: fast_timeouts(),
    }
}

fn launch_spec(temp_dir: &TempDir) -> LaunchSpec {
    LaunchSpec {
        executable: PathBuf::from(HOST_EXE),
        arguments: host_arguments(temp_dir.path(), true),
        working_directory: None,
    }
}

/// Created host: bootstrap, run tests, and let the host exit with the session.
#[test]
#[serial]
fn test_created_host_runs_tests_and_exits() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let test = write_script(temp_dir.path(), "smoke", "test -n \"$HOSTDRIVE_RUNTIME_DIR\"");

    let mut supervisor =
        HostSupervisor::create(&launch_spec(&temp_dir), settings(&temp_dir)).expect("bootstrap");
    let pid = supervisor.pid();
    assert!(!supervisor.is_attached());

    let mut remote = supervisor.remote_driver().expect("remote driver");
    remote.initialize(&shell_options()).expect("initialize");
    let report = remote
        .run(
            &TestPackage::new(vec![test]),
            &RunOptions::default(),
            Arc::new(CollectingSink::default()),
        )
        .expect("run");
    assert!(report.is_success(), "{:?}", report.results);

    drop(supervisor);
    assert!(!is_process_alive(pid));
}

/// Attached host: the session ends but the host keeps running.
#[test]
#[serial]
fn test_attached_host_keeps_running() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let settings = settings(&temp_dir);
    let mut host = Command::new(HOST_EXE)
        .args(host_arguments(temp_dir.path(), false))
        .arg("--runtime-dir")
        .arg(&settings.runtime_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start host");
    let window = WindowHandle::new(window_path(&settings.runtime_dir, host.id()));
    assert!(wait_until(|| window.path().exists()));

    let mut supervisor = HostSupervisor::attach(host.id(), settings).expect("bootstrap");
    assert!(supervisor.is_attached());
    let mut remote = supervisor.remote_driver().expect("remote driver");
    remote.initialize(&shell_options()).expect("initialize");
    drop(supervisor);

    assert!(is_process_alive(host.id()));
    // Still responsive to commands once the session is over.
    SocketInjector
        .send(&window, &CommandMessage::quit().to_expression())
        .expect("send quit");
    let status = host.wait().expect("wait for host");
    assert!(status.success());
}

/// A plugin the host cannot load times out instead of hanging.
#[test]
#[serial]
fn test_unloadable_plugin_times_out() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let mut settings = settings(&temp_dir);
    fs::write(&settings.plugin_path, b"").expect("Failed to empty plugin");
    settings.timeouts.plugin_load = 1_500;
    settings.timeouts.exit_grace = 200;

    let result = HostSupervisor::create(&launch_spec(&temp_dir), settings.clone());
    assert!(matches!(
        result,
        Err(HostError::PluginLoadTimeout(path)) if path == settings.plugin_path
    ));
}
