//! Remote sessions between a client proxy and an in-process endpoint

use serial_test::serial;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use hostdrive::channel::{ChannelPaths, Endpoint, PortName};
use hostdrive::commands::ping;
use hostdrive::config::Config;
use hostdrive::driver::{
    CollectingSink, ProcessTestDriver, RunOptions, TestDriver, TestEvent, TestOutcome, TestPackage,
};
use hostdrive::remote::{HostedDriver, KeepAlive, RemoteTestDriver, SessionState};
use hostdrive::HostError;

use super::helpers::{shell_options, wait_until, write_script};

struct Session {
    port: PortName,
    paths: ChannelPaths,
    hosted: Arc<HostedDriver>,
    serving: JoinHandle<hostdrive::Result<()>>,
}

fn serve(runtime_dir: &Path, watchdog: Duration) -> Session {
    let port = PortName::unique();
    let hosted =
        HostedDriver::new(Box::new(ProcessTestDriver::new()), watchdog).expect("hosted driver");
    let endpoint = Endpoint::new(runtime_dir, port.clone(), Arc::clone(&hosted));
    let paths = endpoint.paths().clone();
    let serving = thread::spawn(move || endpoint.serve());
    Session {
        port,
        paths,
        hosted,
        serving,
    }
}

fn connect(paths: &ChannelPaths) -> RemoteTestDriver {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(remote) = RemoteTestDriver::connect(paths, Duration::from_secs(5)) {
            if remote.ping().is_ok() {
                return remote;
            }
        }
        assert!(Instant::now() < deadline, "endpoint never became ready");
        thread::sleep(Duration::from_millis(20));
    }
}

/// A full session: initialize, explore, run with progress callbacks, shut down.
#[test]
#[serial]
fn test_session_runs_tests_and_reports_progress() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let pass = write_script(temp_dir.path(), "passes", "echo hello");
    let fail = write_script(temp_dir.path(), "fails", "echo broken >&2; exit 4");
    let session = serve(&temp_dir.path().join("run"), Duration::from_secs(10));
    let mut remote = connect(&session.paths);

    remote.initialize(&shell_options()).expect("initialize");
    let package = TestPackage::new(vec![pass, fail]);

    let explored = remote
        .explore(&package, Arc::new(CollectingSink::default()))
        .expect("explore");
    let names: Vec<_> = explored.tests.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["passes", "fails"]);

    let sink = Arc::new(CollectingSink::default());
    let report = remote
        .run(&package, &RunOptions::default(), sink.clone())
        .expect("run");
    assert_eq!(report.passed(), 1);
    assert_eq!(report.failed(), 1);
    assert!(report.results[0].output.contains("hello"));
    assert!(report.results[1].output.contains("broken"));

    // Every progress event is delivered before the run call returns.
    let finished: Vec<_> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TestEvent::TestFinished { result } => Some(result.outcome),
            _ => None,
        })
        .collect();
    assert_eq!(finished, [TestOutcome::Passed, TestOutcome::Failed]);

    let filtered = remote
        .run(
            &package,
            &RunOptions {
                filter: Some("pass".to_string()),
            },
            sink,
        )
        .expect("filtered run");
    assert_eq!(filtered.results.len(), 1);

    remote.shutdown().expect("shutdown");
    session
        .serving
        .join()
        .expect("serve panicked")
        .expect("serve");
    assert_eq!(session.hosted.state(), SessionState::Shutdown);
    assert!(!session.paths.service.exists());
}

/// Pings are answered while the session thread is busy with a long run.
#[test]
#[serial]
fn test_ping_answered_during_long_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let slow = write_script(temp_dir.path(), "slow", "sleep 1");
    let session = serve(&temp_dir.path().join("run"), Duration::from_secs(10));
    let mut remote = connect(&session.paths);
    remote.initialize(&shell_options()).expect("initialize");

    let running = {
        let mut remote = remote.clone();
        thread::spawn(move || {
            remote.run(
                &TestPackage::new(vec![slow]),
                &RunOptions::default(),
                Arc::new(CollectingSink::default()),
            )
        })
    };

    thread::sleep(Duration::from_millis(200));
    let started = Instant::now();
    for _ in 0..3 {
        remote.ping().expect("ping during run");
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(!running.is_finished());

    let report = running.join().expect("run panicked").expect("run");
    assert!(report.is_success());
    remote.shutdown().expect("shutdown");
    session.serving.join().expect("serve panicked").expect("serve");
}

/// Without pings the host-side watchdog ends the session; a keep-alive
/// prevents that.
#[test]
#[serial]
fn test_watchdog_and_keep_alive() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let runtime_dir = temp_dir.path().join("run");

    let kept = serve(&runtime_dir, Duration::from_millis(600));
    let remote = connect(&kept.paths);
    let mut keep_alive = KeepAlive::for_driver(&remote, Duration::from_millis(100)).expect("start");
    thread::sleep(Duration::from_millis(1_500));
    assert_eq!(kept.hosted.state(), SessionState::Running);
    assert!(keep_alive.is_running());

    keep_alive.stop();
    assert!(wait_until(|| kept.hosted.state() == SessionState::Shutdown));
    kept.serving.join().expect("serve panicked").expect("serve");
    assert!(matches!(remote.ping(), Err(e) if e.is_transport()));
}

/// A client that goes away without shutting down leaves the session running
/// until its watchdog fires.
#[test]
#[serial]
fn test_abandoned_session_is_reclaimed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let session = serve(&temp_dir.path().join("run"), Duration::from_millis(300));

    let remote = connect(&session.paths);
    drop(remote);
    assert!(wait_until(|| session.hosted.state() == SessionState::Shutdown));
    session.serving.join().expect("serve panicked").expect("serve");

    assert!(matches!(
        RemoteTestDriver::connect(&session.paths, Duration::from_secs(1)),
        Err(HostError::Transport(_))
    ));
}

/// Pinging a live session from another client leaves its callback leg
/// intact, so progress keeps reaching the session's own client.
#[test]
#[serial]
fn test_second_client_keeps_session_callbacks() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let runtime_dir = temp_dir.path().join("run");
    let test = write_script(temp_dir.path(), "smoke", "true");
    let session = serve(&runtime_dir, Duration::from_secs(10));
    let mut remote = connect(&session.paths);
    remote.initialize(&shell_options()).expect("initialize");

    let config = Config {
        runtime_dir: Some(runtime_dir.clone()),
        ..Config::default()
    };
    ping::execute(&config, session.port.as_str(), false).expect("ping command");
    // Nor may another full client take the callback socket over.
    assert!(matches!(
        RemoteTestDriver::connect(&session.paths, Duration::from_secs(1)),
        Err(HostError::Transport(_))
    ));
    assert!(session.paths.callback.exists());

    let sink = Arc::new(CollectingSink::default());
    remote
        .explore(&TestPackage::new(vec![test]), sink.clone())
        .expect("explore");
    assert!(!sink.events().is_empty());

    remote.shutdown().expect("shutdown");
    session.serving.join().expect("serve panicked").expect("serve");
}

/// A closed proxy reports misuse, not a vanished peer, on every clone.
#[test]
#[serial]
fn test_calls_after_close_report_disposed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let session = serve(&temp_dir.path().join("run"), Duration::from_secs(10));
    let remote = connect(&session.paths);
    let clone = remote.clone();

    remote.shutdown().expect("shutdown");
    remote.close();
    assert!(!clone.is_connected());
    assert!(matches!(clone.ping(), Err(HostError::Disposed)));
    assert!(matches!(remote.shutdown(), Err(HostError::Disposed)));
    session.serving.join().expect("serve panicked").expect("serve");
}
