//! A driver that treats every package file as an executable test.

use chrono::Utc;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use wait_timeout::ChildExt;

use super::{
    DriverOptions, ExploreReport, RunOptions, RunReport, SharedSink, TestCase, TestDriver,
    TestEvent, TestOutcome, TestPackage, TestResult,
};
use crate::error::{HostError, Result};

/// Property naming a program that runs each test file, e.g. `sh`.
pub const INTERPRETER_PROPERTY: &str = "interpreter";

/// Timeout for collecting output from child process pipes
const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum captured output per test (1MB)
const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Runs each file of a package as a child process; exit status 0 passes.
///
/// Properties other than [`INTERPRETER_PROPERTY`] are exported to every
/// test as environment variables.
#[derive(Debug, Default)]
pub struct ProcessTestDriver {
    options: Option<DriverOptions>,
}

impl ProcessTestDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(&self) -> Result<&DriverOptions> {
        self.options
            .as_ref()
            .ok_or_else(|| HostError::Driver("the driver has not been initialized".to_string()))
    }

    fn discover(&self, package: &TestPackage) -> Result<Vec<TestCase>> {
        self.options()?;
        package
            .files
            .iter()
            .map(|file| {
                if !file.is_file() {
                    return Err(HostError::Driver(format!(
                        "test file not found: {}",
                        file.display()
                    )));
                }
                let name = file
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.display().to_string());
                Ok(TestCase {
                    id: file.display().to_string(),
                    name,
                })
            })
            .collect()
    }

    fn run_test(&self, test: &TestCase, package: &TestPackage) -> Result<TestResult> {
        let options = self.options()?;
        let timeout = Duration::from_millis(options.test_timeout_ms);
        let start = Instant::now();

        let mut child = self.spawn(test, package, options)?;

        // Drain the pipes while waiting so a chatty test cannot fill them and block.
        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let status = child.wait_timeout(timeout)?;
        let timed_out = status.is_none();
        if timed_out {
            kill_child_process(&mut child);
        }
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut output = collect(stdout_rx);
        let stderr = collect(stderr_rx);
        if !stderr.is_empty() {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&stderr);
        }

        let outcome = match status {
            None => {
                output.push_str(&format!(
                    "\n[test killed after {}ms timeout]",
                    options.test_timeout_ms
                ));
                TestOutcome::TimedOut
            }
            Some(status) if status.success() => TestOutcome::Passed,
            Some(status) => {
                if let Some(code) = status.code() {
                    output.push_str(&format!("\n[exit code {code}]"));
                }
                TestOutcome::Failed
            }
        };

        debug!(test = %test.name, ?outcome, duration_ms, "Test finished");
        Ok(TestResult {
            test: test.clone(),
            outcome,
            duration_ms,
            output,
        })
    }

    fn spawn(&self, test: &TestCase, package: &TestPackage, options: &DriverOptions) -> Result<Child> {
        let file = Path::new(&test.id);
        let mut cmd = match options.properties.get(INTERPRETER_PROPERTY) {
            Some(interpreter) => {
                let mut c = Command::new(interpreter);
                c.arg(file);
                c
            }
            None => Command::new(file),
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in &options.properties {
            if key != INTERPRETER_PROPERTY {
                cmd.env(key, value);
            }
        }

        match (&package.working_directory, file.parent()) {
            (Some(dir), _) => {
                cmd.current_dir(dir);
            }
            (None, Some(parent)) if !parent.as_os_str().is_empty() => {
                cmd.current_dir(parent);
            }
            _ => {}
        }

        cmd.spawn().map_err(|e| {
            HostError::Driver(format!("failed to start test {}: {e}", file.display()))
        })
    }
}

impl TestDriver for ProcessTestDriver {
    fn initialize(&mut self, options: &DriverOptions) -> Result<()> {
        if options.test_timeout_ms == 0 {
            return Err(HostError::Driver(
                "test timeout must be greater than zero".to_string(),
            ));
        }
        self.options = Some(options.clone());
        Ok(())
    }

    fn explore(&mut self, package: &TestPackage, sink: SharedSink) -> Result<ExploreReport> {
        let tests = self.discover(package)?;
        sink.publish(TestEvent::Log {
            message: format!("Discovered {} test(s)", tests.len()),
        });
        Ok(ExploreReport { tests })
    }

    fn run(
        &mut self,
        package: &TestPackage,
        options: &RunOptions,
        sink: SharedSink,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        let selected: Vec<TestCase> = self
            .discover(package)?
            .into_iter()
            .filter(|test| options.selects(test))
            .collect();

        info!(count = selected.len(), "Running tests");
        let mut results = Vec::with_capacity(selected.len());
        for test in &selected {
            sink.publish(TestEvent::TestStarted { test: test.clone() });
            let result = self.run_test(test, package)?;
            sink.publish(TestEvent::TestFinished {
                result: result.clone(),
            });
            results.push(result);
        }

        Ok(RunReport {
            results,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stream {
        Some(stream) => {
            thread::spawn(move || {
                let _ = tx.send(read_stream_to_string(stream));
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

fn collect(rx: mpsc::Receiver<String>) -> String {
    rx.recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_else(|_| "[output collection timed out]".to_string())
}

/// Read a stream to string, keeping at most [`MAX_OUTPUT_SIZE`] bytes.
fn read_stream_to_string<R: Read>(mut stream: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = MAX_OUTPUT_SIZE.saturating_sub(buf.len());
                let to_copy = n.min(remaining);
                buf.extend_from_slice(&chunk[..to_copy]);
                // Keep reading past the limit so the child never sees a broken pipe.
                truncated |= to_copy < n;
            }
            Err(_) => break,
        }
    }

    if truncated {
        buf.extend_from_slice(b"\n[output truncated]");
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn kill_child_process(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::CollectingSink;
    use std::fs;
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(format!("{name}.sh"));
        fs::write(&path, body).expect("Failed to write test script");
        path
    }

    fn shell_driver(timeout_ms: u64) -> ProcessTestDriver {
        let mut driver = ProcessTestDriver::new();
        let mut options = DriverOptions {
            test_timeout_ms: timeout_ms,
            ..DriverOptions::default()
        };
        options
            .properties
            .insert(INTERPRETER_PROPERTY.to_string(), "sh".to_string());
        options
            .properties
            .insert("HOSTDRIVE_GREETING".to_string(), "hello".to_string());
        driver.initialize(&options).expect("initialize");
        driver
    }

    #[test]
    fn test_explore_requires_initialize() {
        let mut driver = ProcessTestDriver::new();
        let result = driver.explore(&TestPackage::default(), Arc::new(CollectingSink::default()));
        assert!(matches!(result, Err(HostError::Driver(_))));
    }

    #[test]
    fn test_explore_lists_one_test_per_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let first = script(&dir, "first", "exit 0\n");
        let second = script(&dir, "second", "exit 0\n");
        let mut driver = shell_driver(5_000);
        let sink = Arc::new(CollectingSink::default());

        let report = driver
            .explore(&TestPackage::new(vec![first, second]), sink.clone())
            .expect("explore");

        let names: Vec<_> = report.tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_explore_missing_file_fails() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut driver = shell_driver(5_000);
        let result = driver.explore(
            &TestPackage::new(vec![dir.path().join("absent.sh")]),
            Arc::new(CollectingSink::default()),
        );
        assert!(matches!(result, Err(HostError::Driver(msg)) if msg.contains("absent.sh")));
    }

    #[test]
    fn test_run_reports_outcomes_and_events() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let pass = script(&dir, "pass", "echo \"$HOSTDRIVE_GREETING\"\nexit 0\n");
        let fail = script(&dir, "fail", "echo broken >&2\nexit 3\n");
        let mut driver = shell_driver(5_000);
        let sink = Arc::new(CollectingSink::default());

        let report = driver
            .run(
                &TestPackage::new(vec![pass, fail]),
                &RunOptions::default(),
                sink.clone(),
            )
            .expect("run");

        assert_eq!(report.passed(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.finished_at >= report.started_at);
        assert!(report.results[0].output.contains("hello"));
        assert!(report.results[1].output.contains("broken"));
        assert!(report.results[1].output.contains("[exit code 3]"));

        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], TestEvent::TestStarted { test } if test.name == "pass"));
        assert!(matches!(&events[3], TestEvent::TestFinished { result } if result.test.name == "fail"));
    }

    #[test]
    fn test_run_applies_filter() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let smoke = script(&dir, "smoke_boot", "exit 0\n");
        let slow = script(&dir, "slow_regression", "exit 1\n");
        let mut driver = shell_driver(5_000);

        let report = driver
            .run(
                &TestPackage::new(vec![smoke, slow]),
                &RunOptions {
                    filter: Some("smoke".to_string()),
                },
                Arc::new(CollectingSink::default()),
            )
            .expect("run");

        assert_eq!(report.results.len(), 1);
        assert!(report.is_success());
    }

    #[test]
    fn test_run_kills_test_after_timeout() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let hang = script(&dir, "hang", "exec sleep 30\n");
        let mut driver = shell_driver(200);

        let started = Instant::now();
        let report = driver
            .run(
                &TestPackage::new(vec![hang]),
                &RunOptions::default(),
                Arc::new(CollectingSink::default()),
            )
            .expect("run");

        assert_eq!(report.results[0].outcome, TestOutcome::TimedOut);
        assert!(report.results[0].output.contains("timeout"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut driver = ProcessTestDriver::new();
        let options = DriverOptions {
            test_timeout_ms: 0,
            ..DriverOptions::default()
        };
        assert!(driver.initialize(&options).is_err());
    }

    #[test]
    fn test_read_stream_truncates_at_limit() {
        let data = vec![b'x'; MAX_OUTPUT_SIZE + 1000];
        let result = read_stream_to_string(Cursor::new(data));
        assert!(result.ends_with("[output truncated]"));
        assert!(result.len() <= MAX_OUTPUT_SIZE + 50);
    }
}
