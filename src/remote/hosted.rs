//! Host-side session wrapper around an inner test driver.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::driver::{
    DriverOptions, ExploreReport, RunOptions, RunReport, SharedSink, TestDriver, TestPackage,
};
use crate::error::{HostError, Result};
use crate::executor::{AffineExecutor, ExecutorState};
use crate::watchdog::Watchdog;

const STARTING: u8 = 0;
const RUNNING: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Lifecycle of a [`HostedDriver`] session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    /// A thread is parked in [`HostedDriver::wait_for_shutdown`]
    Running,
    Shutdown,
}

type SharedDriver = Arc<Mutex<Box<dyn TestDriver>>>;

/// Funnels every driver operation onto the one thread that called
/// [`wait_for_shutdown`](Self::wait_for_shutdown), and shuts the session down
/// when pings stop arriving.
///
/// [`ping`](Self::ping) never touches that thread, so a long run cannot starve
/// liveness reporting.
pub struct HostedDriver {
    state: AtomicU8,
    executor: AffineExecutor,
    inner: SharedDriver,
    watchdog: Watchdog,
    last_ping: Mutex<Option<DateTime<Utc>>>,
}

impl HostedDriver {
    /// Wrap `inner` and arm the watchdog. A zero `ping_timeout` disables it.
    pub fn new(inner: Box<dyn TestDriver>, ping_timeout: Duration) -> Result<Arc<Self>> {
        let driver = Arc::new_cyclic(|session: &Weak<Self>| {
            let session = session.clone();
            Self {
                state: AtomicU8::new(STARTING),
                executor: AffineExecutor::new(),
                inner: Arc::new(Mutex::new(inner)),
                watchdog: Watchdog::new(ping_timeout, move || {
                    if let Some(driver) = session.upgrade() {
                        info!("No ping received in time, shutting the session down");
                        driver.shutdown();
                    }
                }),
                last_ping: Mutex::new(None),
            }
        });
        driver.watchdog.start()?;
        Ok(driver)
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STARTING => SessionState::Starting,
            RUNNING => SessionState::Running,
            _ => SessionState::Shutdown,
        }
    }

    /// When the last ping arrived.
    pub fn last_ping(&self) -> Option<DateTime<Utc>> {
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve driver calls on the calling thread until the session shuts down.
    ///
    /// Only one thread may ever do this; a second caller fails while the
    /// first is serving, and any caller returns at once after shutdown.
    pub fn wait_for_shutdown(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(STARTING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RUNNING) => {
                return Err(HostError::invalid_operation(
                    "the session is already being served by another thread",
                ))
            }
            Err(_) => return Ok(()),
        }

        info!("Session running");
        let result = self.executor.run();
        self.shutdown();
        info!("Session ended");
        result
    }

    pub fn initialize(&self, options: DriverOptions) -> Result<()> {
        self.with_inner(move |driver| driver.initialize(&options))
    }

    pub fn explore(&self, package: TestPackage, sink: SharedSink) -> Result<ExploreReport> {
        self.with_inner(move |driver| driver.explore(&package, sink))
    }

    pub fn run(
        &self,
        package: TestPackage,
        options: RunOptions,
        sink: SharedSink,
    ) -> Result<RunReport> {
        self.with_inner(move |driver| driver.run(&package, &options, sink))
    }

    /// Reset the watchdog.
    ///
    /// Fails with [`HostError::InvalidOperation`] unless the session is
    /// serving calls, so readiness checks keep retrying until then.
    pub fn ping(&self) -> Result<()> {
        self.watchdog.reset();
        *self.last_ping.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());

        match self.executor.state() {
            ExecutorState::Processing => Ok(()),
            ExecutorState::Starting => Err(HostError::invalid_operation(
                "the session is not serving calls yet",
            )),
            ExecutorState::Shutdown => Err(HostError::invalid_operation(
                "the session has shut down",
            )),
        }
    }

    /// End the session. Idempotent.
    pub fn shutdown(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == SHUTDOWN {
                return;
            }
            match self.state.compare_exchange(
                current,
                SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        debug!("Session shutdown requested");
        self.watchdog.stop();
        self.executor.shutdown();
    }

    fn with_inner<F, R>(&self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut dyn TestDriver) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.executor.invoke(move || {
            let mut driver = inner.lock().unwrap_or_else(PoisonError::into_inner);
            operation(driver.as_mut())
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{NullSink, TestCase, TestEvent};
    use std::sync::mpsc;
    use std::thread::{self, ThreadId};
    use std::time::Instant;

    /// Records the thread of every call; `run` blocks until released.
    struct RecordingDriver {
        threads: mpsc::Sender<ThreadId>,
        release: Option<mpsc::Receiver<()>>,
    }

    impl TestDriver for RecordingDriver {
        fn initialize(&mut self, _options: &DriverOptions) -> Result<()> {
            let _ = self.threads.send(thread::current().id());
            Ok(())
        }

        fn explore(&mut self, _package: &TestPackage, sink: SharedSink) -> Result<ExploreReport> {
            let _ = self.threads.send(thread::current().id());
            sink.publish(TestEvent::Log {
                message: "exploring".to_string(),
            });
            Ok(ExploreReport {
                tests: vec![TestCase {
                    id: "t".to_string(),
                    name: "t".to_string(),
                }],
            })
        }

        fn run(
            &mut self,
            _package: &TestPackage,
            _options: &RunOptions,
            _sink: SharedSink,
        ) -> Result<RunReport> {
            let _ = self.threads.send(thread::current().id());
            if let Some(release) = &self.release {
                let _ = release.recv_timeout(Duration::from_secs(10));
            }
            let now = Utc::now();
            Ok(RunReport {
                results: Vec::new(),
                started_at: now,
                finished_at: now,
            })
        }
    }

    fn recording(
        timeout: Duration,
    ) -> (Arc<HostedDriver>, mpsc::Receiver<ThreadId>, mpsc::Sender<()>) {
        let (threads_tx, threads_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let driver = HostedDriver::new(
            Box::new(RecordingDriver {
                threads: threads_tx,
                release: Some(release_rx),
            }),
            timeout,
        )
        .expect("create driver");
        (driver, threads_rx, release_tx)
    }

    fn serve(driver: &Arc<HostedDriver>) -> thread::JoinHandle<Result<()>> {
        let serving = Arc::clone(driver);
        let handle = thread::spawn(move || serving.wait_for_shutdown());
        let deadline = Instant::now() + Duration::from_secs(5);
        while driver.ping().is_err() {
            assert!(Instant::now() < deadline, "session never started serving");
            thread::sleep(Duration::from_millis(5));
        }
        handle
    }

    #[test]
    fn test_calls_run_on_the_serving_thread() {
        let (driver, threads, _release) = recording(Duration::ZERO);
        let handle = serve(&driver);
        let serving_thread = handle.thread().id();

        driver
            .initialize(DriverOptions::default())
            .expect("initialize");
        let report = driver
            .explore(TestPackage::default(), Arc::new(NullSink))
            .expect("explore");
        assert_eq!(report.tests.len(), 1);

        assert_eq!(threads.recv().expect("initialize thread"), serving_thread);
        assert_eq!(threads.recv().expect("explore thread"), serving_thread);

        driver.shutdown();
        handle.join().expect("serving thread panicked").expect("serve");
        assert_eq!(driver.state(), SessionState::Shutdown);
    }

    #[test]
    fn test_ping_answers_while_run_is_busy() {
        let (driver, threads, release) = recording(Duration::from_millis(400));
        let handle = serve(&driver);

        let running = Arc::clone(&driver);
        let run = thread::spawn(move || {
            running.run(TestPackage::default(), RunOptions::default(), Arc::new(NullSink))
        });
        threads
            .recv_timeout(Duration::from_secs(5))
            .expect("run should start");

        // Keep pinging well past the watchdog timeout while the run is blocked.
        for _ in 0..8 {
            let before = driver.last_ping();
            driver.ping().expect("ping during run");
            assert!(driver.last_ping() > before || before.is_none());
            thread::sleep(Duration::from_millis(100));
        }
        assert_eq!(driver.state(), SessionState::Running);

        release.send(()).expect("release run");
        run.join().expect("run thread panicked").expect("run");

        driver.shutdown();
        handle.join().expect("serving thread panicked").expect("serve");
    }

    #[test]
    fn test_missed_pings_shut_the_session_down() {
        let (driver, _threads, _release) = recording(Duration::from_millis(150));
        let handle = serve(&driver);

        handle.join().expect("serving thread panicked").expect("serve");
        assert_eq!(driver.state(), SessionState::Shutdown);
        assert!(matches!(
            driver.initialize(DriverOptions::default()),
            Err(HostError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_second_server_fails_and_late_server_returns() {
        let (driver, _threads, _release) = recording(Duration::ZERO);
        let handle = serve(&driver);

        let result = driver.wait_for_shutdown();
        assert!(matches!(result, Err(HostError::InvalidOperation(_))));

        driver.shutdown();
        driver.shutdown();
        handle.join().expect("serving thread panicked").expect("serve");

        driver.wait_for_shutdown().expect("returns at once after shutdown");
    }

    #[test]
    fn test_shutdown_before_serving() {
        let (driver, _threads, _release) = recording(Duration::ZERO);
        assert!(matches!(driver.ping(), Err(HostError::InvalidOperation(_))));

        driver.shutdown();
        assert_eq!(driver.state(), SessionState::Shutdown);
        driver.wait_for_shutdown().expect("returns at once");
    }
}
