//! Periodic client-side pings.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use super::RemoteTestDriver;
use crate::error::{HostError, Result};

/// Pings a remote driver every interval so its watchdog never fires while the
/// client is alive. Stops on [`stop`](Self::stop), on drop, or once the
/// remote side is gone.
pub struct KeepAlive {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    pub fn start<F>(interval: Duration, ping: F) -> Result<Self>
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("keep-alive".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = ping() {
                            if matches!(e, HostError::Disposed) {
                                debug!("Keep-alive stopped, the driver was closed");
                                return;
                            }
                            if e.is_transport() {
                                warn!(error = %e, "Keep-alive stopped, remote driver is gone");
                                return;
                            }
                            warn!(error = %e, "Keep-alive ping failed");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            })?;

        debug!(interval_ms = interval.as_millis() as u64, "Keep-alive started");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn for_driver(driver: &RemoteTestDriver, interval: Duration) -> Result<Self> {
        let driver = driver.clone();
        Self::start(interval, move || driver.ping())
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop pinging and wait for the timer thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_pings_every_interval_until_stopped() {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        let mut keep_alive = KeepAlive::start(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("start");

        thread::sleep(Duration::from_millis(250));
        assert!(keep_alive.is_running());
        keep_alive.stop();
        let seen = pings.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} pings");

        thread::sleep(Duration::from_millis(100));
        assert_eq!(pings.load(Ordering::SeqCst), seen);
        assert!(!keep_alive.is_running());
    }

    #[test]
    fn test_transport_failure_ends_the_timer() {
        let keep_alive = KeepAlive::start(Duration::from_millis(10), || {
            Err(HostError::transport("connection refused"))
        })
        .expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while keep_alive.is_running() {
            assert!(Instant::now() < deadline, "keep-alive kept running");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_closed_driver_ends_the_timer() {
        let keep_alive =
            KeepAlive::start(Duration::from_millis(10), || Err(HostError::Disposed))
                .expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while keep_alive.is_running() {
            assert!(Instant::now() < deadline, "keep-alive kept running");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_other_failures_keep_pinging() {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);
        let keep_alive = KeepAlive::start(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(HostError::invalid_operation("not serving yet"))
        })
        .expect("start");

        thread::sleep(Duration::from_millis(150));
        assert!(keep_alive.is_running());
        assert!(pings.load(Ordering::SeqCst) >= 2);
        drop(keep_alive);
    }
}
