//! One-shot liveness watchdog.
//!
//! A [`Watchdog`] runs its action once if it is not [reset](Watchdog::reset)
//! within the configured timeout. It guards a remote session: every ping
//! resets it, and the action shuts the session down when pings stop.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{HostError, Result};

type Action = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Never started, or started with a zero timeout
    Idle,
    Armed,
    /// Terminal; cannot be restarted
    Stopped,
    /// Terminal; the action has been taken
    Fired,
}

struct Timer {
    phase: Phase,
    deadline: Instant,
    last_reset: Option<DateTime<Utc>>,
}

struct Shared {
    timer: Mutex<Timer>,
    changed: Condvar,
    action: Mutex<Option<Action>>,
}

impl Shared {
    fn lock_timer(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_action(&self) -> Option<Action> {
        self.action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Resettable one-shot expiry timer.
pub struct Watchdog {
    timeout: Duration,
    shared: Arc<Shared>,
}

impl Watchdog {
    /// Create a disarmed watchdog. A zero `timeout` disables it.
    pub fn new<F>(timeout: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            timeout,
            shared: Arc::new(Shared {
                timer: Mutex::new(Timer {
                    phase: Phase::Idle,
                    deadline: Instant::now(),
                    last_reset: None,
                }),
                changed: Condvar::new(),
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer for the full timeout.
    ///
    /// A zero timeout leaves the watchdog disabled. Starting an armed
    /// watchdog is a no-op; starting a stopped one fails.
    pub fn start(&self) -> Result<()> {
        let mut timer = self.shared.lock_timer();
        match timer.phase {
            Phase::Armed => return Ok(()),
            Phase::Stopped | Phase::Fired => {
                return Err(HostError::invalid_operation(
                    "a stopped watchdog cannot be restarted",
                ))
            }
            Phase::Idle => {}
        }

        if self.timeout.is_zero() {
            debug!("Watchdog timeout is zero, liveness checking disabled");
            return Ok(());
        }

        timer.phase = Phase::Armed;
        timer.deadline = Instant::now() + self.timeout;
        timer.last_reset = Some(Utc::now());

        let shared = Arc::clone(&self.shared);
        let timeout = self.timeout;
        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || run_timer(shared, timeout))?;

        debug!(timeout_ms = self.timeout.as_millis() as u64, "Watchdog armed");
        Ok(())
    }

    /// Push the deadline a full timeout into the future. No-op unless armed.
    pub fn reset(&self) {
        let mut timer = self.shared.lock_timer();
        if timer.phase == Phase::Armed {
            timer.deadline = Instant::now() + self.timeout;
            timer.last_reset = Some(Utc::now());
            self.shared.changed.notify_all();
        }
    }

    /// Disarm permanently. Safe to call repeatedly and after firing.
    pub fn stop(&self) {
        {
            let mut timer = self.shared.lock_timer();
            if timer.phase != Phase::Fired {
                timer.phase = Phase::Stopped;
            }
            self.shared.changed.notify_all();
        }
        // Release whatever the action captured.
        drop(self.shared.take_action());
    }

    pub fn is_armed(&self) -> bool {
        self.shared.lock_timer().phase == Phase::Armed
    }

    /// When the timer was last armed or reset.
    pub fn last_reset(&self) -> Option<DateTime<Utc>> {
        self.shared.lock_timer().last_reset
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(shared: Arc<Shared>, timeout: Duration) {
    {
        let mut timer = shared.lock_timer();
        loop {
            if timer.phase != Phase::Armed {
                return;
            }
            let now = Instant::now();
            if now >= timer.deadline {
                timer.phase = Phase::Fired;
                break;
            }
            let remaining = timer.deadline - now;
            timer = shared
                .changed
                .wait_timeout(timer, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // The action runs outside the timer lock: it usually calls back into stop().
    if let Some(action) = shared.take_action() {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            "Watchdog expired without a reset"
        );
        action();
    }
}
