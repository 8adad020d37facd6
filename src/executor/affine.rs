//! The executor and its run loop.

use std::collections::VecDeque;
use std::panic;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

use super::work_item::{Completion, WorkItem};
use crate::error::{HostError, Result};

const STARTING: u8 = 0;
const PROCESSING: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Lifecycle of an [`AffineExecutor`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Created; no thread has entered the run loop yet
    Starting,
    /// A thread owns the run loop and accepts work
    Processing,
    /// Terminal; no more work is accepted
    Shutdown,
}

impl ExecutorState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STARTING => Self::Starting,
            PROCESSING => Self::Processing,
            _ => Self::Shutdown,
        }
    }
}

/// Single-consumer work queue bound to one thread.
///
/// The thread calling [`run`](Self::run) becomes the executor thread for the
/// lifetime of the instance. Other threads hand it work with
/// [`invoke`](Self::invoke) (blocking) or [`post`](Self::post) (fire-and-forget).
///
/// Every accepted item is resolved exactly once: it either runs, or is
/// orphaned with [`HostError::Interrupted`] when the run loop exits.
pub struct AffineExecutor {
    state: AtomicU8,
    owner: OnceLock<ThreadId>,
    queue: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
}

impl Default for AffineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl AffineExecutor {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STARTING),
            owner: OnceLock::new(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub fn state(&self) -> ExecutorState {
        ExecutorState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Whether the calling thread is the one that entered [`run`](Self::run).
    pub fn is_executor_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    /// True iff work submitted from this thread would be queued rather than run inline.
    pub fn invoke_required(&self) -> bool {
        self.state() == ExecutorState::Processing && !self.is_executor_thread()
    }

    /// Number of items waiting in the queue.
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    /// Designate the calling thread as the executor thread and process work
    /// until [`shutdown`](Self::shutdown) is observed.
    ///
    /// May be called once per instance. Items still queued when the loop
    /// exits are orphaned, including when the loop unwinds.
    pub fn run(&self) -> Result<()> {
        let current = thread::current().id();
        if self.owner.set(current).is_err() {
            return Err(HostError::invalid_operation(
                "the executor run loop has already been entered by a thread",
            ));
        }

        let _orphans = OrphanGuard { executor: self };

        if self
            .state
            .compare_exchange(STARTING, PROCESSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Executor was shut down before its run loop started");
            return Ok(());
        }

        debug!(thread = ?current, "Executor run loop started");

        loop {
            let item = {
                let mut queue = self.lock_queue();
                loop {
                    if self.state() == ExecutorState::Shutdown {
                        debug!(pending = queue.len(), "Executor run loop observed shutdown");
                        return Ok(());
                    }
                    if let Some(item) = queue.pop_front() {
                        break item;
                    }
                    queue = self
                        .available
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            item.execute();
        }
    }

    /// Run `work` on the executor thread and wait for its result.
    ///
    /// Called from the executor thread while processing, `work` runs inline.
    /// A panic inside `work` is resumed on the calling thread.
    pub fn invoke<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_executor_thread() && self.state() == ExecutorState::Processing {
            trace!("Invoking work inline on the executor thread");
            return Ok(work());
        }

        let (item, completion) = WorkItem::blocking(work);
        self.enqueue(item)?;

        match completion.recv() {
            Ok(Completion::Returned(value)) => Ok(value),
            Ok(Completion::Panicked(payload)) => panic::resume_unwind(payload),
            Ok(Completion::Interrupted) | Err(_) => Err(HostError::Interrupted),
        }
    }

    /// Queue `work` without waiting for it.
    pub fn post<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(WorkItem::detached(work))
    }

    /// Move to [`ExecutorState::Shutdown`] and wake the run loop.
    ///
    /// Idempotent: only the first call enqueues the wake-up item.
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

        debug!("Executor shutdown requested");
        self.lock_queue().push_back(WorkItem::wake());
        self.available.notify_all();
    }

    fn enqueue(&self, item: WorkItem) -> Result<()> {
        let mut queue = self.lock_queue();
        // Checked under the queue lock so nothing slips in after the final drain.
        if self.state() != ExecutorState::Processing {
            return Err(HostError::invalid_operation(
                "the executor is not processing work",
            ));
        }
        queue.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves everything left in the queue when the run loop exits.
struct OrphanGuard<'a> {
    executor: &'a AffineExecutor,
}

impl Drop for OrphanGuard<'_> {
    fn drop(&mut self) {
        let orphans: Vec<WorkItem> = {
            let mut queue = self.executor.lock_queue();
            self.executor.state.store(SHUTDOWN, Ordering::Release);
            queue.drain(..).collect()
        };

        if !orphans.is_empty() {
            debug!(count = orphans.len(), "Orphaning queued work items");
        }
        for item in orphans {
            item.orphan();
        }
    }
}
