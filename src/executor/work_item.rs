//! Units of deferred work and their completion signals.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver};
use tracing::error;

/// What the executor decided to do with a dequeued item.
enum Disposition {
    Execute,
    Orphan,
}

/// How a blocking work item was resolved.
pub(super) enum Completion<R> {
    Returned(R),
    Panicked(Box<dyn Any + Send + 'static>),
    Interrupted,
}

/// A queued callable. Consuming it through [`WorkItem::execute`] or
/// [`WorkItem::orphan`] resolves it exactly once.
pub(super) struct WorkItem {
    task: Box<dyn FnOnce(Disposition) + Send + 'static>,
}

impl WorkItem {
    /// Work whose outcome is sent back to a waiting caller.
    pub fn blocking<F, R>(work: F) -> (Self, Receiver<Completion<R>>)
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task = move |disposition: Disposition| {
            let completion = match disposition {
                Disposition::Execute => match panic::catch_unwind(AssertUnwindSafe(work)) {
                    Ok(value) => Completion::Returned(value),
                    Err(payload) => Completion::Panicked(payload),
                },
                Disposition::Orphan => Completion::Interrupted,
            };
            // The caller may have given up waiting; nothing to report then.
            let _ = tx.send(completion);
        };
        (
            Self {
                task: Box::new(task),
            },
            rx,
        )
    }

    /// Fire-and-forget work; a panic is logged and swallowed.
    pub fn detached<F>(work: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = move |disposition: Disposition| {
            if let Disposition::Execute = disposition {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
                    error!(
                        panic = %panic_message(payload.as_ref()),
                        "Posted work item panicked"
                    );
                }
            }
        };
        Self {
            task: Box::new(task),
        }
    }

    /// No-op item used to wake a blocked run loop.
    pub fn wake() -> Self {
        Self {
            task: Box::new(|_: Disposition| {}),
        }
    }

    pub fn execute(self) {
        (self.task)(Disposition::Execute)
    }

    pub fn orphan(self) {
        (self.task)(Disposition::Orphan)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
