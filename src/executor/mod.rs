//! Thread-affine work execution.
//!
//! An [`AffineExecutor`] binds queued work to one designated thread. Any other
//! thread may submit work and block until it completes; the designated thread
//! drains the queue in FIFO order until the executor is shut down.

mod affine;
mod work_item;


pub use affine::{AffineExecutor, ExecutorState};
pub(crate) use work_item::panic_message;
