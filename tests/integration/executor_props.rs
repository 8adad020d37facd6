//! Executor properties observed through the public API under contention

use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use hostdrive::executor::{AffineExecutor, ExecutorState};
use hostdrive::HostError;

use super::helpers::wait_until;

fn start(executor: &Arc<AffineExecutor>) -> thread::JoinHandle<hostdrive::Result<()>> {
    let runner = Arc::clone(executor);
    let handle = thread::spawn(move || runner.run());
    assert!(wait_until(|| executor.state() == ExecutorState::Processing));
    handle
}

/// Work from many submitters runs on one thread, each submitter's items in
/// submission order.
#[test]
fn test_concurrent_submitters_share_one_thread_in_order() {
    let executor = Arc::new(AffineExecutor::new());
    let handle = start(&executor);
    let executor_thread = handle.thread().id();
    let log = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(4));

    let submitters: Vec<_> = (0..4)
        .map(|submitter| {
            let executor = Arc::clone(&executor);
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for step in 0..25 {
                    let log = Arc::clone(&log);
                    let ran_on = executor
                        .invoke(move || {
                            log.lock().expect("log lock").push((submitter, step));
                            thread::current().id()
                        })
                        .expect("invoke");
                    assert_eq!(ran_on, executor_thread);
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().expect("submitter panicked");
    }

    let log = log.lock().expect("log lock").clone();
    assert_eq!(log.len(), 100);
    for submitter in 0..4 {
        let steps: Vec<_> = log
            .iter()
            .filter(|(who, _)| *who == submitter)
            .map(|(_, step)| *step)
            .collect();
        assert_eq!(steps, (0..25).collect::<Vec<_>>());
    }

    executor.shutdown();
    handle.join().expect("run panicked").expect("run");
}

/// Shutting down from inside a work item ends the loop; work queued behind
/// it is interrupted rather than run.
#[test]
fn test_shutdown_from_work_item_interrupts_the_rest() {
    let executor = Arc::new(AffineExecutor::new());
    let handle = start(&executor);
    let gate = Arc::new(Barrier::new(2));

    {
        let executor_in_item = Arc::clone(&executor);
        let gate = Arc::clone(&gate);
        executor
            .post(move || {
                gate.wait();
                executor_in_item.shutdown();
            })
            .expect("post");
    }

    let waiter = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || executor.invoke(|| "never"))
    };
    assert!(wait_until(|| executor.queued() >= 1));
    gate.wait();

    assert!(matches!(
        waiter.join().expect("waiter panicked"),
        Err(HostError::Interrupted)
    ));
    handle.join().expect("run panicked").expect("run");
    assert_eq!(executor.state(), ExecutorState::Shutdown);
    assert!(matches!(executor.invoke(|| 1), Err(HostError::InvalidOperation(_))));
}
