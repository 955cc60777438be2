//! Bounded parallel execution of asynchronous tasks.
//!
//! Every recovery broadcast runs through this driver: N tasks with
//! send/poll/finish semantics, at most K in flight at once. Tasks may
//! complete out of order. Cancellation is not supported; timeouts are
//! the transport's concern.

use std::thread;

/// One asynchronous task in a bounded batch.
///
/// The driver calls `send` once, polls `is_ready`, and calls `wait`
/// exactly once after readiness; `is_done` must be true after `wait`
/// returns. Failures are the task's problem: a failed RPC should leave
/// the task done with whatever fallback result it chooses.
pub trait ParallelTask {
    /// Start the task (typically: issue the RPC).
    fn send(&mut self);

    /// Check whether `wait` would complete without blocking.
    fn is_ready(&self) -> bool;

    /// Finish the task, consuming its result.
    fn wait(&mut self);

    /// Check whether the task has finished.
    fn is_done(&self) -> bool;
}

/// Run all tasks, keeping at most `max_outstanding` in flight.
pub fn parallel_run<T: ParallelTask>(tasks: &mut [T], max_outstanding: usize) {
    let total = tasks.len();
    if total == 0 {
        return;
    }
    let max_outstanding = max_outstanding.max(1);

    let initial = total.min(max_outstanding);
    for task in tasks.iter_mut().take(initial) {
        task.send();
    }
    let mut first_not_issued = initial;

    loop {
        let mut all_done = true;
        for i in 0..first_not_issued {
            if tasks[i].is_done() {
                continue;
            }
            if tasks[i].is_ready() {
                tasks[i].wait();
                debug_assert!(tasks[i].is_done());
                if first_not_issued < total {
                    tasks[first_not_issued].send();
                    first_not_issued += 1;
                    all_done = false;
                }
            } else {
                all_done = false;
            }
        }
        if all_done && first_not_issued == total {
            return;
        }
        thread::yield_now();
    }
}
