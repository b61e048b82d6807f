// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An ordered FIFO of [`Operation`]s served by one dedicated worker thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DispatchError, Result};
use crate::loom::sync::{Arc, Condvar, Mutex};
use crate::loom::thread;
use crate::operation::Operation;

/// Guards `operations`, `executing_operation` and `stop`.
struct GuardState {
    operations: VecDeque<Operation>,
    executing_operation: Option<Operation>,
    stop: bool,
}

/// Guards `suspended` and signals it clearing.
struct Suspend {
    suspended: Mutex<bool>,
    condition: Condvar,
}

pub(crate) struct QueueInner {
    name: Mutex<String>,
    guard: Mutex<GuardState>,
    not_empty: Condvar,
    suspend: Suspend,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    /// Number of live `Queue` handles pointing at this inner value. Tracked
    /// separately from `Arc`'s own strong count because the worker thread
    /// also holds a strong `Arc<QueueInner>` for its own lifetime (so the
    /// object outlives the last `Queue` handle until the worker has actually
    /// exited); teardown must trigger on the last *handle*, not the last
    /// `Arc` clone.
    external_refs: AtomicUsize,
    is_main: bool,
}

impl QueueInner {
    /// Records (or clears) the operation this queue's worker is currently
    /// running. Called from [`Operation::perform`] around invoking the
    /// operation's function, hence taking `&QueueInner` directly rather than
    /// `&Queue` — `perform` only has the `Arc<QueueInner>` the worker loop
    /// passes it, not an owning `Queue` handle.
    pub(crate) fn set_executing(&self, op: Option<Operation>) {
        self.guard.lock().unwrap().executing_operation = op;
    }
}

/// A handle to an ordered, single-worker-thread operation queue.
///
/// Like [`Operation`], `Queue` is reference-counted: `Clone`/`Drop` are the
/// idiomatic equivalent of the C API's `retain`/`release`. Dropping the last
/// `Queue` handle runs the teardown protocol below, unless this is the
/// Main Queue, which can never be torn down.
pub struct Queue(Arc<QueueInner>);

impl Queue {
    /// Allocates a new queue and starts its dedicated worker thread.
    pub fn allocate() -> Result<Queue> {
        Queue::new(false)
    }

    pub(crate) fn new_main() -> Queue {
        Queue::new(true).expect("main queue construction cannot fail: no worker thread is spawned")
    }

    fn new(is_main: bool) -> Result<Queue> {
        let inner = Arc::new(QueueInner {
            name: Mutex::new(String::new()),
            guard: Mutex::new(GuardState {
                operations: VecDeque::new(),
                executing_operation: None,
                stop: false,
            }),
            not_empty: Condvar::new(),
            suspend: Suspend {
                suspended: Mutex::new(false),
                condition: Condvar::new(),
            },
            worker: Mutex::new(None),
            external_refs: AtomicUsize::new(0),
            is_main,
        });

        {
            let mut name = inner.name.lock().unwrap();
            *name = if is_main {
                "WDOperationQueue main".to_string()
            } else {
                format!("WDOperationQueue {:#x}", Arc::as_ptr(&inner) as usize)
            };
        }

        if !is_main {
            let worker_inner = Arc::clone(&inner);
            let thread_name = inner.name.lock().unwrap().clone();
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || run_worker(worker_inner))
                .map_err(DispatchError::from)?;
            *inner.worker.lock().unwrap() = Some(handle);
        }

        Ok(Queue::from_inner(inner))
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Queue {
        inner.external_refs.fetch_add(1, Ordering::Relaxed);
        Queue(inner)
    }

    /// Replaces this queue's name.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.0.name.lock().unwrap() = name.into();
    }

    /// Returns a copy of this queue's current name.
    pub fn get_name(&self) -> String {
        self.0.name.lock().unwrap().clone()
    }

    /// Appends `op` to this queue's FIFO.
    ///
    /// Fails if this queue has been stopped, or if `op` is already
    /// associated with a queue (whether this one or another) or has already
    /// finished.
    pub fn submit(&self, op: Operation) -> Result<()> {
        let mut guard = self.0.guard.lock().unwrap();
        if guard.stop {
            return Err(DispatchError::InvalidArgument("queue is stopped"));
        }
        if !op.try_bind(&self.0) {
            return Err(DispatchError::InvalidArgument(
                "operation already submitted or already finished",
            ));
        }

        let was_empty = guard.operations.is_empty();
        guard.operations.push_back(op);
        drop(guard);

        tracing::trace!(queue = %self.get_name(), "submitted operation");
        if was_empty {
            self.0.not_empty.notify_one();
        }
        Ok(())
    }

    /// Pauses dispatching. In-flight work continues; new pops are deferred
    /// until [`Queue::resume`]. Rejected on the Main Queue.
    pub fn suspend(&self) -> Result<()> {
        if self.0.is_main {
            return Err(DispatchError::InvalidArgument(
                "the main queue cannot be suspended",
            ));
        }
        let mut suspended = self.0.suspend.suspended.lock().unwrap();
        if !*suspended {
            tracing::debug!(queue = %self.get_name(), "suspending");
            *suspended = true;
        }
        Ok(())
    }

    /// Resumes dispatching after [`Queue::suspend`]. Rejected on the Main
    /// Queue.
    pub fn resume(&self) -> Result<()> {
        if self.0.is_main {
            return Err(DispatchError::InvalidArgument(
                "the main queue cannot be suspended",
            ));
        }
        let mut suspended = self.0.suspend.suspended.lock().unwrap();
        if *suspended {
            tracing::debug!(queue = %self.get_name(), "resuming");
            *suspended = false;
            self.0.suspend.condition.notify_all();
        }
        Ok(())
    }

    /// Returns whether this queue is currently suspended.
    pub fn is_suspended(&self) -> bool {
        *self.0.suspend.suspended.lock().unwrap()
    }

    /// Cancels every operation currently queued, and the operation currently
    /// executing, if any. Already-finished operations are unaffected.
    pub fn cancel_all(&self) {
        let guard = self.0.guard.lock().unwrap();
        for op in guard.operations.iter() {
            op.cancel();
        }
        if let Some(op) = guard.executing_operation.as_ref() {
            op.cancel();
        }
    }

    /// Blocks until every operation submitted so far has finished.
    ///
    /// Callers must not submit to this queue from another thread while this
    /// call is in progress; doing so is undefined behaviour.
    pub fn wait_all(&self) {
        loop {
            let target = {
                let guard = self.0.guard.lock().unwrap();
                guard
                    .operations
                    .back()
                    .cloned()
                    .or_else(|| guard.executing_operation.clone())
            };
            match target {
                Some(op) => op.wait(),
                None => return,
            }
        }
    }

    /// Returns a clone of the `Arc<QueueInner>` backing this handle, for use
    /// by [`crate::main_queue::main_queue_loop`], which needs to run the
    /// worker protocol on a thread it did not spawn itself.
    pub(crate) fn inner_arc(&self) -> Arc<QueueInner> {
        Arc::clone(&self.0)
    }
}

impl Clone for Queue {
    fn clone(&self) -> Self {
        Queue::from_inner(Arc::clone(&self.0))
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        let was_last = self.0.external_refs.fetch_sub(1, Ordering::AcqRel) == 1;
        if was_last && !self.0.is_main {
            teardown(&self.0);
        }
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Queue {}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.get_name())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// The teardown protocol: stop, drain, and join.
///
/// The queued operations are dropped without being executed or marked
/// finished — any other holder of an operation reference waiting on it will
/// block forever; callers holding such a reference are responsible for
/// not waiting on it after teardown.
fn teardown(inner: &Arc<QueueInner>) {
    let name = inner.name.lock().unwrap().clone();
    tracing::debug!(queue = %name, "tearing down queue");

    {
        let mut guard = inner.guard.lock().unwrap();
        guard.stop = true;
        guard.operations.clear();
        // Nothing can forcibly preempt a running function; the best teardown
        // can do for an in-flight operation is ask it to cooperate, same as
        // `cancel_all`. If nothing is executing there is nothing to nudge —
        // the worker is necessarily parked on one of the two condition
        // variables below, and the broadcasts unblock it directly.
        if let Some(op) = guard.executing_operation.as_ref() {
            op.cancel();
        }
    }
    inner.not_empty.notify_all();
    // The worker may be parked waiting for suspend to clear; wake it too so
    // it can observe `stop`.
    inner.suspend.condition.notify_all();

    if let Some(handle) = inner.worker.lock().unwrap().take() {
        let _ = handle.join();
    }
}

/// Runs this queue's worker protocol: park on suspend, pop, perform, repeat
/// until `stop` is observed.
///
/// Used both for ordinary queues (on their dedicated spawned thread) and for
/// the Main Queue (on whichever thread calls
/// [`crate::main_queue::main_queue_loop`]).
pub(crate) fn run_worker(inner: Arc<QueueInner>) {
    let name = inner.name.lock().unwrap().clone();
    let _span = tracing::debug_span!("queue worker", queue = %name).entered();
    tracing::debug!("worker started");

    loop {
        if inner.guard.lock().unwrap().stop {
            break;
        }

        {
            let mut suspended = inner.suspend.suspended.lock().unwrap();
            while *suspended {
                tracing::trace!("suspended, parking");
                suspended = inner.suspend.condition.wait(suspended).unwrap();
                if inner.guard.lock().unwrap().stop {
                    break;
                }
            }
        }
        if inner.guard.lock().unwrap().stop {
            break;
        }

        match pop_operation(&inner) {
            Some(op) => op.perform(&inner),
            None => {
                if inner.guard.lock().unwrap().stop {
                    break;
                }
                // Suspend was toggled off again mid-wait, or this was a
                // spurious wakeup; loop and re-check from the top.
            }
        }
    }

    tracing::debug!("worker stopped");
}

/// Waits for the FIFO to become non-empty, re-checks suspend under lock
/// order guard-then-suspend, and only then removes the head.
fn pop_operation(inner: &Arc<QueueInner>) -> Option<Operation> {
    let mut guard = inner.guard.lock().unwrap();
    while guard.operations.is_empty() && !guard.stop {
        guard = inner.not_empty.wait(guard).unwrap();
    }
    if guard.operations.is_empty() {
        return None;
    }
    if *inner.suspend.suspended.lock().unwrap() {
        return None;
    }
    guard.operations.pop_front()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::operation::Operation;
    use std::sync::atomic::{AtomicBool, AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn serial_fifo_order() {
        let queue = Queue::allocate().unwrap();
        let results = Arc::new(StdMutex::new(Vec::new()));
        for i in 0..10 {
            let results = Arc::clone(&results);
            let op = Operation::create(
                move |_op: &Operation, i: &i32| results.lock().unwrap().push(*i),
                i,
            );
            queue.submit(op).unwrap();
        }
        queue.wait_all();
        assert_eq!(*results.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn suspend_defers_execution_until_resume() {
        let queue = Queue::allocate().unwrap();
        queue.suspend().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let op = Operation::create(
            move |_op: &Operation, _arg: &()| flag2.store(true, StdOrdering::SeqCst),
            (),
        );
        queue.submit(op.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(!flag.load(StdOrdering::SeqCst));
        queue.resume().unwrap();
        op.wait();
        assert!(flag.load(StdOrdering::SeqCst));
    }

    #[test]
    fn submit_rejects_already_submitted_operation() {
        let queue_a = Queue::allocate().unwrap();
        let queue_b = Queue::allocate().unwrap();
        queue_a.suspend().unwrap();
        let op = Operation::create(|_op: &Operation, _arg: &()| {}, ());
        queue_a.submit(op.clone()).unwrap();
        assert!(queue_b.submit(op).is_err());
    }

    #[test]
    fn is_suspended_defaults_to_false() {
        let queue = Queue::allocate().unwrap();
        assert!(!queue.is_suspended());
    }

    #[test]
    fn main_queue_rejects_suspend() {
        let queue = Queue::new_main();
        assert!(queue.suspend().is_err());
        assert!(queue.resume().is_err());
    }

    #[test]
    fn wait_all_on_empty_queue_returns_immediately() {
        let queue = Queue::allocate().unwrap();
        queue.wait_all();
    }

    #[test]
    fn cancel_all_cancels_every_pending_operation_but_still_finishes_them() {
        let queue = Queue::allocate().unwrap();
        queue.suspend().unwrap();
        let ran = Arc::new(StdAtomicUsize::new(0));

        let ops: Vec<Operation> = (0..5)
            .map(|_| {
                let ran = Arc::clone(&ran);
                let op = Operation::create(
                    move |_op: &Operation, _arg: &()| {
                        ran.fetch_add(1, StdOrdering::SeqCst);
                    },
                    (),
                );
                queue.submit(op.clone()).unwrap();
                op
            })
            .collect();

        queue.cancel_all();
        queue.resume().unwrap();
        queue.wait_all();

        assert_eq!(ran.load(StdOrdering::SeqCst), 0);
        for op in &ops {
            assert!(op.flags().canceled);
            assert!(op.flags().finished);
        }
    }

    #[test]
    fn name_round_trips() {
        let queue = Queue::allocate().unwrap();
        queue.set_name("queue.name");
        assert_eq!(queue.get_name(), "queue.name");
    }

    #[test]
    fn default_name_has_expected_prefix() {
        let queue = Queue::allocate().unwrap();
        assert!(queue.get_name().starts_with("WDOperationQueue "));
    }

    #[test]
    fn loom_submit_and_wait() {
        loom::model(|| {
            let queue = Queue::allocate().unwrap();
            let count = Arc::new(StdAtomicUsize::new(0));
            for _ in 0..2 {
                let count = Arc::clone(&count);
                let op = Operation::create(
                    move |_op: &Operation, _arg: &()| {
                        count.fetch_add(1, StdOrdering::SeqCst);
                    },
                    (),
                );
                queue.submit(op).unwrap();
            }
            queue.wait_all();
            assert_eq!(count.load(StdOrdering::SeqCst), 2);
        });
    }
}
