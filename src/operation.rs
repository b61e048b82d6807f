// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A one-shot unit of work: a function plus an opaque argument, carrying its
//! own cancellation and completion state.

use crate::loom::sync::{Arc, Condvar, Mutex, Weak};
use crate::queue::{Queue, QueueInner};

/// A snapshot of an [`Operation`]'s lifecycle flags.
///
/// `canceled` and `finished` are each individually monotonic: once observed
/// `true` they remain `true` for the lifetime of the operation. The three
/// fields are read under separate locks (see [`Operation::flags`]), so this
/// snapshot is not atomic across fields, only adequate for progress checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationFlags {
    pub canceled: bool,
    pub executing: bool,
    pub finished: bool,
}

/// Guards `queue`, `canceled` and `executing`.
struct Guard {
    queue: Option<Weak<QueueInner>>,
    canceled: bool,
    executing: bool,
}

/// Guards `finished` and signals its waiters.
struct Wait {
    finished: Mutex<bool>,
    condition: Condvar,
}

struct OperationInner {
    function: Mutex<Option<Box<dyn FnOnce(&Operation) + Send>>>,
    guard: Mutex<Guard>,
    wait: Wait,
}

/// A handle to a submitted (or not-yet-submitted) unit of work.
///
/// `Operation` is reference-counted: cloning it is the equivalent of the C
/// API's `retain`, and dropping the last clone is the equivalent of
/// `release`. There is no separate `retain`/`release` pair in this crate —
/// `Clone`/`Drop` on this handle are that mechanism (see `DESIGN.md`, Open
/// Question 1).
#[derive(Clone)]
pub struct Operation(Arc<OperationInner>);

impl Operation {
    /// Creates a new, not-yet-submitted operation.
    ///
    /// `argument` is moved into the operation and handed back to `function`
    /// by reference when it runs; this is the idiomatic-Rust equivalent of
    /// the C API retaining a reference on a caller-supplied context pointer.
    /// `function` also receives `&Operation`, so the work being performed
    /// can inspect its own flags (to cooperate with [`Operation::cancel`])
    /// or ask [`Operation::current_queue`] — for example to submit further
    /// work onto the queue it is currently running on.
    ///
    /// Rust's type system makes a null function pointer unrepresentable, so
    /// unlike the C API this constructor cannot fail with `InvalidArgument`
    /// for that reason (see `DESIGN.md`, Open Question 2).
    pub fn create<A, F>(function: F, argument: A) -> Operation
    where
        A: Send + 'static,
        F: FnOnce(&Operation, &A) + Send + 'static,
    {
        let boxed: Box<dyn FnOnce(&Operation) + Send> =
            Box::new(move |op: &Operation| function(op, &argument));

        Operation(Arc::new(OperationInner {
            function: Mutex::new(Some(boxed)),
            guard: Mutex::new(Guard {
                queue: None,
                canceled: false,
                executing: false,
            }),
            wait: Wait {
                finished: Mutex::new(false),
                condition: Condvar::new(),
            },
        }))
    }

    /// Requests that this operation's function not be invoked.
    ///
    /// Monotonic and idempotent: cancelling a cancelled or already-finished
    /// operation is a no-op. This never preempts a function that is already
    /// running — the function must cooperate by polling
    /// [`Operation::flags`].
    pub fn cancel(&self) {
        let mut guard = self.0.guard.lock().unwrap();
        if !guard.canceled {
            tracing::trace!("operation canceled");
        }
        guard.canceled = true;
    }

    /// Reads this operation's current lifecycle flags.
    pub fn flags(&self) -> OperationFlags {
        let guard = self.0.guard.lock().unwrap();
        let finished = *self.0.wait.finished.lock().unwrap();
        OperationFlags {
            canceled: guard.canceled,
            executing: guard.executing,
            finished,
        }
    }

    /// Returns the queue this operation is currently associated with.
    ///
    /// Set when the operation is submitted via [`Queue::submit`] and cleared
    /// once it finishes (whether it ran or was skipped due to
    /// cancellation) — so this is `Some` for the operation's entire time on
    /// a queue, not only while its function is actually running. A function
    /// can call this on its own `&Operation` to find the queue it was
    /// dispatched onto, e.g. to submit further work there.
    pub fn current_queue(&self) -> Option<Queue> {
        let guard = self.0.guard.lock().unwrap();
        let weak = guard.queue.as_ref()?;
        weak.upgrade().map(Queue::from_inner)
    }

    /// Blocks the calling thread until this operation reaches `finished`.
    ///
    /// Returns immediately if the operation has already finished. Calling
    /// this from the same serial queue that owns the operation deadlocks —
    /// that queue's one worker thread is the only thing that can ever make
    /// the operation finish.
    pub fn wait(&self) {
        let mut finished = self.0.wait.finished.lock().unwrap();
        while !*finished {
            finished = self.0.wait.condition.wait(finished).unwrap();
        }
    }

    /// Attempts to associate this operation with `queue`, failing if it is
    /// already finished or already associated with some queue.
    ///
    /// This check-and-set happens under a single lock so that two
    /// concurrent submissions of the same operation (to the same queue or
    /// different queues) can never both succeed.
    pub(crate) fn try_bind(&self, queue: &Arc<QueueInner>) -> bool {
        if *self.0.wait.finished.lock().unwrap() {
            return false;
        }
        let mut guard = self.0.guard.lock().unwrap();
        if guard.queue.is_some() {
            return false;
        }
        guard.queue = Some(Arc::downgrade(queue));
        true
    }

    /// The worker-thread execution protocol: skip canceled work, otherwise
    /// run the function with no lock held, then mark finished and wake
    /// waiters.
    ///
    /// Runs the function with neither `guard` nor `wait` held, so the
    /// function may call back into the queue it is running on (submit more
    /// work, read its own current queue) without self-deadlocking.
    pub(crate) fn perform(&self, queue: &Arc<QueueInner>) {
        let ready = {
            let mut guard = self.0.guard.lock().unwrap();
            if guard.canceled {
                tracing::debug!("skipping canceled operation");
                None
            } else {
                guard.executing = true;
                drop(guard);

                queue.set_executing(Some(self.clone()));

                self.0.function.lock().unwrap().take()
            }
        };

        if let Some(run) = ready {
            tracing::trace!("performing operation");
            run(self);
        }

        {
            let mut guard = self.0.guard.lock().unwrap();
            guard.executing = false;
            guard.queue = None;
        }
        queue.set_executing(None);

        {
            let mut finished = self.0.wait.finished.lock().unwrap();
            *finished = true;
        }
        self.0.wait.condition.notify_all();
        tracing::trace!("operation finished");
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.flags();
        f.debug_struct("Operation")
            .field("canceled", &flags.canceled)
            .field("executing", &flags.executing)
            .field("finished", &flags.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::queue::Queue;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    #[test]
    fn flags_start_all_false() {
        let op = Operation::create(|_op: &Operation, _arg: &()| {}, ());
        let flags = op.flags();
        assert!(!flags.canceled);
        assert!(!flags.executing);
        assert!(!flags.finished);
    }

    #[test]
    fn cancel_is_idempotent() {
        let op = Operation::create(|_op: &Operation, _arg: &()| {}, ());
        op.cancel();
        op.cancel();
        assert!(op.flags().canceled);
    }

    #[test]
    fn wait_on_finished_operation_returns_immediately() {
        let queue = Queue::allocate().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let op = Operation::create(
            move |_op: &Operation, _arg: &()| ran2.store(true, Ordering::SeqCst),
            (),
        );
        queue.submit(op.clone()).unwrap();
        op.wait();
        assert!(ran.load(Ordering::SeqCst));
        assert!(op.flags().finished);
        // Second wait must not block.
        op.wait();
    }

    #[test]
    fn canceled_before_pop_skips_function_but_still_finishes() {
        let queue = Queue::allocate().unwrap();
        queue.suspend().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let op = Operation::create(
            move |_op: &Operation, _arg: &()| ran2.store(true, Ordering::SeqCst),
            (),
        );
        queue.submit(op.clone()).unwrap();
        op.cancel();
        queue.resume().unwrap();
        op.wait();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(op.flags().finished);
        assert!(op.flags().canceled);
    }

    #[test]
    fn current_queue_is_set_only_during_execution() {
        let queue = Queue::allocate().unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = Arc::clone(&barrier);
        let seen_during = Arc::new(Mutex::new(false));
        let seen_during2 = Arc::clone(&seen_during);
        let op = Operation::create(
            move |op: &Operation, _arg: &()| {
                *seen_during2.lock().unwrap() = op.current_queue().is_some();
                barrier2.wait();
            },
            (),
        );
        assert!(op.current_queue().is_none());
        queue.submit(op.clone()).unwrap();
        barrier.wait();
        op.wait();
        assert!(*seen_during.lock().unwrap());
        assert!(op.current_queue().is_none());
    }

    #[test]
    fn loom_single_submission_completes() {
        loom::model(|| {
            let queue = Queue::allocate().unwrap();
            let op = Operation::create(|_op: &Operation, _arg: &()| {}, ());
            queue.submit(op.clone()).unwrap();
            op.wait();
            assert!(op.flags().finished);
        });
    }
}
