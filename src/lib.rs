// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Ordered, per-queue-serial dispatch of `(function, argument)` work items.
//!
//! An [`Operation`] bundles a function with an argument and its own
//! cancellation/completion state. A [`Queue`] holds operations in a strict
//! FIFO and serializes their execution on one dedicated worker thread, so
//! work submitted to the same queue never runs concurrently with itself.
//! [`main_queue`] names a distinguished, process-wide queue with no thread
//! of its own; call [`main_queue_loop`] from whatever thread should drive it
//! (typically the program's entry thread).
//!
//! ```no_run
//! use wdispatch::{Operation, Queue};
//!
//! let queue = Queue::allocate().unwrap();
//! let op = Operation::create(|_op, path: &String| {
//!     println!("processing {path}");
//! }, "/tmp/input".to_string());
//! queue.submit(op.clone()).unwrap();
//! op.wait();
//! ```

mod error;
mod loom;
mod main_queue;
mod operation;
mod queue;

pub use error::{DispatchError, Result};
pub use main_queue::{main_queue, main_queue_loop};
pub use operation::{Operation, OperationFlags};
pub use queue::Queue;
