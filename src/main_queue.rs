// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide Main Queue: a distinguished [`Queue`] with no dedicated
//! worker thread of its own, served instead by whichever thread calls
//! [`main_queue_loop`].

use std::sync::OnceLock;

use crate::queue::{self, Queue};

static MAIN_QUEUE: OnceLock<Queue> = OnceLock::new();

/// Returns the process's Main Queue, creating it on first call.
///
/// The returned handle can be cloned and shared freely; the Main Queue is
/// never torn down by dropping handles (see [`crate::queue::Queue`]'s
/// `Drop` impl), only by the process exiting.
pub fn main_queue() -> Queue {
    MAIN_QUEUE.get_or_init(Queue::new_main).clone()
}

/// Runs the Main Queue's worker protocol on the calling thread.
///
/// Unlike an ordinary queue, the Main Queue has no thread of its own — it is
/// inert until some thread (conventionally the program's entry thread) calls
/// this function, which adopts the calling thread as its worker and blocks
/// running the same pop-and-perform loop an ordinary queue's dedicated
/// thread would run. There is no supported way to tear down the Main Queue
/// short of process exit, so in practice this call does not return.
pub fn main_queue_loop() -> ! {
    let queue = main_queue();
    queue::run_worker(queue.inner_arc());
    unreachable!("the main queue's worker loop only exits when stopped, which never happens")
}
