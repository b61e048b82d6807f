// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::fmt;
use std::io;

/// Everything that can go wrong calling into this crate.
#[derive(Debug)]
pub enum DispatchError {
    /// A precondition of the call was violated: double submission, submission
    /// after the operation already finished, submission to a stopped queue,
    /// or suspend/resume on the Main Queue.
    InvalidArgument(&'static str),
    /// Allocating the operation, the queue, or one of their internal buffers
    /// failed.
    OutOfMemory,
    /// The queue's worker thread could not be started.
    ThreadSpawnFailure(io::Error),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::InvalidArgument(reason) => write!(f, "invalid argument: {reason}"),
            DispatchError::OutOfMemory => f.write_str("allocation failed"),
            DispatchError::ThreadSpawnFailure(err) => write!(f, "failed to spawn worker: {err}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::ThreadSpawnFailure(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DispatchError {
    fn from(err: io::Error) -> Self {
        DispatchError::ThreadSpawnFailure(err)
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
