// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Errors surfaced by stub-thread operations.
//!
//! There are two classes of failure:
//!
//! - Setup failures ([`SetupError`]) are recoverable: the caller abandons construction of the stub
//!   thread and carries on.
//! - Protocol violations ([`FatalProtocolViolation`]) mean that the sandbox's internal bookkeeping
//!   can no longer be trusted. They are returned as values so that the call site decides where the
//!   process is torn down, but they must end in [`FatalProtocolViolation::abort`] (directly, or via
//!   [`OrAbort::or_abort`]) and never be swallowed.

use syscalls::Errno;
use systrap_util_log::Level;
use thiserror::Error;

use crate::memory_file::MemoryFileError;

/// A recoverable failure while preparing a stub thread's address space.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to map the sysmsg stack at {addr:#x}: {errno}")]
    MapStack { addr: usize, errno: Errno },
    #[error("failed to map the private stack at {addr:#x} (size {size:#x}): {errno}")]
    MapPrivateStack {
        addr: usize,
        size: usize,
        errno: Errno,
    },
    #[error("failed to map the sysmsg stack into the controller: {0}")]
    MapController(#[source] MemoryFileError),
    #[error("stack range of {len:#x} bytes cannot hold the sysmsg page (needs {needed:#x})")]
    StackTooSmall { len: usize, needed: usize },
}

/// The sandbox's internal protocol has been broken.
///
/// None of these are expected in a correctly functioning sandbox (e.g., the stub thread already
/// being gone, or a stack range being released twice). Continuing would operate on inconsistent
/// state, so the only correct handling is [`abort`](Self::abort).
#[derive(Debug, Error)]
#[must_use = "a protocol violation must end in `abort`"]
pub enum FatalProtocolViolation {
    #[error("failed to kill the stub thread {tgid}:{tid}: {errno}")]
    KillThread { tgid: i32, tid: i32, errno: Errno },
    #[error("failed to wait for the stub thread {tid}: {errno}")]
    ReapThread { tid: i32, errno: Errno },
    #[error("failed to unmap the per-thread memory at {addr:#x}: {errno}")]
    UnmapPerThreadMem { addr: usize, errno: Errno },
    #[error("failed to unmap the sysmsg stack from the controller at {addr:#x}: {errno}")]
    UnmapControllerStack { addr: usize, errno: Errno },
    #[error("failed to release the sysmsg stack: {0}")]
    ReleaseStack(#[source] MemoryFileError),
    #[error("error waiting for state: {0}")]
    WaitForState(Errno),
}

impl FatalProtocolViolation {
    /// Report the violation and abort the process.
    ///
    /// The report goes to stderr directly when error logging is gated off.
    pub fn abort(self) -> ! {
        if systrap_util_log::is_logging(Level::Error) {
            systrap_util_log::error!("fatal sysmsg protocol violation: {self}");
        } else {
            std::eprintln!("fatal sysmsg protocol violation: {self}");
        }
        std::process::abort()
    }
}

/// Extension for turning a protocol violation into an orderly abort at the call site.
///
/// ```
/// use systrap_stub::{FatalProtocolViolation, OrAbort};
///
/// fn reap() -> Result<u32, FatalProtocolViolation> {
///     Ok(7)
/// }
///
/// assert_eq!(reap().or_abort(), 7);
/// ```
pub trait OrAbort<T> {
    /// Unwrap the value, or [`abort`](FatalProtocolViolation::abort) on a violation.
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for Result<T, FatalProtocolViolation> {
    fn or_abort(self) -> T {
        self.unwrap_or_else(|violation| violation.abort())
    }
}
