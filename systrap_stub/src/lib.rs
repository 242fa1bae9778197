// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stub threads for the systrap platform.
//!
//! A stub thread is an untraced OS thread in a sandboxed stub process. It runs application code
//! natively and, whenever it needs the controller, exchanges requests and acknowledgements with
//! it through a [`sysmsg::Msg`] in memory shared between the two processes. This crate provides:
//!
//! - [`StubThread`]: construction, stack mapping, the wait/acknowledge handshake, and ordered
//!   teardown of one such thread.
//! - [`sysmsg`] and [`futex`]: the shared message and the futex protocol around it.
//! - [`seccomp`]: the filter that confines stub threads to the syscalls their code page makes.
//! - [`memory_file`] and [`layout`]: where the shared stacks come from and where they go.
//!
//! The controller itself (and its OS threads) are abstracted by the [`Subprocess`] and
//! [`OsThread`] traits.

#![cfg(target_os = "linux")]

pub mod error;
pub mod futex;
pub mod id_pool;
pub mod interrupt;
pub mod layout;
pub mod memory_file;
pub mod seccomp;
pub mod stub_thread;
pub mod subprocess;
pub mod sysmsg;

#[cfg(test)]
mod mock;

pub use error::{FatalProtocolViolation, OrAbort, SetupError};
pub use futex::WaitOutcome;
pub use layout::{ConfigError, SysmsgLayout};
pub use memory_file::{FileRange, MemoryFile, MemoryFileError};
pub use stub_thread::StubThread;
pub use subprocess::{OsThread, Subprocess};
pub use sysmsg::{Msg, ThreadState};
