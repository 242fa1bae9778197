// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The interface between a stub thread and the controller that owns it.

use core::fmt;

use syscalls::{Errno, Sysno};

use crate::layout::SysmsgLayout;
use crate::memory_file::MemoryFile;

/// An OS thread of the stub process, owned by exactly one [`StubThread`](crate::StubThread).
pub trait OsThread: fmt::Display {
    /// Register block the thread was created with.
    type Regs;

    /// Thread-group id of the stub process.
    fn tgid(&self) -> i32;

    /// Kernel thread id.
    fn tid(&self) -> i32;

    /// Slot of this thread's per-thread memory in the [`SysmsgLayout`].
    fn stack_id(&self) -> u32;

    fn init_regs(&self) -> &Self::Regs;

    /// Run `sysno` inside the thread's address space, starting from `regs`, retrying if the
    /// controller is interrupted while doing so.
    fn syscall_ignore_interrupt(
        &self,
        regs: &Self::Regs,
        sysno: Sysno,
        args: &[usize],
    ) -> Result<usize, Errno>;

    /// Send `SIGKILL` to exactly this thread, directly from the controller.
    fn kill(&self) -> Result<(), Errno> {
        // SAFETY: tgkill takes no pointers.
        unsafe {
            syscalls::syscall3(
                Sysno::tgkill,
                self.tgid().cast_unsigned() as usize,
                self.tid().cast_unsigned() as usize,
                libc::SIGKILL.cast_unsigned() as usize,
            )
        }
        .map(|_| ())
    }
}

/// The controller of a stub process.
///
/// It outlives all of its stub threads; they hold it behind an `Arc` and never own it.
pub trait Subprocess {
    type Thread: OsThread;

    /// Execution context a stub thread last ran (see
    /// [`StubThread::is_last_context`](crate::StubThread::is_last_context)).
    type Context;

    /// Issue a syscall on behalf of the stub process (for instance `wait4` or `munmap` against
    /// its address space).
    fn syscall(&self, sysno: Sysno, args: &[usize]) -> Result<usize, Errno>;

    /// Return a stack id to the controller's pool. Implementations serialize their own pool
    /// access.
    fn release_stack_id(&self, stack_id: u32);

    fn memory_file(&self) -> &MemoryFile;

    fn layout(&self) -> &SysmsgLayout;
}
