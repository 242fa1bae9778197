// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Stub threads: untraced threads of a stub process that run application code and talk to the
//! controller through a shared [`Msg`].

use core::fmt;
use core::ptr::NonNull;
use std::sync::{Arc, Weak};

use nix::sys::mman::{MapFlags, ProtFlags};
use syscalls::Sysno;
use systrap_util_log::Level;

use crate::error::{FatalProtocolViolation, SetupError};
use crate::futex::{WaitOutcome, futex_wait_for_state};
use crate::interrupt;
use crate::memory_file::FileRange;
use crate::subprocess::{OsThread, Subprocess};
use crate::sysmsg::{Msg, ThreadState};

/// A stub thread and the resources it holds in both address spaces.
///
/// Owns its OS thread and its sysmsg stack range. Both are released by [`destroy`](Self::destroy),
/// which must be called exactly once; dropping a `StubThread` without destroying it leaks them.
pub struct StubThread<S: Subprocess> {
    subproc: Arc<S>,
    thread: S::Thread,
    /// Start of the controller's shared mapping of `stack_range`.
    stack_mapping: NonNull<u8>,
    msg: NonNull<Msg>,
    last_context: Weak<S::Context>,
    stack_range: FileRange,
    fpu_state_to_msg_offset: usize,
}

// SAFETY: `stack_mapping` and `msg` point into a shared mapping owned by this `StubThread` and
// only unmapped by `destroy`, which consumes it. `Msg` is made of atomics.
unsafe impl<S> Send for StubThread<S>
where
    S: Subprocess + Send + Sync,
    S::Thread: Send,
    S::Context: Send + Sync,
{
}

// SAFETY: see `Send`; shared access to the mapping only goes through `&Msg`.
unsafe impl<S> Sync for StubThread<S>
where
    S: Subprocess + Send + Sync,
    S::Thread: Sync,
    S::Context: Send + Sync,
{
}

impl<S: Subprocess> StubThread<S> {
    /// Wrap `thread`, taking ownership of `stack_range` (allocated from the subprocess's memory
    /// file) and mapping it into the controller.
    ///
    /// On error, `stack_range` still belongs to the caller.
    pub fn new(
        subproc: Arc<S>,
        thread: S::Thread,
        stack_range: FileRange,
    ) -> Result<Self, SetupError> {
        let layout = subproc.layout();
        let needed = layout.min_shared_stack_len();
        if stack_range.len() < needed {
            return Err(SetupError::StackTooSmall {
                len: stack_range.len(),
                needed,
            });
        }
        let msg_offset = layout.msg_offset();
        let fpu_state_to_msg_offset = layout.fpu_state_offset() - msg_offset;
        let stack_mapping = subproc
            .memory_file()
            .map_shared(stack_range)
            .map_err(SetupError::MapController)?;
        // SAFETY: `msg_offset + size_of::<Msg>()` is within the mapping (checked above), and the
        // message page is page-aligned.
        let msg = unsafe { stack_mapping.add(msg_offset).cast::<Msg>() };
        // SAFETY: `msg` is valid for writes and suitably aligned; the stub is not running yet.
        unsafe { msg.write(Msg::new()) };
        systrap_util_log::debug!(
            "stub thread {thread}: sysmsg stack {stack_range} mapped at {:#x}",
            stack_mapping.as_ptr() as usize
        );
        Ok(Self {
            subproc,
            thread,
            stack_mapping,
            msg,
            last_context: Weak::new(),
            stack_range,
            fpu_state_to_msg_offset,
        })
    }

    pub fn thread(&self) -> &S::Thread {
        &self.thread
    }

    pub fn subprocess(&self) -> &Arc<S> {
        &self.subproc
    }

    pub fn stack_range(&self) -> FileRange {
        self.stack_range
    }

    /// The shared message, as seen from the controller.
    pub fn msg(&self) -> &Msg {
        // SAFETY: the mapping stays in place until `destroy` consumes `self`.
        unsafe { self.msg.as_ref() }
    }

    /// The thread's saved FPU state, next to the message in the shared stack.
    pub fn fpu_state_ptr(&self) -> NonNull<u8> {
        // SAFETY: the FPU state offset lies inside the message page of the mapping.
        unsafe { self.msg.cast::<u8>().add(self.fpu_state_to_msg_offset) }
    }

    /// Address of this thread's per-thread memory in the stub's address space.
    pub fn sysmsg_per_thread_mem_addr(&self) -> usize {
        self.subproc
            .layout()
            .per_thread_mem_addr(self.thread.stack_id())
    }

    /// Map the sysmsg stack at `addr` in the stub's address space, shared with the controller.
    pub fn map_stack(&self, addr: usize, read_only: bool) -> Result<(), SetupError> {
        let mut prot = ProtFlags::PROT_READ;
        if !read_only {
            prot |= ProtFlags::PROT_WRITE;
        }
        let flags = MapFlags::MAP_SHARED | MapFlags::MAP_FIXED;
        let fd = self.subproc.memory_file().fd_arg();
        self.thread
            .syscall_ignore_interrupt(
                self.thread.init_regs(),
                Sysno::mmap,
                &[
                    addr,
                    self.stack_range.len(),
                    prot.bits().cast_unsigned() as usize,
                    flags.bits().cast_unsigned() as usize,
                    fd,
                    self.stack_range.start,
                ],
            )
            .map(|_| ())
            .map_err(|errno| SetupError::MapStack { addr, errno })
    }

    /// Map `size` bytes of private, zeroed, read-write memory at `addr` in the stub's address space.
    pub fn map_private_stack(&self, addr: usize, size: usize) -> Result<(), SetupError> {
        let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
        let flags = MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS | MapFlags::MAP_FIXED;
        self.thread
            .syscall_ignore_interrupt(
                self.thread.init_regs(),
                Sysno::mmap,
                &[
                    addr,
                    size,
                    prot.bits().cast_unsigned() as usize,
                    flags.bits().cast_unsigned() as usize,
                    0,
                    0,
                ],
            )
            .map(|_| ())
            .map_err(|errno| SetupError::MapPrivateStack { addr, size, errno })
    }

    /// Switch the stub to `target` and block until it acknowledges, or until `interruptor`
    /// fires.
    ///
    /// With [`ThreadState::None`] no request is made, and the call only consumes the most recent
    /// acknowledgement.
    pub fn wait_event(
        &self,
        target: ThreadState,
        interruptor: &interrupt::Forwarder,
    ) -> Result<WaitOutcome, FatalProtocolViolation> {
        let msg = self.msg();
        let mut acked = msg.acked_events();
        let mut wakeup = false;
        if target == ThreadState::None {
            acked = acked.wrapping_sub(1);
        } else {
            msg.set_state(target);
            wakeup = !msg.stub_fast_path();
        }
        futex_wait_for_state(msg, wakeup, acked, interruptor)
            .map_err(FatalProtocolViolation::WaitForState)
    }

    /// Kill the thread and release everything it holds, in this order: the OS thread, the
    /// per-thread memory in the stub, the stack id, the controller's mapping, and the stack range.
    ///
    /// Every error is a protocol violation; resources after the failing step are not released.
    pub fn destroy(self) -> Result<(), FatalProtocolViolation> {
        let _span = systrap_util_log::debug_span!("stub_thread_destroy");
        let tgid = self.thread.tgid();
        let tid = self.thread.tid();

        self.thread
            .kill()
            .map_err(|errno| FatalProtocolViolation::KillThread { tgid, tid, errno })?;
        self.subproc
            .syscall(
                Sysno::wait4,
                &[
                    tid.cast_unsigned() as usize,
                    0,
                    libc::__WALL.cast_unsigned() as usize,
                    0,
                ],
            )
            .map_err(|errno| FatalProtocolViolation::ReapThread { tid, errno })?;

        let addr = self.sysmsg_per_thread_mem_addr();
        self.subproc
            .syscall(
                Sysno::munmap,
                &[addr, self.subproc.layout().per_thread_mem_size()],
            )
            .map_err(|errno| FatalProtocolViolation::UnmapPerThreadMem { addr, errno })?;

        self.subproc.release_stack_id(self.thread.stack_id());

        let mapping = self.stack_mapping.as_ptr() as usize;
        // SAFETY: the controller mapping was created in `new` and nothing refers to it once `self`
        // is consumed.
        unsafe { syscalls::syscall2(Sysno::munmap, mapping, self.stack_range.len()) }.map_err(
            |errno| FatalProtocolViolation::UnmapControllerStack {
                addr: mapping,
                errno,
            },
        )?;

        self.subproc
            .memory_file()
            .dec_ref(self.stack_range)
            .map_err(FatalProtocolViolation::ReleaseStack)?;
        systrap_util_log::debug!("stub thread {} destroyed", self.thread);
        Ok(())
    }

    /// Log `args` with the thread's identity and the current message, if debug logging is on.
    pub fn debugf(&self, args: fmt::Arguments<'_>) {
        if !systrap_util_log::is_logging(Level::Debug) {
            return;
        }
        systrap_util_log::debug!("{}: {}: {}", self.thread, args, self.msg());
    }

    /// Remember `ctx` as the context that last ran on this thread.
    pub fn set_last_context(&mut self, ctx: &Arc<S::Context>) {
        self.last_context = Arc::downgrade(ctx);
    }

    /// Whether `ctx` is the context that last ran here. If not, the thread's state must be
    /// reloaded (or the thread recreated) before running `ctx`.
    pub fn is_last_context(&self, ctx: &Arc<S::Context>) -> bool {
        self.last_context
            .upgrade()
            .is_some_and(|last| Arc::ptr_eq(&last, ctx))
    }
}

impl<S: Subprocess> fmt::Display for StubThread<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub thread {} (stack {})", self.thread, self.stack_range)
    }
}
